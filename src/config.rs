use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{collections::HashSet, fs, path::Path};

/// Prefix marking an upstream entry that should be read from a file, one
/// address per line.
pub const FILE_UPSTREAM_PREFIX: &str = "file:";

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardingSet {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// A named binding of one local listen address to a pool of upstreams.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Rule {
    pub name: String,
    pub from: String,
    pub to: Vec<String>,
    /// Ceiling on concurrently relayed connections for this rule. Unlimited when unset.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

impl Rule {
    pub fn new(name: impl Into<String>, from: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            name: name.into(),
            from: from.into(),
            to,
            max_connections: None,
        }
    }
}

impl ForwardingSet {
    /// Parses a rule set from TOML text, expanding `file:` upstreams and
    /// validating the result.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut set: Self =
            toml::from_str(content).context("Failed to parse rules as valid TOML")?;

        for rule in &mut set.rules {
            rule.to = expand_upstreams(&rule.to)
                .with_context(|| format!("Failed to expand upstreams for rule '{}'", rule.name))?;
        }

        set.validate()?;
        Ok(set)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rules.is_empty() {
            bail!("No rules found");
        }

        let mut bound = HashSet::new();
        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                bail!("Rule with from = '{}' has an empty name", rule.from);
            }
            if rule.from.trim().is_empty() {
                bail!("Rule '{}' has an empty 'from' address", rule.name);
            }
            if rule.to.is_empty() {
                bail!("Rule '{}' has no upstream addresses", rule.name);
            }
            if rule.to.iter().any(|addr| addr.trim().is_empty()) {
                bail!("Rule '{}' contains a blank upstream address", rule.name);
            }
            if rule.max_connections == Some(0) {
                bail!("Rule '{}' sets max_connections to 0", rule.name);
            }
            if !bound.insert(rule.from.as_str()) {
                bail!(
                    "Rule '{}' listens on {} which is already used by another rule",
                    rule.name,
                    rule.from
                );
            }
        }

        Ok(())
    }
}

/// Replaces every `file:<path>` entry with the addresses listed in that file.
/// Blank lines are skipped and each line is trimmed. Other entries are kept in order.
pub fn expand_upstreams(entries: &[String]) -> Result<Vec<String>> {
    let mut upstreams = Vec::with_capacity(entries.len());

    for entry in entries {
        let Some(path) = entry.strip_prefix(FILE_UPSTREAM_PREFIX) else {
            upstreams.push(entry.clone());
            continue;
        };

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read upstream file {path}"))?;
        upstreams.extend(
            content
                .replace("\r\n", "\n")
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(ToString::to_string),
        );
    }

    Ok(upstreams)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<ForwardingSet> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read rules file {}", path.display()))?;
    ForwardingSet::from_toml(&content)
        .with_context(|| format!("Invalid rules file {}", path.display()))
}
