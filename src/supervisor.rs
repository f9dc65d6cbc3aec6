use std::collections::HashMap;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ForwardingSet, Rule};
use crate::error::{ForwardError, SupervisorError};
use crate::forwarder::{ForwardOptions, RuleForwarder};

/// What the supervisor does when one rule's forwarder dies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log the failed rule and keep the others serving.
    #[default]
    Isolate,
    /// Stop every rule as soon as any one of them fails.
    FailFast,
}

/// Runs one forwarder per rule and waits for all of them.
pub struct Supervisor {
    rules: Vec<Rule>,
    options: ForwardOptions,
    policy: FailurePolicy,
}

impl Supervisor {
    #[must_use]
    pub fn new(set: ForwardingSet, options: ForwardOptions) -> Self {
        Self {
            rules: set.rules,
            options,
            policy: FailurePolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Serves every rule until `shutdown` fires.
    ///
    /// Returns `Ok(())` once all surviving forwarders have drained after
    /// shutdown. Under [`FailurePolicy::Isolate`] it only fails when no rule is
    /// left serving; under [`FailurePolicy::FailFast`] the first fatal rule
    /// error cancels `shutdown` and is returned.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SupervisorError> {
        for rule in &self.rules {
            info!(rule = %rule.name, from = %rule.from, to = ?rule.to, "Forward");
        }

        let mut forwarders = JoinSet::new();
        let mut names = HashMap::new();

        for (index, rule) in self.rules.into_iter().enumerate() {
            // Each rule gets its own generator. A fixed seed is spread across rules.
            let options = ForwardOptions {
                seed: self.options.seed.map(|seed| seed.wrapping_add(index as u64)),
                ..self.options.clone()
            };
            let name = rule.name.clone();
            let handle = forwarders.spawn(run_rule(rule, options, shutdown.clone()));
            names.insert(handle.id(), name);
        }

        await_forwarders(forwarders, names, self.policy, &shutdown).await
    }
}

/// Collects forwarder outcomes as they finish and applies `policy` to failures.
async fn await_forwarders(
    mut forwarders: JoinSet<Result<(), ForwardError>>,
    mut names: HashMap<task::Id, String>,
    policy: FailurePolicy,
    shutdown: &CancellationToken,
) -> Result<(), SupervisorError> {
    let total = forwarders.len();
    let mut failed = Vec::new();

    while let Some(joined) = forwarders.join_next_with_id().await {
        let id = match &joined {
            Ok((id, _)) => *id,
            Err(e) => e.id(),
        };
        let name = names
            .remove(&id)
            .unwrap_or_else(|| format!("task {id}"));

        let reason = match joined {
            Ok((_, Ok(()))) => continue,
            Ok((_, Err(source))) => {
                if policy == FailurePolicy::FailFast {
                    error!(rule = %name, error = %source, "Rule failed, stopping all rules");
                    shutdown.cancel();
                    return Err(SupervisorError::RuleFailed { rule: name, source });
                }
                source.to_string()
            }
            Err(e) => {
                error!(rule = %name, error = %e, "Forwarder task panicked");
                if policy == FailurePolicy::FailFast {
                    shutdown.cancel();
                    return Err(SupervisorError::Panicked { rule: name, source: e });
                }
                e.to_string()
            }
        };

        warn!(
            rule = %name,
            error = %reason,
            remaining = total - failed.len() - 1,
            "Rule failed, other rules keep serving"
        );
        failed.push(name);
        if failed.len() == total {
            return Err(SupervisorError::AllRulesFailed { failed });
        }
    }

    if !failed.is_empty() {
        warn!(failed = ?failed, "Stopped with failed rules");
    }
    Ok(())
}

async fn run_rule(
    rule: Rule,
    options: ForwardOptions,
    shutdown: CancellationToken,
) -> Result<(), ForwardError> {
    RuleForwarder::bind(rule, options)
        .await?
        .serve(shutdown)
        .await
}
