use std::{fmt, io, time::Duration};
use thiserror::Error;

/// Which half of a relayed connection an I/O error happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToUpstream => f.write_str("client->upstream"),
            Self::UpstreamToClient => f.write_str("upstream->client"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("rule '{rule}' has no upstream addresses")]
    NoUpstreams { rule: String },

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection on {addr}: {source}")]
    Accept {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to dial upstream {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out dialing upstream {addr} after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("transport error ({direction}): {source}")]
    Transport {
        direction: Direction,
        #[source]
        source: io::Error,
    },
}

impl ForwardError {
    /// Fatal errors end the rule's forwarder. The rest only affect one connection.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoUpstreams { .. } | Self::Bind { .. } | Self::Accept { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("rule '{rule}' failed: {source}")]
    RuleFailed {
        rule: String,
        #[source]
        source: ForwardError,
    },

    #[error("all rules failed: {}", failed.join(", "))]
    AllRulesFailed { failed: Vec<String> },

    #[error("forwarder for rule '{rule}' panicked: {source}")]
    Panicked {
        rule: String,
        #[source]
        source: tokio::task::JoinError,
    },
}
