//! mixctl
//!
//! A TCP load balancer. Each rule binds one local address and forwards every
//! accepted connection to an upstream picked uniformly at random from the
//! rule's pool, relaying bytes in both directions until either side closes.

pub mod config;
pub mod error;
pub mod forwarder;
pub mod relay;
pub mod supervisor;

// Re-export commonly used types and functions
pub use config::{ForwardingSet, Rule, expand_upstreams, load_config};
pub use error::{Direction, ForwardError, SupervisorError};
pub use forwarder::{DEFAULT_DIAL_TIMEOUT, ForwardOptions, RuleForwarder, dial, pick_upstream};
pub use relay::{BUFFER_SIZE, RelayStats, pipe};
pub use supervisor::{FailurePolicy, Supervisor};
