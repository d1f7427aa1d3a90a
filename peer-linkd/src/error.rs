use thiserror::Error;

/// Failures surfaced to the caller of a core command.
///
/// None of these are fatal: after any of them the coordinator is back in a
/// usable state and the command can simply be issued again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum P2pError {
    #[error("peer-to-peer radio is disabled")]
    RadioDisabled,
    #[error("a service is already advertised, withdraw it first")]
    AlreadyAdvertising,
    #[error("no service is advertised")]
    NotAdvertising,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("service advertisement failed: {0}")]
    AdvertiseFailed(String),
    #[error("group creation failed: {0}")]
    GroupFailed(String),
    #[error("no peer at index {index} ({len} known)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("group negotiation timed out")]
    NegotiationTimeout,
    #[error("coordinator is not running")]
    Unavailable,
}

pub type P2pResult<T> = std::result::Result<T, P2pError>;
