use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Transport and protocol failures are recovered locally by the session or
/// chain that hit them; policy rejects close the offending connection;
/// queue exhaustion is absorbed by the pacing policy and never surfaces
/// past the queue module. `Internal` means a broken invariant and is fatal
/// at the call site.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("policy reject: {0}")]
    PolicyReject(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("internal error: {0}")]
    Internal(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
