use thiserror::Error;

use mirrex_model::Errno;

/// Failures raised while assembling or running a replica set, as opposed to
/// per-operation errnos which travel as [`Errno`] values.
#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("configuration rejected: {0}")]
    Config(#[from] mirrex_config::ConfigError),

    #[error("model error: {0}")]
    Model(#[from] mirrex_model::ModelError),

    #[error("replica set is shutting down")]
    ShuttingDown,

    #[error("operation failed: {0}")]
    Fop(Errno),
}

pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Per-operation result: the success payload or the errno to unwind with.
pub type FopResult<T> = std::result::Result<T, Errno>;

/// The errno surfaced when an operation loses quorum.
pub fn quorum_errno() -> Errno {
    Errno::ENOTCONN
}
