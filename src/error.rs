use thiserror::Error;

/// Errors surfaced while handling a message or a face.
///
/// The message path reports one of these per rejected message; the daemon
/// logs it, bumps the matching counter, and keeps going. Only stream-level
/// protocol errors and send failures tear a face down.
#[derive(Error, Debug)]
pub enum CcndError {
    #[error("malformed message: {0}")]
    Parse(&'static str),

    #[error("message of {0} bytes exceeds the {max} byte limit", max = crate::MAX_MESSAGE_BYTES)]
    TooBig(usize),

    #[error("scope-limited interest arrived over a link")]
    ScopeViolation,

    #[error("duplicate nonce")]
    DuplicateNonce,

    #[error("content name collision")]
    NameCollision,

    #[error("face table is full")]
    FaceTableFull,

    #[error("face is gone")]
    FaceGone,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
