use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for the whole crate. Every variant is returned to the
/// caller that triggered it; nothing here aborts the process.
///
/// `Clone` matters: when several callers wait on one in-flight load, they
/// all receive the same failure value.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unknown model: {0}")]
    NotFound(String),

    #[error("model store error: {0}")]
    Store(String),

    #[error("model id {0} is already registered with a different path")]
    DuplicateId(String),

    #[error("failed to load model {id}: {reason}")]
    LoadFailure { id: String, reason: String },

    #[error("cannot make room for model {id}: needs {needed} bytes against a budget of {budget}")]
    InsufficientCapacity { id: String, needed: u64, budget: u64 },

    #[error("device ran out of memory while generating with model {0}")]
    OutOfMemory(String),

    #[error("engine failure: {0}")]
    EngineFailure(String),
}
