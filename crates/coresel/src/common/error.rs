use thiserror::Error;

#[derive(Debug, Error)]
pub enum SelectError {
    /// A request or record is malformed (non-conformant bitmaps, bad counts).
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A job, node or partition was not where the caller claimed it is.
    #[error("not found: {0}")]
    NotFound(String),
    /// Placement or a row insert cannot be satisfied. Not an internal error;
    /// the caller decides whether to retry, queue or preempt.
    #[error("resources do not fit")]
    NoFit,
    /// A record lacks fields the operation requires; indicates a controller
    /// bug rather than bad user input.
    #[error("state invariant violated: {0}")]
    StateInvariant(String),
}
