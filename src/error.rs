use thiserror::Error;

/// Errors produced when talking to a remote engine.
///
/// Everything in here is recoverable at the fan-out boundary: a reconciler
/// catches these per machine, logs them and drops that machine's
/// contribution for the cycle.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("machine {machine} is not reachable")]
    Unreachable { machine: String },

    #[error("request to machine {machine} failed: {source}")]
    Request {
        machine: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("machine {machine} returned a malformed payload: {reason}")]
    Payload { machine: String, reason: String },
}

/// Structural failures inside the merge logic itself.
///
/// Unlike [`ClientError`] these indicate a bug rather than a transient
/// network condition and are allowed to abort the cycle loudly.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("merge invariant violated: {0}")]
    Invariant(String),
}
