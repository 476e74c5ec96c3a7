use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure modes of a single reconciliation pass.
///
/// An unreadable persisted `observedConfig` blob is deliberately not represented
/// here: it is downgraded to an empty snapshot (with a warning) so the next write
/// can self-heal instead of wedging the loop.
#[derive(ThisError, Debug)]
pub enum Error {
    /// An observer failed while gathering cluster facts. The pass aborts before
    /// any write happens.
    #[error("config observation failed: {source}")]
    Observe {
        #[source]
        source: kube::Error,
    },

    /// The operator resource could not be read. Not-found counts: the resource
    /// is expected to pre-exist.
    #[error("failed to fetch operator config: {source}")]
    Fetch {
        #[source]
        source: kube::Error,
    },

    /// The conditional write failed, including optimistic-concurrency conflicts
    /// from a competing writer. Retried via queue backoff, never locally.
    #[error("failed to update operator config: {source}")]
    Update {
        #[source]
        source: kube::Error,
    },
}
