use thiserror::Error;

/// The error half of a load. Apart from errors reported by the fetch
/// function itself, a load can only fail if the batch it was waiting on
/// never produced a result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError<E> {
    /// The fetch function reported an error for this key, either for the key
    /// alone or shared by the whole batch.
    #[error("batch fetch failed: {0}")]
    Fetch(E),

    /// The fetch function panicked. Every key in the batch gets this error.
    #[error("batch fetch panicked")]
    Panicked,

    /// The task driving the batch was dropped before the fetch finished,
    /// usually because the runtime it was spawned on shut down.
    #[error("batch was dropped before its fetch completed")]
    Dropped,
}

impl<E> LoadError<E> {
    /// Get the fetch error, if this is one.
    pub fn fetch_error(&self) -> Option<&E> {
        match self {
            LoadError::Fetch(err) => Some(err),
            _ => None,
        }
    }
}
