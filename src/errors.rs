//! Global error type definitions

use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("store operation failed: {0}")]
/// An error reported by the backing document store
///
/// Store errors are opaque to the watcher layer; any store failure other
/// than not-found is fatal to the watcher that encountered it.
pub struct StoreError(#[from] anyhow::Error);

impl StoreError {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self(anyhow::Error::new(err))
    }
}

/// Terminal error of a watcher
///
/// The error returned by a watcher loop is latched and surfaced by both
/// [`stop`](crate::watch::Watcher::stop) and [`err`](crate::watch::Watcher::err),
/// which is why the type is cheap to clone.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Sentinel returned by [`err`](crate::watch::Watcher::err) while the
    /// watcher is still running
    #[error("watcher is still running")]
    StillAlive,

    /// An entity that was being watched does not exist
    ///
    /// Fatal for single-document watchers; collection and composite watchers
    /// treat disappearance as a removal signal instead.
    #[error("{0} not found")]
    NotFound(String),

    /// The shared change source terminated; no further notifications can be
    /// delivered
    #[error("change stream terminated: {0}")]
    SourceClosed(String),

    /// The backing store failed
    #[error("{0}")]
    Store(Arc<StoreError>),

    /// Some unexpected error happened during the watcher operation
    ///
    /// These errors should not happen, unless there is a bug in the
    /// implementation.
    #[error("internal error, this may be a bug: {0}")]
    Internal(Arc<anyhow::Error>),
}

impl Error {
    /// An entity lookup came back empty for something that must exist
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub(crate) fn internal(err: anyhow::Error) -> Self {
        Error::Internal(Arc::new(err))
    }

    /// Return true if the error marks a watched entity as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Store(Arc::new(err))
    }
}
