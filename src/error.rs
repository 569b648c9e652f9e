use thiserror::Error;

use crate::content::ContentError;
use crate::executor::ExecError;

/// Failure taxonomy for the admission and pinning paths.
///
/// A rejected claim (bad burn, wrong token, underpaid) is not an error; it is
/// reported as a negative [`crate::claim::ClaimResponse`].
#[derive(Debug, Error)]
pub enum PinError {
    /// Malformed submission, refused before any network call.
    #[error("invalid submission: {0}")]
    Validation(String),
    /// The blockchain or price collaborator could not be queried.
    #[error("upstream lookup failed: {0}")]
    UpstreamLookup(#[source] anyhow::Error),
    /// Timeout or storage-network error while fetching an object.
    #[error("fetch failed: {0}")]
    Fetch(#[from] ExecError),
    /// Pin/unpin failure other than "already pinned".
    #[error("storage network error: {0}")]
    Storage(#[from] ContentError),
    #[error("persistence error: {0}")]
    Persistence(#[source] anyhow::Error),
}

impl PinError {
    pub fn validation(msg: impl Into<String>) -> Self {
        PinError::Validation(msg.into())
    }

    pub fn persistence(err: anyhow::Error) -> Self {
        PinError::Persistence(err)
    }
}

pub type PinResult<T> = Result<T, PinError>;
