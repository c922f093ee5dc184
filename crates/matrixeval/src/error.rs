use thiserror::Error;

/// Validation failures reported at task submission time
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("no source asset is available; upload or select one first")]
    MissingSourceAsset,
    #[error("no encode target specified")]
    MissingEncodeTarget,
}
