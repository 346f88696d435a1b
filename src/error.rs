//! Terminal errors of a publish call.

use thiserror::Error;

use crate::{
    event::{EncodingError, VerifyError},
    quota::Tier,
    signer::SignError,
    store::StoreError,
};

/// Every way a publish call can end without a [`crate::PublishOutcome`].
///
/// Per-relay failures never show up here; they are recorded inside the
/// outcome.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publishing is disabled in settings")]
    Disabled,
    #[error("content text is empty")]
    EmptyContent,
    #[error("daily quota exceeded for tier {tier}: {used}/{limit}")]
    QuotaExceeded { tier: Tier, used: u32, limit: u32 },
    #[error("no signing identity available")]
    NotAuthenticated,
    #[error("signature request rejected by user")]
    UserRejected,
    #[error("signing capability unavailable: {0}")]
    CapabilityUnavailable(String),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("invalid event: {0}")]
    InvalidEvent(VerifyError),
    #[error("no relays configured")]
    NoRelaysConfigured,
    #[error("all publish layers failed: {}", .failures.join("; "))]
    BridgeExhausted { failures: Vec<String> },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<SignError> for PublishError {
    fn from(err: SignError) -> Self {
        match err {
            SignError::NotAuthenticated => PublishError::NotAuthenticated,
            SignError::UserRejected => PublishError::UserRejected,
            SignError::CapabilityUnavailable(msg) => PublishError::CapabilityUnavailable(msg),
        }
    }
}
