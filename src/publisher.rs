//! Concurrent fan-out of one signed event to many relays.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
    error::PublishError,
    event::Event,
    relay::{LinkOptions, RelayLink, RelayTarget},
};

/// Result of the attempt against one relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayOutcome {
    pub relay: RelayTarget,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate over all relays of one publish call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub overall_success: bool,
    pub success_count: usize,
    pub total: usize,
    pub per_relay: Vec<RelayOutcome>,
}

impl PublishOutcome {
    /// Build the aggregate; counts are always derived from `per_relay`.
    pub fn from_results(per_relay: Vec<RelayOutcome>) -> Self {
        let success_count = per_relay.iter().filter(|r| r.success).count();
        Self {
            overall_success: success_count > 0,
            success_count,
            total: per_relay.len(),
            per_relay,
        }
    }

    /// Outcome recorded for `relay`, if it was part of the call.
    pub fn for_relay(&self, relay: &RelayTarget) -> Option<&RelayOutcome> {
        self.per_relay.iter().find(|r| &r.relay == relay)
    }
}

/// Publishes to every target concurrently and waits for all of them.
#[derive(Debug, Clone, Default)]
pub struct MultiRelayPublisher {
    opts: LinkOptions,
}

impl MultiRelayPublisher {
    pub fn new(opts: LinkOptions) -> Self {
        Self { opts }
    }

    pub fn options(&self) -> &LinkOptions {
        &self.opts
    }

    /// Send `event` to each target. A slow relay is never cancelled because
    /// another one already succeeded; each relay's failure is kept in its own
    /// [`RelayOutcome`].
    #[instrument(skip_all, fields(id = %event.id, relays = targets.len()))]
    pub async fn publish(
        &self,
        event: &Event,
        targets: &[RelayTarget],
    ) -> Result<PublishOutcome, PublishError> {
        event.verify_id().map_err(PublishError::InvalidEvent)?;
        if targets.is_empty() {
            return Err(PublishError::NoRelaysConfigured);
        }

        let attempts = targets.iter().map(|target| async move {
            let result = RelayLink::new(target, &self.opts).publish(event).await;
            RelayOutcome {
                relay: target.clone(),
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            }
        });
        let outcome = PublishOutcome::from_results(join_all(attempts).await);
        info!(
            succeeded = outcome.success_count,
            total = outcome.total,
            "publish summary"
        );
        Ok(outcome)
    }
}
