//! Ordered publish strategies: bridge, then direct, then durable handoff.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    bridge::{BridgeError, ContextBridge, RequestBody, ResponseBody},
    error::PublishError,
    event::Event,
    handoff::HandoffChannel,
    publisher::{MultiRelayPublisher, PublishOutcome},
    relay::RelayTarget,
};

/// Which way a strategy reaches the relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Bridge,
    Direct,
    Handoff,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Layer::Bridge => "bridge",
            Layer::Direct => "direct",
            Layer::Handoff => "handoff",
        })
    }
}

/// One way of getting a signed event to the relays.
#[async_trait]
pub trait PublishStrategy: Send + Sync {
    fn layer(&self) -> Layer;

    async fn publish(
        &self,
        event: &Event,
        relays: &[RelayTarget],
        timeout: Duration,
    ) -> Result<PublishOutcome, BridgeError>;
}

/// Ask the network context over the bridge.
pub struct BridgeStrategy(pub ContextBridge);

#[async_trait]
impl PublishStrategy for BridgeStrategy {
    fn layer(&self) -> Layer {
        Layer::Bridge
    }

    async fn publish(
        &self,
        event: &Event,
        relays: &[RelayTarget],
        timeout: Duration,
    ) -> Result<PublishOutcome, BridgeError> {
        let body = RequestBody::Publish {
            event: event.clone(),
            relays: relays.to_vec(),
        };
        match self.0.call(body, timeout).await? {
            ResponseBody::Published { outcome } => Ok(outcome),
            ResponseBody::Failed { reason } => Err(BridgeError::Refused(reason)),
            other => Err(BridgeError::Channel(format!("unexpected response {other:?}"))),
        }
    }
}

/// Open relay connections from the calling context itself.
pub struct DirectStrategy(pub MultiRelayPublisher);

#[async_trait]
impl PublishStrategy for DirectStrategy {
    fn layer(&self) -> Layer {
        Layer::Direct
    }

    async fn publish(
        &self,
        event: &Event,
        relays: &[RelayTarget],
        timeout: Duration,
    ) -> Result<PublishOutcome, BridgeError> {
        match tokio::time::timeout(timeout, self.0.publish(event, relays)).await {
            Err(_) => Err(BridgeError::Timeout(timeout)),
            Ok(Err(e)) => Err(BridgeError::Refused(e.to_string())),
            Ok(Ok(outcome)) => Ok(outcome),
        }
    }
}

/// Park the request in the shared store for the handoff worker.
pub struct HandoffStrategy(pub HandoffChannel);

#[async_trait]
impl PublishStrategy for HandoffStrategy {
    fn layer(&self) -> Layer {
        Layer::Handoff
    }

    async fn publish(
        &self,
        event: &Event,
        relays: &[RelayTarget],
        timeout: Duration,
    ) -> Result<PublishOutcome, BridgeError> {
        self.0.submit(event, relays, timeout).await
    }
}

/// Strategies tried strictly in order, each at most once per publish.
#[derive(Default)]
pub struct FallbackChain {
    layers: Vec<(Box<dyn PublishStrategy>, Duration)>,
}

impl FallbackChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer with its own time budget.
    pub fn with_layer(mut self, strategy: impl PublishStrategy + 'static, budget: Duration) -> Self {
        self.layers.push((Box::new(strategy), budget));
        self
    }

    pub fn layers(&self) -> Vec<Layer> {
        self.layers.iter().map(|(s, _)| s.layer()).collect()
    }

    /// Run the layers until one reports at least one accepting relay.
    ///
    /// A layer that errors, or whose outcome has no success, hands over to
    /// the next one. Once the network context is known to be invalidated the
    /// direct layer is skipped. When every layer is spent, the last outcome
    /// seen is returned as is; without any outcome the call fails with
    /// [`PublishError::BridgeExhausted`].
    pub async fn publish(&self, event: &Event, relays: &[RelayTarget]) -> Result<PublishOutcome, PublishError> {
        let mut failures = vec![];
        let mut last_outcome = None;
        let mut context_invalidated = false;

        for (strategy, budget) in &self.layers {
            let layer = strategy.layer();
            if context_invalidated && layer == Layer::Direct {
                info!(%layer, "skipping layer: network context invalidated");
                continue;
            }
            match strategy.publish(event, relays, *budget).await {
                Ok(outcome) if outcome.overall_success => {
                    info!(%layer, succeeded = outcome.success_count, total = outcome.total, "published");
                    return Ok(outcome);
                }
                Ok(outcome) => {
                    warn!(%layer, total = outcome.total, "no relay accepted the event");
                    failures.push(format!("{layer}: no relay accepted the event"));
                    last_outcome = Some(outcome);
                }
                Err(e) => {
                    warn!(%layer, error = %e, "publish layer failed");
                    if matches!(e, BridgeError::ContextInvalidated) {
                        context_invalidated = true;
                    }
                    failures.push(format!("{layer}: {e}"));
                }
            }
        }

        match last_outcome {
            Some(outcome) => Ok(outcome),
            None => Err(PublishError::BridgeExhausted { failures }),
        }
    }
}
