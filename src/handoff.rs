//! Durable handoff through the shared store.
//!
//! Last resort when no live channel to the network context exists. The
//! caller writes a [`PendingPublish`] under `handoff/request/<id>`; a
//! [`HandoffWorker`] running in the network context claims it, publishes, and
//! writes a [`HandoffResult`] under `handoff/result/<id>`, which the caller
//! polls for.
//!
//! Both records carry the caller's deadline. The worker skips requests that
//! are already past it, stops publishing when it passes, and sweeps results
//! nobody collected.

use std::{future::Future, time::Duration};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::{
    bridge::{new_request_id, remaining_until, unix_now_ms, BridgeError},
    event::Event,
    publisher::{MultiRelayPublisher, PublishOutcome},
    relay::RelayTarget,
    store::{KeyValueStoreExt, SharedStore, StoreError},
};

pub const REQUEST_PREFIX: &str = "handoff/request/";
pub const RESULT_PREFIX: &str = "handoff/result/";

fn request_key(id: &str) -> String {
    format!("{REQUEST_PREFIX}{id}")
}

fn result_key(id: &str) -> String {
    format!("{RESULT_PREFIX}{id}")
}

/// Publish request parked in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPublish {
    pub id: String,
    pub event: Event,
    pub relays: Vec<RelayTarget>,
    /// Unix milliseconds when the request was written.
    pub submitted_at_ms: u64,
    /// Unix milliseconds after which the caller has stopped waiting.
    pub expires_at_ms: u64,
}

impl PendingPublish {
    fn is_expired(&self) -> bool {
        remaining_until(self.expires_at_ms).is_none()
    }
}

/// What the worker wrote back for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandoffResult {
    Published { outcome: PublishOutcome },
    Failed { reason: String },
}

/// Result as written to the store, stamped with the request's deadline so
/// the worker can sweep it if the caller never collects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ParkedResult {
    expires_at_ms: u64,
    #[serde(flatten)]
    result: HandoffResult,
}

/// Caller side of the handoff.
#[derive(Clone)]
pub struct HandoffChannel {
    store: SharedStore,
    poll_interval: Duration,
}

impl HandoffChannel {
    pub fn new(store: SharedStore, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    /// Park the request and poll for its result until `wait` elapses. On
    /// timeout the request is withdrawn so a late worker does not pick it up.
    pub async fn submit(
        &self,
        event: &Event,
        relays: &[RelayTarget],
        wait: Duration,
    ) -> Result<PublishOutcome, BridgeError> {
        let deadline = Instant::now() + wait;
        let submitted_at_ms = unix_now_ms();
        let request = PendingPublish {
            id: new_request_id("publish"),
            event: event.clone(),
            relays: relays.to_vec(),
            submitted_at_ms,
            expires_at_ms: submitted_at_ms + wait.as_millis() as u64,
        };
        let req_key = request_key(&request.id);
        let res_key = result_key(&request.id);
        self.store.set_as(&req_key, &request)?;
        debug!(id = %request.id, "handoff request written");

        loop {
            if let Some(parked) = self.store.get_as::<ParkedResult>(&res_key)? {
                self.store.remove(&res_key)?;
                self.store.remove(&req_key)?;
                return match parked.result {
                    HandoffResult::Published { outcome } => Ok(outcome),
                    HandoffResult::Failed { reason } => Err(BridgeError::Refused(reason)),
                };
            }
            let now = Instant::now();
            if now >= deadline {
                self.store.remove(&req_key)?;
                // A worker that claimed the request just before the deadline
                // may already have answered.
                self.store.remove(&res_key)?;
                warn!(id = %request.id, ?wait, "handoff timed out");
                return Err(BridgeError::HandoffTimeout(wait));
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

/// Network-context poller that executes parked requests.
#[derive(Clone)]
pub struct HandoffWorker {
    store: SharedStore,
    publisher: MultiRelayPublisher,
}

impl HandoffWorker {
    pub fn new(store: SharedStore, publisher: MultiRelayPublisher) -> Self {
        Self { store, publisher }
    }

    /// Claim and execute every live parked request once, then sweep stale
    /// results. Returns how many requests were executed.
    ///
    /// Entries that do not decode are logged and removed so one bad record
    /// cannot block the queue.
    pub async fn poll_once(&self) -> Result<usize, StoreError> {
        let mut claimed = vec![];
        for key in self.store.keys(REQUEST_PREFIX)? {
            let request = match self.store.get_as::<PendingPublish>(&key) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e @ StoreError::Encoding { .. }) => {
                    warn!(%key, error = %e, "dropping undecodable handoff request");
                    self.store.remove(&key)?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            // Removing the request is the claim; whoever removes it first owns it.
            if !self.store.remove(&key)? {
                continue;
            }
            if request.is_expired() {
                debug!(id = %request.id, "skipping expired handoff request");
                continue;
            }
            claimed.push(request);
        }
        let handled = claimed.len();
        let results = join_all(claimed.into_iter().map(|request| self.execute(request))).await;
        for (id, parked) in results.into_iter().flatten() {
            self.store.set_as(&result_key(&id), &parked)?;
            info!(%id, "handoff request executed");
        }
        self.sweep_results()?;
        Ok(handled)
    }

    /// Publish within the request's remaining time. `None` when the caller's
    /// deadline passed first and nobody is left to read a result.
    async fn execute(&self, request: PendingPublish) -> Option<(String, ParkedResult)> {
        let remaining = remaining_until(request.expires_at_ms)?;
        let publish = self.publisher.publish(&request.event, &request.relays);
        let result = match tokio::time::timeout(remaining, publish).await {
            Ok(Ok(outcome)) => HandoffResult::Published { outcome },
            Ok(Err(e)) => HandoffResult::Failed {
                reason: e.to_string(),
            },
            Err(_) => {
                warn!(id = %request.id, "handoff publish abandoned at caller deadline");
                return None;
            }
        };
        let parked = ParkedResult {
            expires_at_ms: request.expires_at_ms,
            result,
        };
        Some((request.id, parked))
    }

    /// Remove results whose caller has stopped waiting, and results that do
    /// not decode.
    fn sweep_results(&self) -> Result<(), StoreError> {
        for key in self.store.keys(RESULT_PREFIX)? {
            let stale = match self.store.get_as::<ParkedResult>(&key) {
                Ok(Some(parked)) => remaining_until(parked.expires_at_ms).is_none(),
                Ok(None) => false,
                Err(StoreError::Encoding { .. }) => true,
                Err(e) => return Err(e),
            };
            if stale && self.store.remove(&key)? {
                debug!(%key, "swept handoff result");
            }
        }
        Ok(())
    }

    /// Poll every `interval` until `shutdown` resolves.
    pub async fn run(self, interval: Duration, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "handoff poll failed");
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = sleep(interval) => {}
            }
        }
    }
}
