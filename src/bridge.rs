//! Request/response bridge between the signing context and the network
//! context.
//!
//! The two sides share nothing but a pair of message channels. Every request
//! carries a fresh correlation id; the caller parks a one-shot sender under
//! that id and the response pump resolves it when a response with the same
//! id arrives. Responses for unknown or expired ids are dropped.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::{
    event::Event,
    publisher::{MultiRelayPublisher, PublishOutcome},
    relay::RelayTarget,
    store::StoreError,
};

/// Failures of the bridge and of the fallback layers built on it.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge call timed out after {0:?}")]
    Timeout(Duration),
    #[error("bridge channel error: {0}")]
    Channel(String),
    /// The network context is gone; its end of the channel was dropped.
    #[error("network context invalidated")]
    ContextInvalidated,
    #[error("handoff timed out after {0:?}")]
    HandoffTimeout(Duration),
    #[error("publish refused: {0}")]
    Refused(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Request sent from the signing context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub request_id: String,
    /// Unix milliseconds after which the caller no longer waits for an answer.
    pub deadline_ms: u64,
    #[serde(flatten)]
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RequestBody {
    Publish {
        event: Event,
        relays: Vec<RelayTarget>,
    },
    Ping,
}

/// Response sent back by the network context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub request_id: String,
    #[serde(flatten)]
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    Published { outcome: PublishOutcome },
    Pong,
    Failed { reason: String },
}

/// Fresh, unguessable correlation id such as `req_3f9a…`.
pub(crate) fn new_request_id(prefix: &str) -> String {
    format!("{prefix}_{:032x}", rand::random::<u128>())
}

pub(crate) fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Time left until the unix-millisecond `deadline_ms`, if any.
pub(crate) fn remaining_until(deadline_ms: u64) -> Option<Duration> {
    deadline_ms
        .checked_sub(unix_now_ms())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

type Pending = Arc<DashMap<String, oneshot::Sender<ResponseBody>>>;

/// Network-context end of a bridge created by [`channel`].
pub struct BridgePort {
    pub requests: mpsc::Receiver<BridgeRequest>,
    pub responses: mpsc::Sender<BridgeResponse>,
}

/// Create a connected bridge. The returned [`ContextBridge`] spawns its
/// response pump, so this must run inside a Tokio runtime.
pub fn channel(capacity: usize) -> (ContextBridge, BridgePort) {
    let (req_tx, req_rx) = mpsc::channel(capacity);
    let (resp_tx, resp_rx) = mpsc::channel(capacity);
    (
        ContextBridge::connect(req_tx, resp_rx),
        BridgePort {
            requests: req_rx,
            responses: resp_tx,
        },
    )
}

/// Signing-context end of the bridge.
#[derive(Clone)]
pub struct ContextBridge {
    outbound: mpsc::Sender<BridgeRequest>,
    pending: Pending,
}

impl ContextBridge {
    /// Wrap an outbound request channel and start pumping `inbound`
    /// responses into waiting callers.
    pub fn connect(
        outbound: mpsc::Sender<BridgeRequest>,
        mut inbound: mpsc::Receiver<BridgeResponse>,
    ) -> Self {
        let pending: Pending = Arc::new(DashMap::new());
        let pump = pending.clone();
        tokio::spawn(async move {
            while let Some(resp) = inbound.recv().await {
                resolve(&pump, resp);
            }
            // The other side hung up: drop every waiter so pending calls see
            // the context as invalidated instead of waiting for their timeout.
            debug!(waiting = pump.len(), "bridge response channel closed");
            pump.clear();
        });
        Self { outbound, pending }
    }

    /// Send `body` and wait for its response until `timeout` elapses.
    pub async fn call(&self, body: RequestBody, timeout: Duration) -> Result<ResponseBody, BridgeError> {
        let deadline = Instant::now() + timeout;
        let request_id = new_request_id("req");
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        let request = BridgeRequest {
            request_id: request_id.clone(),
            deadline_ms: unix_now_ms() + timeout.as_millis() as u64,
            body,
        };
        match timeout_at(deadline, self.outbound.send(request)).await {
            Err(_) => {
                self.pending.remove(&request_id);
                return Err(BridgeError::Timeout(timeout));
            }
            Ok(Err(_)) => {
                self.pending.remove(&request_id);
                return Err(BridgeError::ContextInvalidated);
            }
            Ok(Ok(())) => {}
        }

        match timeout_at(deadline, rx).await {
            Err(_) => {
                self.pending.remove(&request_id);
                warn!(%request_id, ?timeout, "bridge call timed out");
                Err(BridgeError::Timeout(timeout))
            }
            Ok(Err(_)) => Err(BridgeError::ContextInvalidated),
            Ok(Ok(body)) => Ok(body),
        }
    }

    /// Deliver a response by hand; returns whether a caller was waiting.
    pub fn complete(&self, response: BridgeResponse) -> bool {
        resolve(&self.pending, response)
    }

    /// Calls still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check that the network context answers within `timeout`.
    pub async fn ping(&self, timeout: Duration) -> Result<(), BridgeError> {
        match self.call(RequestBody::Ping, timeout).await? {
            ResponseBody::Pong => Ok(()),
            other => Err(BridgeError::Channel(format!("unexpected response {other:?}"))),
        }
    }
}

/// First matching response wins; the entry is removed so later duplicates
/// find nothing.
fn resolve(pending: &Pending, response: BridgeResponse) -> bool {
    match pending.remove(&response.request_id) {
        Some((_, tx)) => {
            if tx.send(response.body).is_err() {
                debug!(request_id = %response.request_id, "caller dropped before response");
                return false;
            }
            true
        }
        None => {
            debug!(request_id = %response.request_id, "discarding unmatched bridge response");
            false
        }
    }
}

const DEADLINE_EXCEEDED: &str = "deadline exceeded";

/// Serves bridge requests in the network context.
#[derive(Clone)]
pub struct BridgeHost {
    publisher: MultiRelayPublisher,
}

impl BridgeHost {
    pub fn new(publisher: MultiRelayPublisher) -> Self {
        Self { publisher }
    }

    /// Answer requests until the signing side drops its sender. Each request
    /// runs in its own task so a slow publish never delays a ping.
    pub async fn serve(self, port: BridgePort) {
        let BridgePort {
            mut requests,
            responses,
        } = port;
        while let Some(req) = requests.recv().await {
            let host = self.clone();
            let responses = responses.clone();
            tokio::spawn(async move {
                let body = host.handle(req.body, req.deadline_ms).await;
                let resp = BridgeResponse {
                    request_id: req.request_id,
                    body,
                };
                if responses.send(resp).await.is_err() {
                    debug!("bridge caller gone before response");
                }
            });
        }
    }

    /// Work stops at `deadline_ms`; past it the caller has already given up.
    async fn handle(&self, body: RequestBody, deadline_ms: u64) -> ResponseBody {
        let Some(remaining) = remaining_until(deadline_ms) else {
            debug!("bridge request arrived after its deadline");
            return ResponseBody::Failed {
                reason: DEADLINE_EXCEEDED.into(),
            };
        };
        match body {
            RequestBody::Ping => ResponseBody::Pong,
            RequestBody::Publish { event, relays } => {
                match tokio::time::timeout(remaining, self.publisher.publish(&event, &relays)).await {
                    Ok(Ok(outcome)) => ResponseBody::Published { outcome },
                    Ok(Err(e)) => ResponseBody::Failed {
                        reason: e.to_string(),
                    },
                    Err(_) => {
                        warn!(id = %event.id, "bridge publish abandoned at caller deadline");
                        ResponseBody::Failed {
                            reason: DEADLINE_EXCEEDED.into(),
                        }
                    }
                }
            }
        }
    }
}
