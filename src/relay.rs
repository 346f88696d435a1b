//! Single-relay publish attempt over a WebSocket connection.
//!
//! A [`RelayLink`] opens one connection, sends one `EVENT` frame and waits for
//! the matching `OK` acknowledgment. Connecting and waiting for the ack run
//! under separate budgets so a relay that accepts the socket but never
//! answers is reported as `ack-timeout`, not as a refused connection.

use std::{fmt, time::Duration};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async_tls, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::event::Event;

/// Relay URLs that do not pass validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayUrlError {
    #[error("invalid relay url {url:?}: {reason}")]
    Invalid { url: String, reason: String },
    #[error("relay {0} does not use secure transport (wss://)")]
    Insecure(String),
}

/// A relay endpoint accepted by [`RelaySet::parse`].
///
/// Deserializing goes through [`RelayTarget::parse`] with plain `ws://`
/// allowed; whether such a target may be used is decided by
/// [`LinkOptions::allow_insecure`] when a link is opened.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelayTarget {
    url: String,
}

impl RelayTarget {
    /// Validate a single relay URL. `ws://` is only accepted with
    /// `allow_insecure`.
    pub fn parse(raw: &str, allow_insecure: bool) -> Result<Self, RelayUrlError> {
        let raw = raw.trim();
        let url = Url::parse(raw).map_err(|e| RelayUrlError::Invalid {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "wss" => {}
            "ws" if allow_insecure => {}
            "ws" => return Err(RelayUrlError::Insecure(raw.to_string())),
            other => {
                return Err(RelayUrlError::Invalid {
                    url: raw.to_string(),
                    reason: format!("unsupported scheme {other}"),
                })
            }
        }
        if url.host_str().is_none() {
            return Err(RelayUrlError::Invalid {
                url: raw.to_string(),
                reason: "missing host".into(),
            });
        }
        Ok(Self {
            url: raw.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_secure(&self) -> bool {
        self.url.starts_with("wss://")
    }
}

impl TryFrom<String> for RelayTarget {
    type Error = RelayUrlError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw, true)
    }
}

impl From<RelayTarget> for String {
    fn from(target: RelayTarget) -> Self {
        target.url
    }
}

impl fmt::Display for RelayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// De-duplicated relay list, validated once where configuration enters the
/// system. Order of first appearance is kept so results line up with input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelaySet(Vec<RelayTarget>);

impl RelaySet {
    pub fn parse<I, S>(urls: I, allow_insecure: bool) -> Result<Self, RelayUrlError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<RelayTarget> = vec![];
        for raw in urls {
            let target = RelayTarget::parse(raw.as_ref(), allow_insecure)?;
            if !out.contains(&target) {
                out.push(target);
            }
        }
        Ok(Self(out))
    }

    pub fn targets(&self) -> &[RelayTarget] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, target: &RelayTarget) -> bool {
        self.0.contains(target)
    }

    /// Add `target` unless already present; returns whether it was added.
    pub fn insert(&mut self, target: RelayTarget) -> bool {
        if self.0.contains(&target) {
            return false;
        }
        self.0.push(target);
        true
    }

    /// Remove `target`; returns whether it was present.
    pub fn remove(&mut self, target: &RelayTarget) -> bool {
        let before = self.0.len();
        self.0.retain(|t| t != target);
        self.0.len() != before
    }
}

/// Why one relay did not accept the event. `Display` renders the reason
/// string reported back to callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayFailure {
    #[error("connect-timeout")]
    ConnectTimeout,
    #[error("ack-timeout")]
    AckTimeout,
    #[error("transport-error: {0}")]
    Transport(String),
    #[error("closed-unexpectedly")]
    ClosedUnexpectedly,
    /// `ws://` target while insecure transport is not allowed.
    #[error("insecure-transport")]
    Insecure,
    #[error("{0}")]
    Rejected(String),
}

/// Reason used when a relay rejects without saying why.
pub const GENERIC_REJECTION: &str = "rejected";

/// Lifecycle of one attempt; only used for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Idle,
    Connecting,
    AwaitingAck,
    Closed,
}

/// Timeouts and transport options shared by every link.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    /// Optional SOCKS5 proxy (host:port) for the TCP leg.
    pub socks_proxy: Option<String>,
    /// Permit `ws://` targets.
    pub allow_insecure: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
            socks_proxy: None,
            allow_insecure: false,
        }
    }
}

/// One publish attempt against one relay.
pub struct RelayLink<'a> {
    target: &'a RelayTarget,
    opts: &'a LinkOptions,
    state: LinkState,
}

impl<'a> RelayLink<'a> {
    pub fn new(target: &'a RelayTarget, opts: &'a LinkOptions) -> Self {
        Self {
            target,
            opts,
            state: LinkState::Idle,
        }
    }

    /// Run the attempt to completion. Consumes the link so an attempt
    /// resolves exactly once.
    pub async fn publish(mut self, event: &Event) -> Result<(), RelayFailure> {
        let result = self.run(event).await;
        self.transition(LinkState::Closed);
        match &result {
            Ok(()) => debug!(relay = %self.target, id = %event.id, "event accepted"),
            Err(e) => warn!(relay = %self.target, id = %event.id, reason = %e, "publish failed"),
        }
        result
    }

    async fn run(&mut self, event: &Event) -> Result<(), RelayFailure> {
        if !self.target.is_secure() && !self.opts.allow_insecure {
            return Err(RelayFailure::Insecure);
        }
        self.transition(LinkState::Connecting);
        let mut ws = match timeout(
            self.opts.connect_timeout,
            connect_ws(self.target.url(), self.opts.socks_proxy.as_deref()),
        )
        .await
        {
            Err(_) => return Err(RelayFailure::ConnectTimeout),
            Ok(Err(e)) => return Err(RelayFailure::Transport(e.to_string())),
            Ok(Ok(ws)) => ws,
        };

        // The send shares the ack budget: a relay that stops reading must not
        // hold the attempt open.
        let deadline = Instant::now() + self.opts.ack_timeout;
        let frame = serde_json::json!(["EVENT", event]);
        match tokio::time::timeout_at(deadline, ws.send(Message::Text(frame.to_string()))).await {
            Err(_) => return Err(RelayFailure::AckTimeout),
            Ok(Err(e)) => return Err(RelayFailure::Transport(e.to_string())),
            Ok(Ok(())) => {}
        }
        self.transition(LinkState::AwaitingAck);

        loop {
            let msg = match tokio::time::timeout_at(deadline, ws.next()).await {
                Err(_) => {
                    let _ = ws.close(None).await;
                    return Err(RelayFailure::AckTimeout);
                }
                Ok(None) => return Err(RelayFailure::ClosedUnexpectedly),
                Ok(Some(Err(e))) => return Err(RelayFailure::Transport(e.to_string())),
                Ok(Some(Ok(msg))) => msg,
            };
            match msg {
                Message::Text(txt) => {
                    if let Some(ack) = Ack::parse(&txt) {
                        if ack.id != event.id {
                            continue;
                        }
                        let _ = ws.close(None).await;
                        return if ack.accepted {
                            Ok(())
                        } else {
                            Err(RelayFailure::Rejected(
                                ack.reason
                                    .filter(|r| !r.is_empty())
                                    .unwrap_or_else(|| GENERIC_REJECTION.to_string()),
                            ))
                        };
                    }
                }
                Message::Close(_) => return Err(RelayFailure::ClosedUnexpectedly),
                _ => {}
            }
        }
    }

    fn transition(&mut self, next: LinkState) {
        debug!(relay = %self.target, from = ?self.state, to = ?next, "relay link");
        self.state = next;
    }
}

/// Parsed `["OK", id, accepted, reason?]` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub id: String,
    pub accepted: bool,
    pub reason: Option<String>,
}

impl Ack {
    /// Parse an acknowledgment; any other frame shape yields `None`.
    pub fn parse(txt: &str) -> Option<Self> {
        let val: Value = serde_json::from_str(txt).ok()?;
        let arr = val.as_array()?;
        if arr.first().and_then(|v| v.as_str()) != Some("OK") {
            return None;
        }
        let id = arr.get(1)?.as_str()?.to_string();
        let accepted = arr.get(2)?.as_bool()?;
        let reason = arr.get(3).and_then(|v| v.as_str()).map(|s| s.to_string());
        Some(Self { id, accepted, reason })
    }
}

/// Stream type returned by [`connect_ws`].
pub type RelayStream = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy. TLS is
/// negotiated for `wss://` URLs.
pub async fn connect_ws(relay: &str, socks_proxy: Option<&str>) -> anyhow::Result<RelayStream> {
    let url = Url::parse(relay)?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("missing host"))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow::anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = socks_proxy {
        Box::new(Socks5Stream::connect(proxy, (host.as_str(), port)).await?)
    } else {
        Box::new(TcpStream::connect((host.as_str(), port)).await?)
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}

/// Open and cleanly close a connection to check that a relay is reachable.
pub async fn test_connection(relay: &RelayTarget, opts: &LinkOptions) -> anyhow::Result<()> {
    if !relay.is_secure() && !opts.allow_insecure {
        anyhow::bail!("{relay}: {}", RelayFailure::Insecure);
    }
    let mut ws = timeout(
        opts.connect_timeout,
        connect_ws(relay.url(), opts.socks_proxy.as_deref()),
    )
    .await
    .map_err(|_| anyhow::anyhow!("connect timeout to {relay}"))??;
    ws.close(None).await?;
    Ok(())
}

/// Blanket trait for boxed async read/write streams.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
