//! Top-level publish sequence.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::{debug, info, instrument, warn};

use crate::{
    error::PublishError,
    event::{UnsignedEvent, VerifyError},
    fallback::FallbackChain,
    publisher::PublishOutcome,
    quota::{Limit, QuotaGate},
    settings::PublishSettingsStore,
    signer::Signer,
};

/// One publishable item as handed over by the content source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentItem {
    pub text: String,
    pub author_handle: Option<String>,
    pub source_url: Option<String>,
}

impl ContentItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_author(mut self, handle: impl Into<String>) -> Self {
        self.author_handle = Some(handle.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }
}

/// Note body with optional attribution lines.
pub fn format_content(item: &ContentItem, include_attribution: bool) -> String {
    let mut content = item.text.clone();
    if include_attribution {
        if let Some(handle) = item.author_handle.as_deref().filter(|h| !h.is_empty()) {
            content.push_str(&format!("\n\nOriginally posted by @{handle} on X"));
            if let Some(url) = item.source_url.as_deref().filter(|u| !u.is_empty()) {
                content.push('\n');
                content.push_str(url);
            }
        }
    }
    content
}

/// Runs quota, identity, signing and publishing in order.
pub struct Orchestrator {
    quota: QuotaGate,
    settings: PublishSettingsStore,
    signer: Arc<dyn Signer>,
    chain: FallbackChain,
    verify_sig: bool,
}

impl Orchestrator {
    pub fn new(
        quota: QuotaGate,
        settings: PublishSettingsStore,
        signer: Arc<dyn Signer>,
        chain: FallbackChain,
    ) -> Self {
        Self {
            quota,
            settings,
            signer,
            chain,
            verify_sig: false,
        }
    }

    /// Also check the Schnorr signature returned by the signer.
    pub fn verify_signatures(mut self, on: bool) -> Self {
        self.verify_sig = on;
        self
    }

    pub fn quota(&self) -> &QuotaGate {
        &self.quota
    }

    /// Publish `item` once. Pre-flight failures return before any network
    /// activity; relay failures end up inside the returned outcome.
    #[instrument(skip_all)]
    pub async fn publish(&self, item: &ContentItem) -> Result<PublishOutcome, PublishError> {
        let settings = self.settings.get()?;
        if !settings.enabled {
            return Err(PublishError::Disabled);
        }
        if item.text.trim().is_empty() {
            return Err(PublishError::EmptyContent);
        }

        let tier = self.quota.current_tier()?;
        if !self.quota.can_publish(tier)? {
            let used = self.quota.used_today()?;
            let limit = match tier.limit() {
                Limit::Bounded(n) => n,
                Limit::Unbounded => u32::MAX,
            };
            return Err(PublishError::QuotaExceeded { tier, used, limit });
        }

        let pubkey = self.signer.identity().await?;
        if settings.relays.is_empty() {
            return Err(PublishError::NoRelaysConfigured);
        }

        let unsigned = UnsignedEvent::text_note(
            pubkey,
            format_content(item, settings.include_attribution),
            unix_now(),
        );
        let expected_id = unsigned.derive_id()?;
        debug!(id = %expected_id, "requesting signature");
        let event = self.signer.sign(&unsigned).await?;

        if event.unsigned() != unsigned || event.id != expected_id {
            warn!(expected = %expected_id, got = %event.id, "signer returned a different event");
            return Err(PublishError::InvalidEvent(VerifyError::IdMismatch {
                derived: expected_id,
                carried: event.id,
            }));
        }
        if self.verify_sig {
            event.verify_signature().map_err(PublishError::InvalidEvent)?;
        }

        let outcome = self.chain.publish(&event, settings.relays.targets()).await?;
        if outcome.overall_success {
            let used = self.quota.record_usage(tier)?;
            info!(id = %event.id, succeeded = outcome.success_count, total = outcome.total, used, "published");
        }
        Ok(outcome)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
