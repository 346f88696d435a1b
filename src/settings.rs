//! User-facing publish settings persisted in the shared store.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    relay::{RelaySet, RelayTarget, RelayUrlError},
    store::{KeyValueStoreExt, SharedStore, StoreError},
};

const SETTINGS_KEY: &str = "publish_settings";

/// Relays used when nothing has been saved yet.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://relay.nostr.info",
    "wss://nostr-pub.wellorder.net",
    "wss://relay.current.fyi",
    "wss://nostr.wine",
];

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(transparent)]
    Relay(#[from] RelayUrlError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishSettings {
    pub relays: RelaySet,
    /// Append "Originally posted by …" and the source URL to the content.
    pub include_attribution: bool,
    pub enabled: bool,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            // The defaults are all wss:// and therefore always valid.
            relays: RelaySet::parse(DEFAULT_RELAYS, false).unwrap_or_default(),
            include_attribution: true,
            enabled: true,
        }
    }
}

/// Read/write access to [`PublishSettings`]. Relay URLs are validated here,
/// on the way in, and nowhere else.
#[derive(Clone)]
pub struct PublishSettingsStore {
    store: SharedStore,
    allow_insecure: bool,
}

impl PublishSettingsStore {
    pub fn new(store: SharedStore, allow_insecure: bool) -> Self {
        Self {
            store,
            allow_insecure,
        }
    }

    /// Saved settings, persisting the defaults on first use.
    pub fn get(&self) -> Result<PublishSettings, StoreError> {
        if let Some(settings) = self.store.get_as::<PublishSettings>(SETTINGS_KEY)? {
            return Ok(settings);
        }
        let defaults = PublishSettings::default();
        self.store.set_as(SETTINGS_KEY, &defaults)?;
        Ok(defaults)
    }

    pub fn set(&self, settings: &PublishSettings) -> Result<(), StoreError> {
        self.store.set_as(SETTINGS_KEY, settings)?;
        info!(relays = settings.relays.len(), "settings updated");
        Ok(())
    }

    /// Validate a relay URL under this store's transport policy.
    pub fn parse_relay(&self, url: &str) -> Result<RelayTarget, RelayUrlError> {
        RelayTarget::parse(url, self.allow_insecure)
    }

    /// Replace the relay list from raw URLs.
    pub fn set_relays<I, S>(&self, urls: I) -> Result<PublishSettings, SettingsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut settings = self.get()?;
        settings.relays = RelaySet::parse(urls, self.allow_insecure)?;
        self.set(&settings)?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn settings_store(allow_insecure: bool) -> (PublishSettingsStore, SharedStore) {
        let store: SharedStore = Arc::new(MemoryStore::new());
        (PublishSettingsStore::new(store.clone(), allow_insecure), store)
    }

    #[test]
    fn defaults_are_persisted_on_first_read() {
        let (settings, store) = settings_store(false);
        let got = settings.get().unwrap();
        assert_eq!(got.relays.len(), DEFAULT_RELAYS.len());
        assert!(got.include_attribution);
        assert!(got.enabled);
        assert!(store.get(SETTINGS_KEY).unwrap().is_some());
    }

    #[test]
    fn set_relays_validates_and_dedupes() {
        let (settings, _) = settings_store(false);
        let saved = settings
            .set_relays(["wss://a.example", "wss://a.example", "wss://b.example"])
            .unwrap();
        assert_eq!(saved.relays.len(), 2);
        assert_eq!(settings.get().unwrap().relays, saved.relays);
        assert!(matches!(
            settings.set_relays(["ws://plain.example"]),
            Err(SettingsError::Relay(RelayUrlError::Insecure(_)))
        ));
    }

    #[test]
    fn insecure_relays_allowed_when_configured() {
        let (settings, _) = settings_store(true);
        assert!(settings.set_relays(["ws://127.0.0.1:7000"]).is_ok());
        assert!(settings.parse_relay("ws://127.0.0.1:7001").is_ok());
    }

    #[test]
    fn toggles_round_trip() {
        let (store, _) = settings_store(false);
        let mut s = store.get().unwrap();
        s.include_attribution = false;
        s.enabled = false;
        store.set(&s).unwrap();
        assert_eq!(store.get().unwrap(), s);
    }
}
