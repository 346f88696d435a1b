//! Sign once, publish everywhere: delivers one signed Nostr text note to a
//! set of relays, with per-relay outcomes, a daily quota, and a fallback
//! chain for contexts that cannot open network connections themselves.

pub mod bridge;
pub mod config;
pub mod error;
pub mod event;
pub mod fallback;
pub mod handoff;
pub mod orchestrator;
pub mod publisher;
pub mod quota;
pub mod relay;
pub mod settings;
pub mod signer;
pub mod store;

pub use error::PublishError;
pub use event::{Event, UnsignedEvent};
pub use orchestrator::{ContentItem, Orchestrator};
pub use publisher::{MultiRelayPublisher, PublishOutcome, RelayOutcome};
pub use relay::{RelaySet, RelayTarget};
