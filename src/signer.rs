//! Signing capability consumed by the orchestrator.

use async_trait::async_trait;
use secp256k1::{Keypair, Message, Secp256k1};
use thiserror::Error;

use crate::event::{Event, UnsignedEvent};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("user rejected the signature request")]
    UserRejected,
    #[error("signing capability unavailable: {0}")]
    CapabilityUnavailable(String),
}

/// Key holder that owns the private key. It may block on user approval.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex x-only public key of the active identity.
    async fn identity(&self) -> Result<String, SignError>;
    /// Return `event` with `id` and `sig` filled in.
    async fn sign(&self, event: &UnsignedEvent) -> Result<Event, SignError>;
}

/// Signer backed by a secp256k1 secret key held in process.
pub struct LocalSigner {
    secp: Secp256k1<secp256k1::All>,
    keypair: Keypair,
}

impl LocalSigner {
    /// Build from a 32-byte secret key in hex.
    pub fn from_secret_hex(secret: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(secret.trim())?;
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, &bytes)?;
        Ok(Self { secp, keypair })
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn identity(&self) -> Result<String, SignError> {
        Ok(self.public_key_hex())
    }

    async fn sign(&self, event: &UnsignedEvent) -> Result<Event, SignError> {
        if event.pubkey != self.public_key_hex() {
            return Err(SignError::CapabilityUnavailable(
                "event pubkey does not belong to this key".into(),
            ));
        }
        let hash = event
            .digest()
            .map_err(|e| SignError::CapabilityUnavailable(e.to_string()))?;
        let msg = Message::from_digest_slice(&hash)
            .map_err(|e| SignError::CapabilityUnavailable(e.to_string()))?;
        let sig = self.secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        Ok(event
            .clone()
            .into_signed(hex::encode(hash), hex::encode(sig.as_ref())))
    }
}
