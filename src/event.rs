//! Nostr event model and canonical id derivation.

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Kind number of a short text note.
pub const KIND_TEXT_NOTE: u32 = 1;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// The first element names the tag and the rest carry its data, e.g.
/// `["t", "news"]` is `Tag(vec!["t".into(), "news".into()])`. Tags are kept
/// verbatim and in order because their order is part of the event id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

/// Malformed input that cannot be turned into a canonical serialization.
#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("pubkey must be 64 lowercase hex characters, got {0:?}")]
    InvalidPubkey(String),
    #[error("serializing event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Reasons a signed event fails verification.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("id mismatch: derived {derived}, event carries {carried}")]
    IdMismatch { derived: String, carried: String },
    #[error("invalid signature: {0}")]
    Signature(String),
}

/// Event fields covered by the id, before a signer has seen them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsignedEvent {
    /// Author public key (x-only, hex).
    pub pubkey: String,
    /// Kind number, e.g. `1`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    /// Build a kind-1 note without tags.
    pub fn text_note(pubkey: impl Into<String>, content: impl Into<String>, created_at: u64) -> Self {
        Self {
            pubkey: pubkey.into(),
            kind: KIND_TEXT_NOTE,
            created_at,
            tags: vec![],
            content: content.into(),
        }
    }

    /// Canonical bytes: `[0, pubkey, created_at, kind, tags, content]` as
    /// compact JSON. Arrays keep the field order fixed, so equal fields always
    /// produce equal bytes.
    pub fn serialize(&self) -> Result<Vec<u8>, EncodingError> {
        if !is_lower_hex(&self.pubkey, 64) {
            return Err(EncodingError::InvalidPubkey(self.pubkey.clone()));
        }
        let arr = serde_json::json!([0, self.pubkey, self.created_at, self.kind, self.tags, self.content]);
        Ok(serde_json::to_vec(&arr)?)
    }

    /// SHA-256 of the canonical serialization.
    pub fn digest(&self) -> Result<[u8; 32], EncodingError> {
        let data = self.serialize()?;
        Ok(Sha256::digest(&data).into())
    }

    /// Content identifier: lowercase hex of [`UnsignedEvent::digest`].
    pub fn derive_id(&self) -> Result<String, EncodingError> {
        Ok(hex::encode(self.digest()?))
    }

    /// Attach an id and signature produced elsewhere.
    pub fn into_signed(self, id: String, sig: String) -> Event {
        Event {
            id,
            pubkey: self.pubkey,
            kind: self.kind,
            created_at: self.created_at,
            tags: self.tags,
            content: self.content,
            sig,
        }
    }
}

/// Signed Nostr event as sent to relays.
///
/// ```json
/// {
///   "id": "5c83…",
///   "pubkey": "79be…",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [],
///   "content": "hello",
///   "sig": "deadbeef…"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Strip `id` and `sig`.
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            kind: self.kind,
            created_at: self.created_at,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Check that `id` is the id derived from the other fields.
    pub fn verify_id(&self) -> Result<(), VerifyError> {
        let derived = self.unsigned().derive_id()?;
        if derived != self.id {
            return Err(VerifyError::IdMismatch {
                derived,
                carried: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Check the id and the BIP-340 signature against `pubkey`.
    pub fn verify_signature(&self) -> Result<(), VerifyError> {
        self.verify_id()?;
        let hash = self.unsigned().digest()?;
        let sig_bytes = hex::decode(&self.sig).map_err(|e| VerifyError::Signature(e.to_string()))?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|e| VerifyError::Signature(e.to_string()))?;
        let pk_bytes = hex::decode(&self.pubkey).map_err(|e| VerifyError::Signature(e.to_string()))?;
        let pk = XOnlyPublicKey::from_slice(&pk_bytes).map_err(|e| VerifyError::Signature(e.to_string()))?;
        let msg = Message::from_digest_slice(&hash).map_err(|e| VerifyError::Signature(e.to_string()))?;
        Secp256k1::verification_only()
            .verify_schnorr(&sig, &msg, &pk)
            .map_err(|e| VerifyError::Signature(e.to_string()))
    }
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::Keypair;

    fn note(content: &str) -> UnsignedEvent {
        UnsignedEvent::text_note("00".repeat(32), content, 1)
    }

    fn signed(content: &str) -> Event {
        let secp = Secp256k1::new();
        let kp = Keypair::from_seckey_slice(&secp, &[1u8; 32]).unwrap();
        let pubkey = hex::encode(kp.x_only_public_key().0.serialize());
        let unsigned = UnsignedEvent::text_note(pubkey, content, 1_700_000_000);
        let hash = unsigned.digest().unwrap();
        let msg = Message::from_digest_slice(&hash).unwrap();
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &kp);
        unsigned.into_signed(hex::encode(hash), hex::encode(sig.as_ref()))
    }

    #[test]
    fn serialization_is_compact_and_ordered() {
        let mut ev = note("hi");
        ev.tags = vec![Tag(vec!["t".into(), "news".into()])];
        let bytes = ev.serialize().unwrap();
        let expected = format!("[0,\"{}\",1,1,[[\"t\",\"news\"]],\"hi\"]", "00".repeat(32));
        assert_eq!(String::from_utf8(bytes).unwrap(), expected);
    }

    #[test]
    fn id_matches_reference_hash() {
        let ev = note("");
        let obj = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
        let expected = hex::encode(Sha256::digest(serde_json::to_vec(&obj).unwrap()));
        assert_eq!(ev.derive_id().unwrap(), expected);
    }

    #[test]
    fn equal_fields_give_equal_ids() {
        assert_eq!(note("same").derive_id().unwrap(), note("same").derive_id().unwrap());
    }

    #[test]
    fn any_field_change_changes_id() {
        let base = note("x");
        let base_id = base.derive_id().unwrap();
        let mut variants = vec![];
        let mut v = base.clone();
        v.pubkey = "11".repeat(32);
        variants.push(v);
        let mut v = base.clone();
        v.kind = 2;
        variants.push(v);
        let mut v = base.clone();
        v.created_at = 2;
        variants.push(v);
        let mut v = base.clone();
        v.tags = vec![Tag(vec!["t".into()])];
        variants.push(v);
        let mut v = base.clone();
        v.content = "y".into();
        variants.push(v);
        for v in variants {
            assert_ne!(v.derive_id().unwrap(), base_id, "{v:?}");
        }
    }

    #[test]
    fn content_escaping_is_stable() {
        let ev = note("line\n\"quoted\"\ttab ünïcode");
        let text = String::from_utf8(ev.serialize().unwrap()).unwrap();
        assert!(text.contains(r#"line\n\"quoted\"\ttab ünïcode"#));
    }

    #[test]
    fn rejects_malformed_pubkey() {
        let ev = UnsignedEvent::text_note("npub1xyz", "x", 1);
        assert!(matches!(ev.derive_id(), Err(EncodingError::InvalidPubkey(_))));
        let upper = UnsignedEvent::text_note("AB".repeat(32), "x", 1);
        assert!(upper.derive_id().is_err());
    }

    #[test]
    fn verify_id_detects_tampering() {
        let mut ev = signed("hello");
        ev.verify_id().unwrap();
        ev.content = "tampered".into();
        assert!(matches!(ev.verify_id(), Err(VerifyError::IdMismatch { .. })));
    }

    #[test]
    fn verify_signature_accepts_valid_and_rejects_bad_sig() {
        let mut ev = signed("hello");
        ev.verify_signature().unwrap();
        ev.sig = "00".repeat(64);
        assert!(matches!(ev.verify_signature(), Err(VerifyError::Signature(_))));
    }

    #[test]
    fn wire_field_names() {
        let ev = signed("x");
        let val = serde_json::to_value(&ev).unwrap();
        for key in ["id", "pubkey", "kind", "created_at", "tags", "content", "sig"] {
            assert!(val.get(key).is_some(), "missing {key}");
        }
    }
}
