//! Session key exchange.
//!
//! Per conversation and local SIM, a `SessionKeys` record moves through
//!
//! ```text
//! None → HandshakeSent → KeysExchanged
//!              ↑_______________|        (rekey)
//! ```
//!
//! A HANDSHAKE carries an X25519 public key, the sender's timestamp and a
//! truncated SHA-256 digest over both. The receiver derives the session
//! key from its own secret and answers with a CONFIRM: its public key plus
//! its timestamp sealed under the new session key. Opening a CONFIRM
//! proves both sides hold the same key. Each side sends at most one
//! CONFIRM per exchange, so the exchange ends after the initiator's reply.

use tracing::info;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::block::fill_random;
use crate::crypto::{self, CryptoError, SessionKey, KEY_SIZE};
use crate::fragment::{self, FragmentType, RawFragment};
use crate::fs::FileSystem;
use crate::message_data::{Direction, MessageData, MessageKind};
use crate::pki::KeyCustody;
use crate::session_keys::{SessionKeys, SessionKeysStatus, SimContext};
use crate::storage::{now_millis, Storage, StorageError};
use crate::text::CompressedText;

/// Bytes of the SHA-256 digest kept in a handshake
pub const HANDSHAKE_DIGEST_SIZE: usize = 8;

/// public key (32) + timestamp (8) + digest (8)
pub const HANDSHAKE_SIZE: usize = KEY_SIZE + 8 + HANDSHAKE_DIGEST_SIZE;

/// Why an incoming protocol payload was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    #[error("No session keys")]
    NoSessionKeys,
    #[error("Could not decrypt")]
    CouldNotDecrypt,
    #[error("Could not verify")]
    CouldNotVerify,
    #[error("Corrupted data")]
    CorruptedData,
}

impl From<CryptoError> for ExchangeError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::CouldNotVerify => Self::CouldNotVerify,
            _ => Self::CouldNotDecrypt,
        }
    }
}

// ============================================================
// PAYLOADS
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub public: [u8; KEY_SIZE],
    pub timestamp: u64,
}

impl Handshake {
    fn digest(public: &[u8; KEY_SIZE], timestamp: u64) -> [u8; HANDSHAKE_DIGEST_SIZE] {
        let mut input = Vec::with_capacity(KEY_SIZE + 8);
        input.extend_from_slice(public);
        input.extend_from_slice(&timestamp.to_be_bytes());
        let mut out = [0u8; HANDSHAKE_DIGEST_SIZE];
        out.copy_from_slice(&crypto::hash(&input)[..HANDSHAKE_DIGEST_SIZE]);
        out
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HANDSHAKE_SIZE);
        out.extend_from_slice(&self.public);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&Self::digest(&self.public, self.timestamp));
        out
    }

    /// Parse and check the digest
    pub fn decode(bytes: &[u8]) -> Result<Self, ExchangeError> {
        if bytes.len() != HANDSHAKE_SIZE {
            return Err(ExchangeError::CorruptedData);
        }
        let mut public = [0u8; KEY_SIZE];
        public.copy_from_slice(&bytes[..KEY_SIZE]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[KEY_SIZE..KEY_SIZE + 8]);
        let timestamp = u64::from_be_bytes(ts);

        if bytes[KEY_SIZE + 8..] != Self::digest(&public, timestamp) {
            return Err(ExchangeError::CouldNotVerify);
        }
        Ok(Self { public, timestamp })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirm {
    pub public: [u8; KEY_SIZE],
    /// Sender timestamp sealed under the session key
    pub sealed: Vec<u8>,
}

impl Confirm {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.public.to_vec();
        out.extend_from_slice(&self.sealed);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ExchangeError> {
        if bytes.len() <= KEY_SIZE {
            return Err(ExchangeError::CorruptedData);
        }
        let mut public = [0u8; KEY_SIZE];
        public.copy_from_slice(&bytes[..KEY_SIZE]);
        Ok(Self {
            public,
            sealed: bytes[KEY_SIZE..].to_vec(),
        })
    }
}

// ============================================================
// KEY AGREEMENT
// ============================================================

fn new_secret() -> Zeroizing<[u8; KEY_SIZE]> {
    let mut secret = Zeroizing::new([0u8; KEY_SIZE]);
    fill_random(secret.as_mut_slice());
    secret
}

fn public_of(secret: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    PublicKey::from(&StaticSecret::from(*secret)).to_bytes()
}

fn agree(secret: &[u8; KEY_SIZE], their_public: &[u8; KEY_SIZE]) -> Result<SessionKey, ExchangeError> {
    let secret = StaticSecret::from(*secret);
    let ours = PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&PublicKey::from(*their_public));
    if !shared.was_contributory() {
        return Err(ExchangeError::CouldNotVerify);
    }
    crypto::derive_session_key(shared.as_bytes(), ours.as_bytes(), their_public)
        .map_err(|_| ExchangeError::CouldNotVerify)
}

fn seal_timestamp(key: &SessionKey, timestamp: u64) -> Result<Vec<u8>, CryptoError> {
    crypto::encrypt_with_key(&timestamp.to_be_bytes(), key.as_bytes())
}

// ============================================================
// STATE MACHINE
// ============================================================

/// Begin an exchange, or a rekey from `KeysExchanged`.
///
/// A fresh secret is generated; an established session key stays usable
/// until the new exchange completes.
pub fn start(keys: &mut SessionKeys, now: u64) -> Handshake {
    let secret = new_secret();
    let public = public_of(&secret);
    keys.our_secret = Some(secret);
    keys.status = SessionKeysStatus::HandshakeSent;
    keys.confirm_sent = false;
    keys.updated_at = now;
    Handshake {
        public,
        timestamp: now,
    }
}

/// Accept a peer's handshake and build our confirm.
///
/// A pending exchange of our own keeps its secret, so crossing handshakes
/// agree on one key. A handshake we already answered returns `None` and
/// leaves the record untouched.
pub fn accept_handshake(
    keys: &mut SessionKeys,
    handshake: &Handshake,
    now: u64,
) -> Result<Option<Confirm>, ExchangeError> {
    if keys.peer_public == Some(handshake.public) {
        return Ok(None);
    }

    let reuse = keys.status == SessionKeysStatus::HandshakeSent && keys.our_secret.is_some();
    let secret = match (&keys.our_secret, reuse) {
        (Some(secret), true) => secret.clone(),
        _ => new_secret(),
    };

    let session_key = agree(&secret, &handshake.public)?;
    let sealed = seal_timestamp(&session_key, now)?;
    let confirm = Confirm {
        public: public_of(&secret),
        sealed,
    };

    keys.our_secret = Some(secret);
    keys.session_key = Some(session_key);
    keys.status = SessionKeysStatus::HandshakeSent;
    keys.confirm_sent = true;
    keys.peer_public = Some(handshake.public);
    keys.updated_at = now;
    Ok(Some(confirm))
}

/// Derive the key a confirm was sealed with and open its timestamp
pub fn open_confirm(
    keys: &SessionKeys,
    confirm: &Confirm,
) -> Result<(SessionKey, u64), ExchangeError> {
    let key = match (&keys.our_secret, &keys.session_key, keys.status) {
        (Some(secret), _, SessionKeysStatus::HandshakeSent) => agree(secret, &confirm.public)?,
        (_, Some(key), SessionKeysStatus::KeysExchanged) => key.clone(),
        _ => return Err(ExchangeError::NoSessionKeys),
    };
    let plain = crypto::decrypt_with_key(&confirm.sealed, key.as_bytes())?;
    let timestamp: [u8; 8] = plain
        .as_slice()
        .try_into()
        .map_err(|_| ExchangeError::CorruptedData)?;
    Ok((key, u64::from_be_bytes(timestamp)))
}

/// Apply an opened confirm. Returns our own confirm when the peer still
/// needs one.
///
/// A confirm arriving after the exchange completed changes nothing.
pub fn accept_confirm(
    keys: &mut SessionKeys,
    key: SessionKey,
    now: u64,
) -> Result<Option<Confirm>, ExchangeError> {
    if keys.status == SessionKeysStatus::KeysExchanged {
        return Ok(None);
    }

    let reply = if keys.confirm_sent {
        None
    } else {
        let secret = keys.our_secret.as_ref().ok_or(ExchangeError::NoSessionKeys)?;
        Some(Confirm {
            public: public_of(secret),
            sealed: seal_timestamp(&key, now)?,
        })
    };

    keys.session_key = Some(key);
    keys.our_secret = None;
    keys.status = SessionKeysStatus::KeysExchanged;
    keys.confirm_sent = false;
    keys.updated_at = now;
    Ok(reply)
}

/// Seal a text body: `timestamp(8) ‖ text` under the session key
pub fn seal_text(keys: &SessionKeys, text: &CompressedText, now: u64) -> Result<Vec<u8>, ExchangeError> {
    let key = keys.session_key.as_ref().ok_or(ExchangeError::NoSessionKeys)?;
    let mut plain = Vec::with_capacity(8 + text.serialized_len());
    plain.extend_from_slice(&now.to_be_bytes());
    text.write_to(&mut plain);
    Ok(crypto::encrypt_with_key(&plain, key.as_bytes())?)
}

/// Open a text payload into its timestamp and the still-encoded body
pub fn open_text(keys: &SessionKeys, payload: &[u8]) -> Result<(u64, Vec<u8>), ExchangeError> {
    let key = keys.session_key.as_ref().ok_or(ExchangeError::NoSessionKeys)?;
    let plain = crypto::decrypt_with_key(payload, key.as_bytes())?;
    if plain.len() < 8 {
        return Err(ExchangeError::CorruptedData);
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&plain[..8]);
    Ok((u64::from_be_bytes(ts), plain[8..].to_vec()))
}

// ============================================================
// OUTGOING
// ============================================================

impl<F: FileSystem, K: KeyCustody> Storage<F, K> {
    /// Start (or restart) the key exchange with `phone` for the active SIM.
    ///
    /// Returns the handshake fragments for the transport.
    pub fn start_key_exchange(
        &self,
        phone: &str,
        sim: &SimContext,
    ) -> Result<Vec<RawFragment>, StorageError> {
        self.start_key_exchange_at(phone, sim, now_millis())
    }

    pub fn start_key_exchange_at(
        &self,
        phone: &str,
        sim: &SimContext,
        now: u64,
    ) -> Result<Vec<RawFragment>, StorageError> {
        self.transaction(|txn| {
            let mut conv = txn.create_conversation(phone)?;
            let mut keys = txn
                .resolve_keys(&conv, sim)?
                .unwrap_or_else(|| SessionKeys::new(sim.preferred(), now));
            let rekey = keys.status == SessionKeysStatus::KeysExchanged;

            let handshake = start(&mut keys, now);
            txn.save_keys(&mut conv, &mut keys)?;
            txn.add_message(
                &mut conv,
                &mut MessageData::control(MessageKind::Handshake, Direction::Outgoing, now),
            )?;

            info!(conversation = %conv.id, rekey, "started key exchange");
            Ok(fragment::split(FragmentType::Handshake, &handshake.encode())?)
        })
    }

    /// Encrypt `body` for `phone`, store it as an outgoing message and
    /// return the fragments for the transport.
    ///
    /// Too-large bodies are rejected before anything is stored.
    pub fn send_text(
        &self,
        phone: &str,
        body: &str,
        sim: &SimContext,
    ) -> Result<Vec<RawFragment>, StorageError> {
        self.send_text_at(phone, body, sim, now_millis())
    }

    pub fn send_text_at(
        &self,
        phone: &str,
        body: &str,
        sim: &SimContext,
        now: u64,
    ) -> Result<Vec<RawFragment>, StorageError> {
        let text = CompressedText::from_text(body)?;

        self.transaction(|txn| {
            let mut conv = txn.require_conversation(phone)?;
            let keys = txn
                .resolve_keys(&conv, sim)?
                .filter(SessionKeys::has_keys_exchanged)
                .ok_or(StorageError::NoSessionKeys)?;

            let payload = seal_text(&keys, &text, now).map_err(|e| match e {
                ExchangeError::NoSessionKeys => StorageError::NoSessionKeys,
                _ => StorageError::Crypto(CryptoError::EncryptionFailed),
            })?;
            let fragments = fragment::split(FragmentType::Text, &payload)?;

            let mut message = MessageData::from_text(text, Direction::Outgoing, now);
            txn.add_message(&mut conv, &mut message)?;
            Ok(fragments)
        })
    }
}
