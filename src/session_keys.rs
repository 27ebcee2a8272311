//! Per-device session-key record of a conversation.
//!
//! A conversation holds one record per local SIM identity it negotiated
//! with. The identity is the SIM's phone number when known, otherwise its
//! serial number.
//!
//! Layout (big-endian):
//!
//! | size | field |
//! |---|---|
//! | 4 | next record |
//! | 1 | identity kind (0 = phone, 1 = serial) |
//! | 32 | identity, fixed-width ASCII |
//! | 1 | status |
//! | 1 | flags |
//! | 32 | our exchange secret (random when absent) |
//! | 32 | session key (random when absent) |
//! | 32 | peer public key of the last accepted handshake (random when absent) |
//! | 8 | created at (unix millis) |
//! | 8 | updated at (unix millis) |

use zeroize::Zeroizing;

use crate::block::{fill_random, BlockId};
use crate::conversation::IDENTITY_WIDTH;
use crate::crypto::{SessionKey, KEY_SIZE};
use crate::encoding::Reader;
use crate::record::{Record, RecordError};
use crate::text::{from_fixed_ascii, to_fixed_ascii, Charset};

const FLAG_HAS_SECRET: u8 = 0b001;
const FLAG_HAS_SESSION_KEY: u8 = 0b010;
const FLAG_CONFIRM_SENT: u8 = 0b100;
const FLAG_HAS_PEER_PUBLIC: u8 = 0b1000;

/// Key-exchange progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKeysStatus {
    None,
    HandshakeSent,
    KeysExchanged,
}

impl SessionKeysStatus {
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::HandshakeSent => 1,
            Self::KeysExchanged => 2,
        }
    }

    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::HandshakeSent),
            2 => Some(Self::KeysExchanged),
            _ => None,
        }
    }
}

/// Identity of a local SIM
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SimNumber {
    Phone(String),
    Serial(String),
}

impl SimNumber {
    #[must_use]
    pub fn value(&self) -> &str {
        match self {
            Self::Phone(v) | Self::Serial(v) => v,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Self::Phone(_) => 0,
            Self::Serial(_) => 1,
        }
    }
}

/// The SIM currently in use: its serial is always known, its phone number
/// only sometimes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimContext {
    pub phone: Option<String>,
    pub serial: String,
}

impl SimContext {
    #[must_use]
    pub fn new(phone: Option<&str>, serial: &str) -> Self {
        Self {
            phone: phone.map(str::to_string),
            serial: serial.to_string(),
        }
    }

    /// Identity a new record is filed under
    #[must_use]
    pub fn preferred(&self) -> SimNumber {
        match &self.phone {
            Some(phone) => SimNumber::Phone(phone.clone()),
            None => SimNumber::Serial(self.serial.clone()),
        }
    }
}

#[derive(Clone)]
pub struct SessionKeys {
    pub id: BlockId,
    pub sim: SimNumber,
    pub status: SessionKeysStatus,
    /// Our X25519 secret for the exchange in progress
    pub our_secret: Option<Zeroizing<[u8; KEY_SIZE]>>,
    pub session_key: Option<SessionKey>,
    /// Whether we already answered the current exchange with a confirm
    pub confirm_sent: bool,
    /// Public key of the last handshake we answered; a handshake carrying
    /// it again is a duplicate delivery
    pub peer_public: Option<[u8; KEY_SIZE]>,
    pub created_at: u64,
    pub updated_at: u64,
    pub(crate) next: BlockId,
}

impl SessionKeys {
    #[must_use]
    pub fn new(sim: SimNumber, now: u64) -> Self {
        Self {
            id: BlockId::NONE,
            sim,
            status: SessionKeysStatus::None,
            our_secret: None,
            session_key: None,
            confirm_sent: false,
            peer_public: None,
            created_at: now,
            updated_at: now,
            next: BlockId::NONE,
        }
    }

    #[must_use]
    pub fn has_keys_exchanged(&self) -> bool {
        self.status == SessionKeysStatus::KeysExchanged
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("id", &self.id)
            .field("sim", &self.sim)
            .field("status", &self.status)
            .field("has_secret", &self.our_secret.is_some())
            .field("has_session_key", &self.session_key.is_some())
            .field("confirm_sent", &self.confirm_sent)
            .field("has_peer_public", &self.peer_public.is_some())
            .finish_non_exhaustive()
    }
}

fn put_key_or_filler(out: &mut Vec<u8>, key: Option<&[u8; KEY_SIZE]>) {
    match key {
        Some(key) => out.extend_from_slice(key),
        None => {
            let mut filler = [0u8; KEY_SIZE];
            fill_random(&mut filler);
            out.extend_from_slice(&filler);
        }
    }
}

impl Record for SessionKeys {
    fn id(&self) -> BlockId {
        self.id
    }

    fn set_id(&mut self, id: BlockId) {
        self.id = id;
    }

    fn next(&self) -> BlockId {
        self.next
    }

    fn set_next(&mut self, next: BlockId) {
        self.next = next;
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(151);
        out.extend_from_slice(&self.next.0.to_be_bytes());
        out.push(self.sim.kind());
        match to_fixed_ascii(self.sim.value(), IDENTITY_WIDTH, Charset::Ascii8) {
            Ok(field) => out.extend_from_slice(&field),
            Err(_) => out.extend_from_slice(&[0u8; IDENTITY_WIDTH]),
        }
        out.push(self.status.to_u8());

        let mut flags = 0;
        if self.our_secret.is_some() {
            flags |= FLAG_HAS_SECRET;
        }
        if self.session_key.is_some() {
            flags |= FLAG_HAS_SESSION_KEY;
        }
        if self.confirm_sent {
            flags |= FLAG_CONFIRM_SENT;
        }
        if self.peer_public.is_some() {
            flags |= FLAG_HAS_PEER_PUBLIC;
        }
        out.push(flags);

        put_key_or_filler(&mut out, self.our_secret.as_deref());
        put_key_or_filler(&mut out, self.session_key.as_ref().map(SessionKey::as_bytes));
        put_key_or_filler(&mut out, self.peer_public.as_ref());
        out.extend_from_slice(&self.created_at.to_be_bytes());
        out.extend_from_slice(&self.updated_at.to_be_bytes());
        out
    }

    fn decode(id: BlockId, bytes: &[u8]) -> Result<Self, RecordError> {
        let mut r = Reader::new(bytes);
        let next = BlockId(r.u32()?);
        let kind = r.u8()?;
        let value =
            from_fixed_ascii(r.bytes(IDENTITY_WIDTH)?, 0, IDENTITY_WIDTH, Charset::Ascii8)?;
        if value.is_empty() {
            return Err(RecordError::InvalidField("sim"));
        }
        let sim = match kind {
            0 => SimNumber::Phone(value),
            1 => SimNumber::Serial(value),
            _ => return Err(RecordError::InvalidField("sim kind")),
        };
        let status =
            SessionKeysStatus::from_u8(r.u8()?).ok_or(RecordError::InvalidField("status"))?;
        let flags = r.u8()?;
        let secret = Zeroizing::new(r.array::<KEY_SIZE>()?);
        let session_key = SessionKey::from_bytes(r.array::<KEY_SIZE>()?);
        let peer_public = r.array::<KEY_SIZE>()?;

        Ok(Self {
            id,
            sim,
            status,
            our_secret: (flags & FLAG_HAS_SECRET != 0).then_some(secret),
            session_key: (flags & FLAG_HAS_SESSION_KEY != 0).then_some(session_key),
            confirm_sent: flags & FLAG_CONFIRM_SENT != 0,
            peer_public: (flags & FLAG_HAS_PEER_PUBLIC != 0).then_some(peer_public),
            created_at: r.u64()?,
            updated_at: r.u64()?,
            next,
        })
    }
}
