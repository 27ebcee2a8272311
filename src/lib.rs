//! SMS Vault - encrypted storage and key-exchange core for a secure SMS client
//!
//! This crate provides the persistence and protocol layer of an end-to-end
//! encrypted SMS client. It uses:
//! - One store file of fixed-size aligned blocks, each sealed with the
//!   master key (AES-256-GCM-SIV), freed blocks scrubbed with random bytes
//! - A master key held by an external key-custody service, never derived
//!   from user input
//! - An X25519 handshake/confirm exchange per conversation and local SIM
//! - Fixed-length transport fragments, reassembled and classified into a
//!   `ParseResult`
//!
//! ## Architecture
//!
//! ```text
//! Transport (SMS)                 UI
//!     ↓ raw fragments             ↓ send / browse
//! Parser ─────────────→ Storage (single store lock, fatal flag, events)
//!     ├── Exchange (handshake / confirm state machine)
//!     └── Records (Conversation, SessionKeys, MessageData, PendingFragment)
//!         ↓ encrypted chains
//! BlockStore
//!     ↓ read/write at block offsets
//! FileSystem
//!     ↓
//! store.bin: [Header][Block 1][Block 2]...
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod block;
pub mod block_store;
pub mod chain;
pub mod cipher;
pub mod config;
pub mod conversation;
pub mod crypto;
pub mod encoding;
pub mod encryption;
pub mod events;
pub mod exchange;
pub mod fragment;
pub mod fs;
pub mod message_data;
pub mod parser;
pub mod pending;
pub mod pki;
pub mod record;
pub mod session_keys;
pub mod storage;
pub mod text;

pub use block::{BlockId, ALIGN_SIZE};
pub use block_store::{BlockStore, BlockStoreError, StructureReport};
pub use config::{ProtocolLimits, StorageConfig};
pub use conversation::Conversation;
pub use crypto::{CryptoError, MasterKey, SessionKey};
pub use encryption::Encryption;
pub use events::{EventBus, StorageEvent};
pub use exchange::ExchangeError;
pub use fragment::{FragmentType, RawFragment, LENGTH_MESSAGE};
pub use fs::{FileSystem, InMemoryFs, StdFs};
pub use message_data::{Direction, MessageData, MessageKind};
pub use parser::{ParseOutcome, ParseResult};
pub use pending::PendingFragment;
pub use pki::{ConnectionState, CustodyError, InMemoryKeyCustody, KeyCustody, KeyService};
pub use session_keys::{SessionKeys, SessionKeysStatus, SimContext, SimNumber};
pub use storage::{Storage, StorageError};
pub use text::{Charset, CompressedText, TextError, MAX_LENGTH};
