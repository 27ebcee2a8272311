//! Storage context: the block store, the master-key adapter and the
//! fatal-state flag behind one handle.
//!
//! Every logical operation runs as a `Txn` under the single store lock, so
//! no two operations interleave their block writes. The master key is
//! fetched before the lock is taken: the key-custody service may have to
//! wait for the user, and that wait must not block other callers.
//!
//! An I/O error or a corrupted structure puts the storage into a fatal
//! state. From then on every operation fails with `StorageError::Fatal`
//! until the storage is reopened.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::block::BlockId;
use crate::block_store::{BlockStore, BlockStoreError, StructureReport};
use crate::chain;
use crate::config::StorageConfig;
use crate::conversation::{is_valid_identity, Conversation};
use crate::crypto::{CryptoError, MasterKey};
use crate::encryption::Encryption;
use crate::events::{EventBus, StorageEvent};
use crate::fragment::FragmentError;
use crate::fs::FileSystem;
use crate::message_data::MessageData;
use crate::pending::PendingFragment;
use crate::pki::{KeyCustody, KeyService};
use crate::record::{self, ListError};
use crate::session_keys::{SessionKeys, SimContext, SimNumber};
use crate::text::TextError;

/// Error types for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage is in a fatal state")]
    Fatal,
    #[error("Key service not ready")]
    NotReady,
    #[error("Message too large: {len} > {max}")]
    TooLarge { len: usize, max: usize },
    #[error("Not found")]
    NotFound,
    #[error("Invalid phone number {0:?}")]
    InvalidPhone(String),
    #[error("No session keys")]
    NoSessionKeys,
    #[error("Corrupted data: {0}")]
    Corrupted(String),
    #[error("Block store error: {0}")]
    Store(#[from] BlockStoreError),
    #[error("Record error: {0}")]
    List(#[from] ListError),
    #[error("Crypto error: {0}")]
    Crypto(CryptoError),
    #[error("Text error: {0}")]
    Text(TextError),
    #[error("Fragment error: {0}")]
    Fragment(#[from] FragmentError),
}

impl StorageError {
    /// Whether this error leaves the store unusable
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Fatal | Self::Store(_) | Self::List(_) | Self::Corrupted(_)
        )
    }
}

impl From<CryptoError> for StorageError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::KeyServiceNotReady => Self::NotReady,
            other => Self::Crypto(other),
        }
    }
}

impl From<TextError> for StorageError {
    fn from(e: TextError) -> Self {
        match e {
            TextError::TooLarge { len, max } => Self::TooLarge { len, max },
            other => Self::Text(other),
        }
    }
}

impl From<chain::ChainError> for StorageError {
    fn from(e: chain::ChainError) -> Self {
        Self::List(ListError::Chain(e))
    }
}

/// Current wall-clock time in unix milliseconds
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Shared storage handle
pub struct Storage<F: FileSystem, K: KeyCustody> {
    store: Mutex<BlockStore<F>>,
    encryption: Encryption<K>,
    config: StorageConfig,
    fatal: AtomicBool,
    events: EventBus<StorageEvent>,
}

impl<F: FileSystem, K: KeyCustody> Storage<F, K> {
    /// Open (or create) the store file behind `fs`.
    ///
    /// Does not contact the key service; the master key is fetched on the
    /// first operation that needs it.
    pub fn open(fs: F, custody: K, config: StorageConfig) -> Result<Self, StorageError> {
        let store = BlockStore::open(fs, config.align_size)?;
        let service = KeyService::new(custody, config.key_service_timeout_secs);
        info!(blocks = store.block_count(), "storage opened");
        Ok(Self {
            store: Mutex::new(store),
            encryption: Encryption::new(service),
            config,
            fatal: AtomicBool::new(false),
            events: EventBus::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    #[must_use]
    pub fn encryption(&self) -> &Encryption<K> {
        &self.encryption
    }

    #[must_use]
    pub fn key_service(&self) -> &KeyService<K> {
        self.encryption.key_service()
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    /// Receive every storage event emitted from now on
    pub fn subscribe(&self) -> Receiver<StorageEvent> {
        self.events.subscribe()
    }

    pub(crate) fn mark_fatal(&self, reason: &dyn std::fmt::Display) {
        if !self.fatal.swap(true, Ordering::SeqCst) {
            error!(%reason, "storage entered fatal state");
            self.events.emit(StorageEvent::Fatal);
        }
    }

    fn ensure_usable(&self) -> Result<(), StorageError> {
        if self.is_fatal() {
            return Err(StorageError::Fatal);
        }
        Ok(())
    }

    /// Run one logical operation under the store lock.
    ///
    /// Events raised by the operation are published only if it succeeds.
    pub(crate) fn transaction<T>(
        &self,
        op: impl FnOnce(&mut Txn<'_, F>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        self.ensure_usable()?;
        let key = self.encryption.get_master_key()?;

        let mut guard = self.store.lock();
        self.ensure_usable()?;
        let mut txn = Txn {
            store: &mut guard,
            key: &key,
            events: Vec::new(),
        };
        let result = op(&mut txn).and_then(|value| {
            txn.store.flush()?;
            Ok(value)
        });
        let events = std::mem::take(&mut txn.events);
        drop(guard);

        match result {
            Ok(value) => {
                for event in events {
                    self.events.emit(event);
                }
                Ok(value)
            }
            Err(e) => {
                if e.is_fatal() {
                    self.mark_fatal(&e);
                }
                Err(e)
            }
        }
    }

    // ============================================================
    // CONVERSATIONS
    // ============================================================

    /// All conversations, most recently created first
    pub fn conversations(&self) -> Result<Vec<Conversation>, StorageError> {
        self.transaction(|txn| txn.conversations())
    }

    pub fn find_conversation(&self, phone: &str) -> Result<Option<Conversation>, StorageError> {
        self.transaction(|txn| txn.find_conversation(phone))
    }

    /// Conversation with `phone`, created if it doesn't exist
    pub fn create_conversation(&self, phone: &str) -> Result<Conversation, StorageError> {
        self.transaction(|txn| txn.create_conversation(phone))
    }

    /// Delete a conversation with all its messages and session keys
    pub fn delete_conversation(&self, phone: &str) -> Result<(), StorageError> {
        self.transaction(|txn| txn.delete_conversation(phone))
    }

    // ============================================================
    // MESSAGES
    // ============================================================

    /// Messages of a conversation, newest first
    pub fn messages(&self, phone: &str) -> Result<Vec<MessageData>, StorageError> {
        self.transaction(|txn| {
            let conv = txn.require_conversation(phone)?;
            txn.messages(&conv)
        })
    }

    pub fn delete_message(&self, phone: &str, id: BlockId) -> Result<(), StorageError> {
        self.transaction(|txn| {
            let mut conv = txn.require_conversation(phone)?;
            txn.delete_message(&mut conv, id)
        })
    }

    /// Clear the unread flag of every message in the conversation
    pub fn mark_read(&self, phone: &str) -> Result<(), StorageError> {
        self.transaction(|txn| {
            let mut conv = txn.require_conversation(phone)?;
            txn.mark_read(&mut conv)
        })
    }

    // ============================================================
    // SESSION KEYS
    // ============================================================

    /// Every session-keys record of a conversation
    pub fn session_keys(&self, phone: &str) -> Result<Vec<SessionKeys>, StorageError> {
        self.transaction(|txn| {
            let conv = txn.require_conversation(phone)?;
            txn.session_keys(&conv)
        })
    }

    /// Session keys that apply to the active SIM. May refile a record
    /// found by serial under the SIM's now-known phone number.
    pub fn session_keys_for_sim(
        &self,
        phone: &str,
        sim: &SimContext,
    ) -> Result<Option<SessionKeys>, StorageError> {
        self.transaction(|txn| match txn.find_conversation(phone)? {
            Some(conv) => txn.resolve_keys(&conv, sim),
            None => Ok(None),
        })
    }

    pub fn has_keys_exchanged_for_sim(
        &self,
        phone: &str,
        sim: &SimContext,
    ) -> Result<bool, StorageError> {
        Ok(self
            .session_keys_for_sim(phone, sim)?
            .is_some_and(|keys| keys.has_keys_exchanged()))
    }

    // ============================================================
    // STAGING AND STRUCTURE
    // ============================================================

    /// Fragments waiting for the rest of their group
    pub fn pending_fragments(&self) -> Result<Vec<PendingFragment>, StorageError> {
        self.transaction(|txn| txn.pending())
    }

    /// Verify that every block is either free or owned by exactly one
    /// live record. Any inconsistency makes the storage fatal.
    pub fn check_structure(&self) -> Result<StructureReport, StorageError> {
        self.transaction(|txn| txn.check_structure())
    }
}

// ============================================================
// TRANSACTION
// ============================================================

/// One logical operation holding the store lock
pub(crate) struct Txn<'a, F: FileSystem> {
    store: &'a mut BlockStore<F>,
    key: &'a MasterKey,
    events: Vec<StorageEvent>,
}

impl<F: FileSystem> Txn<'_, F> {
    pub(crate) fn conversations(&mut self) -> Result<Vec<Conversation>, StorageError> {
        let head = self.store.conversations_head();
        Ok(record::load_list(self.store, self.key, head)?)
    }

    pub(crate) fn find_conversation(
        &mut self,
        phone: &str,
    ) -> Result<Option<Conversation>, StorageError> {
        Ok(self.conversations()?.into_iter().find(|c| c.phone == phone))
    }

    pub(crate) fn require_conversation(&mut self, phone: &str) -> Result<Conversation, StorageError> {
        self.find_conversation(phone)?.ok_or(StorageError::NotFound)
    }

    pub(crate) fn create_conversation(&mut self, phone: &str) -> Result<Conversation, StorageError> {
        if !is_valid_identity(phone) {
            return Err(StorageError::InvalidPhone(phone.to_string()));
        }
        if let Some(existing) = self.find_conversation(phone)? {
            return Ok(existing);
        }

        let mut conv = Conversation::new(phone);
        let head = self.store.conversations_head();
        let id = record::push_front(self.store, self.key, head, &mut conv)?;
        self.store.set_conversations_head(id)?;

        info!(conversation = %id, "created conversation");
        self.events.push(StorageEvent::ConversationCreated {
            phone: phone.to_string(),
        });
        Ok(conv)
    }

    pub(crate) fn save_conversation(&mut self, conv: &Conversation) -> Result<(), StorageError> {
        Ok(record::save(self.store, self.key, conv)?)
    }

    pub(crate) fn delete_conversation(&mut self, phone: &str) -> Result<(), StorageError> {
        let conv = self.require_conversation(phone)?;

        for keys in self.session_keys(&conv)? {
            chain::free_chain(self.store, self.key, keys.id)?;
        }
        for message in self.messages(&conv)? {
            chain::free_chain(self.store, self.key, message.id)?;
        }

        let head = self.store.conversations_head();
        let head = record::unlink::<Conversation, F>(self.store, self.key, head, conv.id)?;
        self.store.set_conversations_head(head)?;

        info!(conversation = %conv.id, "deleted conversation");
        self.events.push(StorageEvent::ConversationDeleted {
            phone: phone.to_string(),
        });
        Ok(())
    }

    pub(crate) fn messages(&mut self, conv: &Conversation) -> Result<Vec<MessageData>, StorageError> {
        Ok(record::load_list(self.store, self.key, conv.messages_head)?)
    }

    pub(crate) fn add_message(
        &mut self,
        conv: &mut Conversation,
        message: &mut MessageData,
    ) -> Result<(), StorageError> {
        let id = record::push_front(self.store, self.key, conv.messages_head, message)?;
        conv.messages_head = id;
        if message.unread {
            conv.unread = conv.unread.saturating_add(1);
        }
        self.save_conversation(conv)?;

        debug!(message = %id, kind = ?message.kind, "stored message");
        self.events.push(StorageEvent::MessageStored {
            phone: conv.phone.clone(),
        });
        Ok(())
    }

    pub(crate) fn delete_message(
        &mut self,
        conv: &mut Conversation,
        id: BlockId,
    ) -> Result<(), StorageError> {
        let message: MessageData = self
            .messages(conv)?
            .into_iter()
            .find(|m| m.id == id)
            .ok_or(StorageError::NotFound)?;

        conv.messages_head =
            record::unlink::<MessageData, F>(self.store, self.key, conv.messages_head, id)?;
        if message.unread {
            conv.unread = conv.unread.saturating_sub(1);
        }
        self.save_conversation(conv)
    }

    pub(crate) fn mark_read(&mut self, conv: &mut Conversation) -> Result<(), StorageError> {
        for mut message in self.messages(conv)? {
            if message.unread {
                message.unread = false;
                record::save(self.store, self.key, &message)?;
            }
        }
        if conv.unread != 0 {
            conv.unread = 0;
            self.save_conversation(conv)?;
        }
        Ok(())
    }

    pub(crate) fn session_keys(
        &mut self,
        conv: &Conversation,
    ) -> Result<Vec<SessionKeys>, StorageError> {
        Ok(record::load_list(self.store, self.key, conv.sessions_head)?)
    }

    /// Session keys of `conv` for the active SIM.
    ///
    /// An exact match on the SIM's phone number wins. Without one, a record
    /// filed under the SIM's serial is used; if the phone number is known
    /// by now, that record is refiled under it first. Status is never
    /// changed here.
    pub(crate) fn resolve_keys(
        &mut self,
        conv: &Conversation,
        sim: &SimContext,
    ) -> Result<Option<SessionKeys>, StorageError> {
        let records = self.session_keys(conv)?;
        let by_serial = SimNumber::Serial(sim.serial.clone());

        let Some(phone) = &sim.phone else {
            return Ok(records.into_iter().find(|r| r.sim == by_serial));
        };

        let by_phone = SimNumber::Phone(phone.clone());
        if let Some(found) = records.iter().find(|r| r.sim == by_phone) {
            return Ok(Some(found.clone()));
        }

        match records.into_iter().find(|r| r.sim == by_serial) {
            Some(mut found) => {
                found.sim = by_phone;
                record::save(self.store, self.key, &found)?;
                info!(record = %found.id, "refiled session keys under phone number");
                Ok(Some(found))
            }
            None => Ok(None),
        }
    }

    /// Store `keys`, linking it into `conv` if it is new
    pub(crate) fn save_keys(
        &mut self,
        conv: &mut Conversation,
        keys: &mut SessionKeys,
    ) -> Result<(), StorageError> {
        if keys.id.is_none() {
            let id = record::push_front(self.store, self.key, conv.sessions_head, keys)?;
            conv.sessions_head = id;
            self.save_conversation(conv)?;
        } else {
            record::save(self.store, self.key, keys)?;
        }

        self.events.push(StorageEvent::SessionKeysChanged {
            phone: conv.phone.clone(),
            status: keys.status,
        });
        Ok(())
    }

    pub(crate) fn pending(&mut self) -> Result<Vec<PendingFragment>, StorageError> {
        let head = self.store.pending_head();
        Ok(record::load_list(self.store, self.key, head)?)
    }

    pub(crate) fn stage(&mut self, pending: &mut PendingFragment) -> Result<(), StorageError> {
        let head = self.store.pending_head();
        let id = record::push_front(self.store, self.key, head, pending)?;
        self.store.set_pending_head(id)?;
        Ok(())
    }

    pub(crate) fn remove_pending(&mut self, id: BlockId) -> Result<(), StorageError> {
        let head = self.store.pending_head();
        let head = record::unlink::<PendingFragment, F>(self.store, self.key, head, id)?;
        self.store.set_pending_head(head)?;
        Ok(())
    }

    /// Every block owned by a live record
    fn live_blocks(&mut self) -> Result<Vec<BlockId>, StorageError> {
        let mut live = Vec::new();
        for conv in self.conversations()? {
            live.extend(chain::chain_blocks(self.store, self.key, conv.id)?);
            live.extend(record::list_blocks::<SessionKeys, F>(
                self.store,
                self.key,
                conv.sessions_head,
            )?);
            live.extend(record::list_blocks::<MessageData, F>(
                self.store,
                self.key,
                conv.messages_head,
            )?);
        }
        let pending_head = self.store.pending_head();
        live.extend(record::list_blocks::<PendingFragment, F>(
            self.store,
            self.key,
            pending_head,
        )?);
        Ok(live)
    }

    pub(crate) fn check_structure(&mut self) -> Result<StructureReport, StorageError> {
        let live = self.live_blocks()?;
        let report = self.store.check_structure(live)?;
        debug!(?report, "structure check passed");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;
    use crate::message_data::Direction;
    use crate::pki::InMemoryKeyCustody;
    use crate::session_keys::SessionKeysStatus;

    type TestStorage = Storage<InMemoryFs, InMemoryKeyCustody>;

    fn storage() -> (TestStorage, InMemoryFs, InMemoryKeyCustody) {
        let fs = InMemoryFs::new();
        let custody = InMemoryKeyCustody::new();
        let storage = Storage::open(fs.clone(), custody.clone(), StorageConfig::default()).unwrap();
        (storage, fs, custody)
    }

    fn add_text(storage: &TestStorage, phone: &str, body: &str) {
        storage
            .transaction(|txn| {
                let mut conv = txn.require_conversation(phone)?;
                let mut msg = MessageData::text(body, Direction::Incoming, 1)?;
                txn.add_message(&mut conv, &mut msg)
            })
            .unwrap();
    }

    fn add_keys(
        storage: &TestStorage,
        phone: &str,
        sim: SimNumber,
        status: SessionKeysStatus,
    ) {
        storage
            .transaction(|txn| {
                let mut conv = txn.require_conversation(phone)?;
                let mut keys = SessionKeys::new(sim, 1);
                keys.status = status;
                txn.save_keys(&mut conv, &mut keys)
            })
            .unwrap();
    }

    #[test]
    fn test_new_storage_is_one_block() {
        let (_storage, fs, _) = storage();
        assert_eq!(fs.contents().len(), 256);
    }

    #[test]
    fn test_create_conversation_is_idempotent() {
        let (storage, _, _) = storage();
        let a = storage.create_conversation("+48111").unwrap();
        let b = storage.create_conversation("+48111").unwrap();
        storage.create_conversation("+48222").unwrap();

        assert_eq!(a.id, b.id);
        let phones: Vec<String> = storage
            .conversations()
            .unwrap()
            .into_iter()
            .map(|c| c.phone)
            .collect();
        assert_eq!(phones, vec!["+48222", "+48111"]);
    }

    #[test]
    fn test_create_conversation_rejects_invalid_phone() {
        let (storage, _, _) = storage();
        assert!(matches!(
            storage.create_conversation(""),
            Err(StorageError::InvalidPhone(_))
        ));
        assert!(!storage.is_fatal());
    }

    #[test]
    fn test_messages_and_unread_counter() {
        let (storage, _, _) = storage();
        storage.create_conversation("+48111").unwrap();
        add_text(&storage, "+48111", "first");
        add_text(&storage, "+48111", "second");

        let messages = storage.messages("+48111").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].body().unwrap(), "second");
        assert_eq!(storage.find_conversation("+48111").unwrap().unwrap().unread, 2);

        storage.mark_read("+48111").unwrap();
        assert!(storage.messages("+48111").unwrap().iter().all(|m| !m.unread));
        assert_eq!(storage.find_conversation("+48111").unwrap().unwrap().unread, 0);
    }

    #[test]
    fn test_delete_message() {
        let (storage, _, _) = storage();
        storage.create_conversation("+48111").unwrap();
        add_text(&storage, "+48111", "keep");
        add_text(&storage, "+48111", "drop");

        let drop_id = storage.messages("+48111").unwrap()[0].id;
        storage.delete_message("+48111", drop_id).unwrap();

        let messages = storage.messages("+48111").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body().unwrap(), "keep");
        assert_eq!(storage.find_conversation("+48111").unwrap().unwrap().unread, 1);
        assert!(matches!(
            storage.delete_message("+48111", drop_id),
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn test_delete_conversation_frees_everything() {
        let (storage, _, _) = storage();
        storage.create_conversation("+48111").unwrap();
        add_text(&storage, "+48111", &"long message ".repeat(40));
        add_keys(
            &storage,
            "+48111",
            SimNumber::Phone("+48999".into()),
            SessionKeysStatus::KeysExchanged,
        );
        assert!(storage.check_structure().unwrap().live_blocks >= 3);

        storage.delete_conversation("+48111").unwrap();

        let report = storage.check_structure().unwrap();
        assert_eq!(report.live_blocks, 0);
        assert_eq!(report.free_blocks as u32, report.block_count - 1);
        assert!(storage.find_conversation("+48111").unwrap().is_none());
    }

    #[test]
    fn test_resolve_by_serial_without_phone() {
        let (storage, _, _) = storage();
        storage.create_conversation("+48111").unwrap();
        add_keys(
            &storage,
            "+48111",
            SimNumber::Serial("8948001".into()),
            SessionKeysStatus::KeysExchanged,
        );

        let sim = SimContext::new(None, "8948001");
        assert!(storage.has_keys_exchanged_for_sim("+48111", &sim).unwrap());
        assert!(!storage
            .has_keys_exchanged_for_sim("+48111", &SimContext::new(None, "other"))
            .unwrap());
    }

    #[test]
    fn test_exact_phone_match_wins() {
        let (storage, _, _) = storage();
        storage.create_conversation("+48111").unwrap();
        add_keys(
            &storage,
            "+48111",
            SimNumber::Serial("8948001".into()),
            SessionKeysStatus::HandshakeSent,
        );
        add_keys(
            &storage,
            "+48111",
            SimNumber::Phone("+48999".into()),
            SessionKeysStatus::KeysExchanged,
        );

        let sim = SimContext::new(Some("+48999"), "8948001");
        let keys = storage.session_keys_for_sim("+48111", &sim).unwrap().unwrap();
        assert_eq!(keys.status, SessionKeysStatus::KeysExchanged);
        // the serial record is left alone
        assert_eq!(storage.session_keys("+48111").unwrap().len(), 2);
    }

    #[test]
    fn test_serial_record_migrates_to_phone() {
        let (storage, _, _) = storage();
        storage.create_conversation("+48111").unwrap();
        add_keys(
            &storage,
            "+48111",
            SimNumber::Serial("8948001".into()),
            SessionKeysStatus::HandshakeSent,
        );

        let sim = SimContext::new(Some("+48999"), "8948001");
        let migrated = storage.session_keys_for_sim("+48111", &sim).unwrap().unwrap();
        assert_eq!(migrated.sim, SimNumber::Phone("+48999".into()));
        assert_eq!(migrated.status, SessionKeysStatus::HandshakeSent);

        let stored = storage.session_keys("+48111").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].sim, SimNumber::Phone("+48999".into()));
        assert_eq!(stored[0].id, migrated.id);
    }

    #[test]
    fn test_not_ready_is_not_fatal() {
        let (storage, _, custody) = storage();
        custody.set_decline_authorization(true);

        assert!(matches!(storage.conversations(), Err(StorageError::NotReady)));
        assert!(!storage.is_fatal());

        custody.set_decline_authorization(false);
        assert!(storage.conversations().unwrap().is_empty());
    }

    #[test]
    fn test_corruption_is_fatal() {
        let (storage, fs, _) = storage();
        let events = storage.subscribe();
        storage.create_conversation("+48111").unwrap();

        let mut contents = fs.contents();
        contents[256 + 40] ^= 0xFF;
        fs.set_contents(contents);

        assert!(storage.conversations().unwrap_err().is_fatal());
        assert!(storage.is_fatal());
        assert!(matches!(storage.conversations(), Err(StorageError::Fatal)));

        let received: Vec<StorageEvent> = events.try_iter().collect();
        assert_eq!(received.last(), Some(&StorageEvent::Fatal));
    }

    #[test]
    fn test_events_follow_changes() {
        let (storage, _, _) = storage();
        let events = storage.subscribe();
        storage.create_conversation("+48111").unwrap();
        storage.delete_conversation("+48111").unwrap();

        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![
                StorageEvent::ConversationCreated {
                    phone: "+48111".into()
                },
                StorageEvent::ConversationDeleted {
                    phone: "+48111".into()
                },
            ]
        );
    }
}
