//! Master-key adapter over the key-custody service.
//!
//! The master key is never derived locally from user input: it is fetched
//! from the key-custody service, generated here exactly once if the
//! service holds none yet, and cached in memory (zeroized on drop) so
//! later storage operations don't wait on the service.

use parking_lot::Mutex;
use tracing::info;

use crate::crypto::{self, CryptoError, MasterKey};
use crate::pki::{KeyCustody, KeyService};

/// Name of the master key inside the key-custody service
pub const MASTER_KEY_NAME: &str = "sms-vault.master-key";

pub struct Encryption<K: KeyCustody> {
    service: KeyService<K>,
    cached: Mutex<Option<MasterKey>>,
}

impl<K: KeyCustody> Encryption<K> {
    pub fn new(service: KeyService<K>) -> Self {
        Self {
            service,
            cached: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn key_service(&self) -> &KeyService<K> {
        &self.service
    }

    /// Make sure the service holds a master key (idempotent)
    pub fn generate_master_key(&self) -> Result<(), CryptoError> {
        self.get_master_key().map(|_| ())
    }

    /// The master key, from cache or from the key service
    pub fn get_master_key(&self) -> Result<MasterKey, CryptoError> {
        if let Some(key) = self.cached.lock().as_ref() {
            return Ok(key.clone());
        }

        // Not holding the cache lock while the service prompts the user
        let bytes = self.service.load_or_create_secret(MASTER_KEY_NAME, || {
            info!("generating new master key");
            MasterKey::generate().as_bytes().to_vec()
        })?;
        let key = MasterKey::from_slice(&bytes)?;

        *self.cached.lock() = Some(key.clone());
        Ok(key)
    }

    /// Whether the key is already available without asking the service
    #[must_use]
    pub fn has_cached_key(&self) -> bool {
        self.cached.lock().is_some()
    }

    /// Drop the cached key (it is zeroized)
    pub fn forget_master_key(&self) {
        self.cached.lock().take();
    }

    pub fn encrypt_with_master_key(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.get_master_key()?;
        crypto::encrypt_with_key(data, key.as_bytes())
    }

    pub fn decrypt_with_master_key(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.get_master_key()?;
        crypto::decrypt_with_key(data, key.as_bytes())
    }

    #[must_use]
    pub fn self_test(&self) -> bool {
        crypto::self_test()
    }
}
