//! Client side of the external key-custody service ("PKI").
//!
//! The long-term master key lives in an external service behind an
//! authorize-gated key-value interface (`KeyCustody`). This module drives
//! the connection as an explicit state machine:
//!
//! ```text
//! Disconnected → Connecting → Connected → Authorized
//!       ↑______________|___________|___________|   (disconnect / declined / timeout)
//! ```
//!
//! Connection progress arrives as `CustodyEvent`s on a channel handed to
//! `KeyCustody::connect`; `KeyService` drains that channel before every
//! decision. Every failure of the service (timeout, declined, not
//! connected, bad input, internal) is folded into
//! `CryptoError::KeyServiceNotReady` at this boundary.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::crypto::CryptoError;
use crate::events::EventBus;

/// Failures reported by the key-custody service
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CustodyError {
    #[error("Key service timed out")]
    Timeout,
    #[error("Access declined by user")]
    Declined,
    #[error("Key service not connected")]
    NotConnected,
    #[error("Bad input")]
    BadInput,
    #[error("Key service internal error: {0}")]
    Internal(String),
}

/// Asynchronous notifications from the key-custody service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustodyEvent {
    Connected,
    Disconnected,
    Declined,
    TimedOut,
}

/// Connection state of the key service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authorized,
}

/// Interface of the external key-custody service
pub trait KeyCustody: Send + Sync {
    /// Start connecting; progress is reported on `events`
    fn connect(&self, events: Sender<CustodyEvent>) -> Result<(), CustodyError>;

    fn is_connected(&self) -> bool;

    /// Ask the user to grant access; `Ok(false)` means declined
    fn authorize(&self) -> Result<bool, CustodyError>;

    fn has_secret(&self, name: &str) -> Result<bool, CustodyError>;

    fn get_secret(&self, name: &str) -> Result<Vec<u8>, CustodyError>;

    fn put_secret(&self, name: &str, value: &[u8]) -> Result<(), CustodyError>;

    fn set_timeout(&self, seconds: u32);
}

/// How many times a request is attempted before reporting "not ready"
const MAX_ATTEMPTS: usize = 2;

/// Stateful wrapper around a `KeyCustody` implementation
pub struct KeyService<K: KeyCustody> {
    custody: K,
    state: Mutex<ConnectionState>,
    events_tx: Sender<CustodyEvent>,
    events_rx: Receiver<CustodyEvent>,
    state_changes: EventBus<ConnectionState>,
}

impl<K: KeyCustody> KeyService<K> {
    pub fn new(custody: K, timeout_secs: u32) -> Self {
        custody.set_timeout(timeout_secs);
        let (events_tx, events_rx) = unbounded();
        Self {
            custody,
            state: Mutex::new(ConnectionState::Disconnected),
            events_tx,
            events_rx,
            state_changes: EventBus::new(),
        }
    }

    /// Current state, after applying any pending service events
    pub fn state(&self) -> ConnectionState {
        self.pump_events();
        *self.state.lock()
    }

    /// Receive every future state change
    pub fn subscribe(&self) -> Receiver<ConnectionState> {
        self.state_changes.subscribe()
    }

    #[must_use]
    pub fn custody(&self) -> &K {
        &self.custody
    }

    /// Begin connecting if currently disconnected
    pub fn connect(&self) -> Result<(), CustodyError> {
        if self.state() != ConnectionState::Disconnected {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);
        if let Err(e) = self.custody.connect(self.events_tx.clone()) {
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }
        Ok(())
    }

    /// Apply one event to the state machine
    pub fn handle_event(&self, event: CustodyEvent) {
        let current = *self.state.lock();
        let next = match (current, event) {
            (ConnectionState::Authorized, CustodyEvent::Connected) => ConnectionState::Authorized,
            (_, CustodyEvent::Connected) => ConnectionState::Connected,
            (_, CustodyEvent::Disconnected)
            | (_, CustodyEvent::Declined)
            | (_, CustodyEvent::TimedOut) => ConnectionState::Disconnected,
        };
        if matches!(event, CustodyEvent::Declined | CustodyEvent::TimedOut) {
            warn!(?event, "key service connection failed");
        }
        self.set_state(next);
    }

    fn pump_events(&self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(from = ?*state, to = ?next, "key service state");
            *state = next;
            drop(state);
            self.state_changes.emit(next);
        }
    }

    /// Connect and authorize as needed
    fn ensure_authorized(&self) -> Result<(), CustodyError> {
        match self.state() {
            ConnectionState::Authorized if self.custody.is_connected() => return Ok(()),
            ConnectionState::Authorized => self.set_state(ConnectionState::Disconnected),
            _ => {}
        }

        if self.state() == ConnectionState::Disconnected {
            self.connect()?;
        }
        if self.state() != ConnectionState::Connected {
            return Err(CustodyError::NotConnected);
        }

        if self.custody.authorize()? {
            self.set_state(ConnectionState::Authorized);
            Ok(())
        } else {
            Err(CustodyError::Declined)
        }
    }

    /// Drop authorization after a failed request so the retry re-authorizes
    fn invalidate(&self) {
        let next = if self.custody.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        self.set_state(next);
    }

    /// Read secret `name`, storing `create()` first if it doesn't exist.
    ///
    /// A new value is generated at most once per call and written with a
    /// single `put_secret`; the returned bytes are always read back from the
    /// service, so a value committed by an earlier attempt wins.
    pub fn load_or_create_secret(
        &self,
        name: &str,
        create: impl Fn() -> Vec<u8>,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut candidate: Option<Vec<u8>> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_load_or_create(name, &mut candidate, &create) {
                Ok(secret) => return Ok(secret),
                Err(e) => {
                    warn!(attempt, error = %e, "key service request failed");
                    self.invalidate();
                }
            }
        }

        Err(CryptoError::KeyServiceNotReady)
    }

    fn try_load_or_create(
        &self,
        name: &str,
        candidate: &mut Option<Vec<u8>>,
        create: &impl Fn() -> Vec<u8>,
    ) -> Result<Vec<u8>, CustodyError> {
        self.ensure_authorized()?;

        if self.custody.has_secret(name)? {
            return self.custody.get_secret(name);
        }

        let value = candidate.get_or_insert_with(create);
        self.custody.put_secret(name, value.as_slice())?;
        info!(name, "stored new secret in key service");
        self.custody.get_secret(name)
    }
}

// ============================================================
// IN-MEMORY CUSTODY (testing)
// ============================================================

#[derive(Default)]
struct CustodyInner {
    secrets: HashMap<String, Vec<u8>>,
    connected: bool,
    decline_authorization: bool,
    decline_connection: bool,
    failing_requests: usize,
    put_count: usize,
    timeout_secs: u32,
    events: Option<Sender<CustodyEvent>>,
}

/// In-memory key-custody service for testing.
/// Clones share the same underlying state
#[derive(Default, Clone)]
pub struct InMemoryKeyCustody {
    inner: Arc<Mutex<CustodyInner>>,
}

impl InMemoryKeyCustody {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `authorize()` report a declined prompt
    pub fn set_decline_authorization(&self, decline: bool) {
        self.inner.lock().decline_authorization = decline;
    }

    /// Make `connect()` report a declined connection
    pub fn set_decline_connection(&self, decline: bool) {
        self.inner.lock().decline_connection = decline;
    }

    /// The next `n` secret requests time out
    pub fn fail_next_requests(&self, n: usize) {
        self.inner.lock().failing_requests = n;
    }

    /// Simulate the service going away
    pub fn drop_connection(&self) {
        let mut inner = self.inner.lock();
        inner.connected = false;
        if let Some(events) = &inner.events {
            let _ = events.send(CustodyEvent::Disconnected);
        }
    }

    #[must_use]
    pub fn put_count(&self) -> usize {
        self.inner.lock().put_count
    }

    #[must_use]
    pub fn timeout_secs(&self) -> u32 {
        self.inner.lock().timeout_secs
    }

    #[must_use]
    pub fn secret(&self, name: &str) -> Option<Vec<u8>> {
        self.inner.lock().secrets.get(name).cloned()
    }

    fn request(&self) -> Result<parking_lot::MutexGuard<'_, CustodyInner>, CustodyError> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(CustodyError::NotConnected);
        }
        if inner.failing_requests > 0 {
            inner.failing_requests -= 1;
            return Err(CustodyError::Timeout);
        }
        Ok(inner)
    }
}

impl KeyCustody for InMemoryKeyCustody {
    fn connect(&self, events: Sender<CustodyEvent>) -> Result<(), CustodyError> {
        let mut inner = self.inner.lock();
        if inner.decline_connection {
            let _ = events.send(CustodyEvent::Declined);
        } else {
            inner.connected = true;
            let _ = events.send(CustodyEvent::Connected);
        }
        inner.events = Some(events);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    fn authorize(&self) -> Result<bool, CustodyError> {
        let inner = self.inner.lock();
        if !inner.connected {
            return Err(CustodyError::NotConnected);
        }
        Ok(!inner.decline_authorization)
    }

    fn has_secret(&self, name: &str) -> Result<bool, CustodyError> {
        Ok(self.request()?.secrets.contains_key(name))
    }

    fn get_secret(&self, name: &str) -> Result<Vec<u8>, CustodyError> {
        self.request()?
            .secrets
            .get(name)
            .cloned()
            .ok_or(CustodyError::BadInput)
    }

    fn put_secret(&self, name: &str, value: &[u8]) -> Result<(), CustodyError> {
        let mut inner = self.request()?;
        inner.secrets.insert(name.to_string(), value.to_vec());
        inner.put_count += 1;
        Ok(())
    }

    fn set_timeout(&self, seconds: u32) {
        self.inner.lock().timeout_secs = seconds;
    }
}

// ============================================================
// TESTS
// ============================================================
