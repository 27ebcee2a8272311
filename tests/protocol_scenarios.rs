//! Integration tests simulating two phones talking over SMS
//!
//! Each device has its own storage. Fragments produced by one side are
//! handed to the other's parser the way the transport would deliver them.
//! Time is injected so the timestamp window can be exercised.

use std::sync::Arc;
use std::thread;

use sms_vault::fragment::{self, FragmentType};
use sms_vault::{
    Direction, InMemoryFs, InMemoryKeyCustody, MessageKind, ParseOutcome, ParseResult,
    RawFragment, SessionKeysStatus, SimContext, SimNumber, Storage, StorageConfig, StorageError,
    StorageEvent, MAX_LENGTH,
};

const NOW: u64 = 1_700_000_000_000;
const HOUR: u64 = 60 * 60 * 1000;
const DAY: u64 = 24 * HOUR;

struct Device {
    phone: &'static str,
    sim: SimContext,
    storage: Storage<InMemoryFs, InMemoryKeyCustody>,
    fs: InMemoryFs,
}

fn device(phone: &'static str, serial: &str) -> Device {
    let fs = InMemoryFs::new();
    let storage = Storage::open(fs.clone(), InMemoryKeyCustody::new(), StorageConfig::default())
        .unwrap();
    Device {
        phone,
        sim: SimContext::new(Some(phone), serial),
        storage,
        fs,
    }
}

/// Hand every fragment from `from` to `to`, returning each outcome
fn deliver(from: &Device, to: &Device, raws: &[RawFragment], now: u64) -> Vec<ParseOutcome> {
    raws.iter()
        .map(|raw| to.storage.submit_fragment_at(from.phone, raw, &to.sim, now))
        .collect()
}

fn last(outcomes: Vec<ParseOutcome>) -> ParseOutcome {
    outcomes.into_iter().last().unwrap()
}

/// Run a complete exchange started by `a`
fn exchange(a: &Device, b: &Device, now: u64) {
    let handshake = a.storage.start_key_exchange_at(b.phone, &a.sim, now).unwrap();
    let outcome = last(deliver(a, b, &handshake, now));
    assert_eq!(outcome.result, ParseResult::OkHandshakeMessage);

    let outcome = last(deliver(b, a, &outcome.replies, now));
    assert_eq!(outcome.result, ParseResult::OkConfirmMessage);

    let outcome = last(deliver(a, b, &outcome.replies, now));
    assert_eq!(outcome.result, ParseResult::OkConfirmMessage);
    assert!(outcome.replies.is_empty());
}

fn status(d: &Device, peer: &Device) -> Option<SessionKeysStatus> {
    d.storage
        .session_keys_for_sim(peer.phone, &d.sim)
        .unwrap()
        .map(|k| k.status)
}

// ============================================================
// KEY EXCHANGE
// ============================================================

#[test]
fn test_handshake_then_confirm() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");

    let handshake = alice
        .storage
        .start_key_exchange_at(bob.phone, &alice.sim, NOW)
        .unwrap();
    assert_eq!(handshake.len(), 1);
    assert_eq!(status(&alice, &bob), Some(SessionKeysStatus::HandshakeSent));

    let outcome = last(deliver(&alice, &bob, &handshake, NOW));
    assert_eq!(outcome.result, ParseResult::OkHandshakeMessage);
    assert_eq!(status(&bob, &alice), Some(SessionKeysStatus::HandshakeSent));
    assert!(!bob.storage.has_keys_exchanged_for_sim(alice.phone, &bob.sim).unwrap());

    let confirm = outcome.replies;
    let outcome = last(deliver(&bob, &alice, &confirm, NOW + 1));
    assert_eq!(outcome.result, ParseResult::OkConfirmMessage);
    assert!(alice.storage.has_keys_exchanged_for_sim(bob.phone, &alice.sim).unwrap());
    assert!(!bob.storage.has_keys_exchanged_for_sim(alice.phone, &bob.sim).unwrap());

    let outcome = last(deliver(&alice, &bob, &outcome.replies, NOW + 2));
    assert_eq!(outcome.result, ParseResult::OkConfirmMessage);
    assert!(bob.storage.has_keys_exchanged_for_sim(alice.phone, &bob.sim).unwrap());

    let a = alice.storage.session_keys_for_sim(bob.phone, &alice.sim).unwrap().unwrap();
    let b = bob.storage.session_keys_for_sim(alice.phone, &bob.sim).unwrap().unwrap();
    assert_eq!(a.session_key, b.session_key);
    assert!(a.our_secret.is_none() && b.our_secret.is_none());

    let kinds: Vec<_> = bob
        .storage
        .messages(alice.phone)
        .unwrap()
        .iter()
        .map(|m| (m.kind, m.direction))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (MessageKind::Confirm, Direction::Incoming),
            (MessageKind::Handshake, Direction::Incoming),
        ]
    );
}

#[test]
fn test_duplicate_confirm_is_accepted() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");

    let handshake = alice.storage.start_key_exchange_at(bob.phone, &alice.sim, NOW).unwrap();
    let confirm = last(deliver(&alice, &bob, &handshake, NOW)).replies;
    let outcome = last(deliver(&bob, &alice, &confirm, NOW));
    deliver(&alice, &bob, &outcome.replies, NOW);

    let history = alice.storage.messages(bob.phone).unwrap().len();
    let outcome = last(deliver(&bob, &alice, &confirm, NOW + 5));
    assert_eq!(outcome.result, ParseResult::OkConfirmMessage);
    assert!(outcome.replies.is_empty());
    assert_eq!(status(&alice, &bob), Some(SessionKeysStatus::KeysExchanged));
    assert_eq!(alice.storage.messages(bob.phone).unwrap().len(), history);
}

#[test]
fn test_crossing_handshakes() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");

    let from_alice = alice.storage.start_key_exchange_at(bob.phone, &alice.sim, NOW).unwrap();
    let from_bob = bob.storage.start_key_exchange_at(alice.phone, &bob.sim, NOW).unwrap();

    let at_bob = last(deliver(&alice, &bob, &from_alice, NOW));
    let at_alice = last(deliver(&bob, &alice, &from_bob, NOW));
    assert_eq!(at_bob.result, ParseResult::OkHandshakeMessage);
    assert_eq!(at_alice.result, ParseResult::OkHandshakeMessage);

    let outcome = last(deliver(&bob, &alice, &at_bob.replies, NOW));
    assert_eq!(outcome.result, ParseResult::OkConfirmMessage);
    assert!(outcome.replies.is_empty());
    let outcome = last(deliver(&alice, &bob, &at_alice.replies, NOW));
    assert_eq!(outcome.result, ParseResult::OkConfirmMessage);
    assert!(outcome.replies.is_empty());

    assert_eq!(status(&alice, &bob), Some(SessionKeysStatus::KeysExchanged));
    assert_eq!(status(&bob, &alice), Some(SessionKeysStatus::KeysExchanged));

    let text = alice.storage.send_text_at(bob.phone, "crossed", &alice.sim, NOW).unwrap();
    assert_eq!(last(deliver(&alice, &bob, &text, NOW)).result, ParseResult::OkText);
}

#[test]
fn test_rekey_keeps_history() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");
    exchange(&alice, &bob, NOW);

    let text = alice.storage.send_text_at(bob.phone, "before", &alice.sim, NOW).unwrap();
    deliver(&alice, &bob, &text, NOW);
    let old_key = bob
        .storage
        .session_keys_for_sim(alice.phone, &bob.sim)
        .unwrap()
        .and_then(|k| k.session_key);

    exchange(&bob, &alice, NOW + HOUR);
    let new_key = bob
        .storage
        .session_keys_for_sim(alice.phone, &bob.sim)
        .unwrap()
        .and_then(|k| k.session_key);
    assert_ne!(old_key, new_key);

    let text = alice.storage.send_text_at(bob.phone, "after", &alice.sim, NOW + HOUR).unwrap();
    assert_eq!(last(deliver(&alice, &bob, &text, NOW + HOUR)).result, ParseResult::OkText);

    let bodies: Vec<String> = bob
        .storage
        .messages(alice.phone)
        .unwrap()
        .iter()
        .filter(|m| m.kind == MessageKind::Text)
        .map(|m| m.body().unwrap())
        .collect();
    assert_eq!(bodies, vec!["after", "before"]);
}

#[test]
fn test_repeated_handshake_after_exchange() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");

    let handshake = alice.storage.start_key_exchange_at(bob.phone, &alice.sim, NOW).unwrap();
    let confirm = last(deliver(&alice, &bob, &handshake, NOW)).replies;
    let outcome = last(deliver(&bob, &alice, &confirm, NOW));
    deliver(&alice, &bob, &outcome.replies, NOW);
    let established = bob
        .storage
        .session_keys_for_sim(alice.phone, &bob.sim)
        .unwrap()
        .and_then(|k| k.session_key);
    let history = bob.storage.messages(alice.phone).unwrap().len();

    // The transport delivers the original handshake a second time
    let outcome = last(deliver(&alice, &bob, &handshake, NOW + 60_000));
    assert_eq!(outcome.result, ParseResult::OkHandshakeMessage);
    assert!(outcome.replies.is_empty());
    assert_eq!(status(&bob, &alice), Some(SessionKeysStatus::KeysExchanged));
    assert_eq!(
        bob.storage
            .session_keys_for_sim(alice.phone, &bob.sim)
            .unwrap()
            .and_then(|k| k.session_key),
        established
    );
    assert_eq!(bob.storage.messages(alice.phone).unwrap().len(), history);

    let text = alice.storage.send_text_at(bob.phone, "still here", &alice.sim, NOW + 61_000).unwrap();
    assert_eq!(last(deliver(&alice, &bob, &text, NOW + 61_000)).result, ParseResult::OkText);
    let reply = bob.storage.send_text_at(alice.phone, "me too", &bob.sim, NOW + 62_000).unwrap();
    assert_eq!(last(deliver(&bob, &alice, &reply, NOW + 62_000)).result, ParseResult::OkText);
}

// ============================================================
// TEXT MESSAGES
// ============================================================

#[test]
fn test_text_round_trip() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");
    exchange(&alice, &bob, NOW);

    let text = alice
        .storage
        .send_text_at(bob.phone, "Hello Bob, café at 5?", &alice.sim, NOW + 10)
        .unwrap();
    let outcome = last(deliver(&alice, &bob, &text, NOW + 20));
    assert_eq!(outcome, ParseOutcome { result: ParseResult::OkText, replies: vec![] });

    let received = &bob.storage.messages(alice.phone).unwrap()[0];
    assert_eq!(received.kind, MessageKind::Text);
    assert_eq!(received.direction, Direction::Incoming);
    assert_eq!(received.timestamp, NOW + 10);
    assert!(received.unread);
    assert_eq!(received.body().unwrap(), "Hello Bob, café at 5?");

    let conv = bob.storage.find_conversation(alice.phone).unwrap().unwrap();
    assert_eq!(conv.unread, 1);
    bob.storage.mark_read(alice.phone).unwrap();
    let conv = bob.storage.find_conversation(alice.phone).unwrap().unwrap();
    assert_eq!(conv.unread, 0);

    let sent = &alice.storage.messages(bob.phone).unwrap()[0];
    assert_eq!(sent.direction, Direction::Outgoing);
    assert!(!sent.unread);
    assert_eq!(sent.body().unwrap(), "Hello Bob, café at 5?");
}

#[test]
fn test_long_text_out_of_order() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");
    exchange(&alice, &bob, NOW);

    let body = "\u{263A} ".repeat(50) + &hex::encode(sms_vault::crypto::random_bytes(300));
    let mut text = alice.storage.send_text_at(bob.phone, &body, &alice.sim, NOW).unwrap();
    assert!(text.len() > 2);
    text.reverse();

    let outcomes = deliver(&alice, &bob, &text, NOW);
    let (final_outcome, staged) = outcomes.split_last().unwrap();
    assert!(staged.iter().all(|o| o.result == ParseResult::MissingParts));
    assert_eq!(final_outcome.result, ParseResult::OkText);

    assert!(bob.storage.pending_fragments().unwrap().is_empty());
    assert_eq!(bob.storage.messages(alice.phone).unwrap()[0].body().unwrap(), body);
    bob.storage.check_structure().unwrap();
}

#[test]
fn test_redundant_part() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");
    exchange(&alice, &bob, NOW);

    let body = hex::encode(sms_vault::crypto::random_bytes(400));
    let text = alice.storage.send_text_at(bob.phone, &body, &alice.sim, NOW).unwrap();
    assert!(text.len() >= 3);

    assert_eq!(last(deliver(&alice, &bob, &text[..1], NOW)).result, ParseResult::MissingParts);
    assert_eq!(last(deliver(&alice, &bob, &text[..1], NOW)).result, ParseResult::RedundantParts);
    assert_eq!(bob.storage.pending_fragments().unwrap().len(), 1);

    assert_eq!(last(deliver(&alice, &bob, &text[1..], NOW)).result, ParseResult::OkText);
}

#[test]
fn test_timestamp_window() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");
    exchange(&alice, &bob, NOW);

    let future = alice.storage.send_text_at(bob.phone, "soon", &alice.sim, NOW + HOUR).unwrap();
    assert_eq!(
        last(deliver(&alice, &bob, &future, NOW)).result,
        ParseResult::TimestampInFuture
    );

    let old = alice.storage.send_text_at(bob.phone, "late", &alice.sim, NOW).unwrap();
    assert_eq!(
        last(deliver(&alice, &bob, &old, NOW + 15 * DAY)).result,
        ParseResult::TimestampOld
    );

    let skewed = alice.storage.send_text_at(bob.phone, "ok", &alice.sim, NOW + 60_000).unwrap();
    assert_eq!(last(deliver(&alice, &bob, &skewed, NOW)).result, ParseResult::OkText);
}

#[test]
fn test_old_handshake_creates_nothing() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");

    let handshake = alice.storage.start_key_exchange_at(bob.phone, &alice.sim, NOW).unwrap();
    let outcome = last(deliver(&alice, &bob, &handshake, NOW + 20 * DAY));
    assert_eq!(outcome.result, ParseResult::TimestampOld);
    assert!(bob.storage.conversations().unwrap().is_empty());
}

// ============================================================
// REJECTED INPUT
// ============================================================

#[test]
fn test_unknown_sender() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");

    let raws = fragment::split(FragmentType::Text, &[0u8; 60]).unwrap();
    assert_eq!(last(deliver(&alice, &bob, &raws, NOW)).result, ParseResult::UnknownSender);

    let raws = fragment::split(FragmentType::Confirm, &[0u8; 60]).unwrap();
    assert_eq!(last(deliver(&alice, &bob, &raws, NOW)).result, ParseResult::UnknownSender);
    assert!(bob.storage.conversations().unwrap().is_empty());
}

#[test]
fn test_text_without_keys() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");
    bob.storage.create_conversation(alice.phone).unwrap();

    let raws = fragment::split(FragmentType::Text, &[0u8; 60]).unwrap();
    assert_eq!(last(deliver(&alice, &bob, &raws, NOW)).result, ParseResult::NoSessionKeys);

    assert!(matches!(
        alice.storage.send_text_at(bob.phone, "hi", &alice.sim, NOW),
        Err(StorageError::NotFound)
    ));
    alice.storage.start_key_exchange_at(bob.phone, &alice.sim, NOW).unwrap();
    assert!(matches!(
        alice.storage.send_text_at(bob.phone, "hi", &alice.sim, NOW),
        Err(StorageError::NoSessionKeys)
    ));
}

#[test]
fn test_tampered_text() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");
    exchange(&alice, &bob, NOW);

    let mut text = alice.storage.send_text_at(bob.phone, "pay 10", &alice.sim, NOW).unwrap();
    assert_eq!(text.len(), 1);
    text[0][fragment::FRAGMENT_HEADER_SIZE + 15] ^= 0x01;
    assert_eq!(last(deliver(&alice, &bob, &text, NOW)).result, ParseResult::CouldNotVerify);

    let short = fragment::split(FragmentType::Text, &[0u8; 10]).unwrap();
    assert_eq!(last(deliver(&alice, &bob, &short, NOW)).result, ParseResult::CouldNotDecrypt);

    let texts = bob
        .storage
        .messages(alice.phone)
        .unwrap()
        .into_iter()
        .filter(|m| m.kind == MessageKind::Text)
        .count();
    assert_eq!(texts, 0);
}

#[test]
fn test_forged_handshake_digest() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");

    let mut handshake = alice.storage.start_key_exchange_at(bob.phone, &alice.sim, NOW).unwrap();
    handshake[0][fragment::FRAGMENT_HEADER_SIZE + 3] ^= 0x80;
    let outcome = last(deliver(&alice, &bob, &handshake, NOW));
    assert_eq!(outcome.result, ParseResult::CouldNotVerify);
    assert!(outcome.replies.is_empty());
    assert!(bob.storage.conversations().unwrap().is_empty());
}

#[test]
fn test_too_large_leaves_no_allocation() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");
    exchange(&alice, &bob, NOW);

    let before = alice.storage.check_structure().unwrap();
    let body = hex::encode(sms_vault::crypto::random_bytes(2 * MAX_LENGTH));
    let err = alice.storage.send_text_at(bob.phone, &body, &alice.sim, NOW).unwrap_err();
    assert!(matches!(err, StorageError::TooLarge { .. }));
    assert!(!err.is_fatal());

    assert_eq!(alice.storage.check_structure().unwrap(), before);
    assert_eq!(alice.storage.messages(bob.phone).unwrap().len(), 2);
}

// ============================================================
// SIM IDENTITY
// ============================================================

#[test]
fn test_serial_keys_migrate_to_phone() {
    let alice = device("+15550100", "8901");
    let mut bob = device("+15550200", "8902");
    bob.sim = SimContext::new(None, "8902");
    exchange(&alice, &bob, NOW);

    let by_serial = bob.storage.session_keys(alice.phone).unwrap();
    assert_eq!(by_serial.len(), 1);
    assert_eq!(by_serial[0].sim, SimNumber::Serial("8902".into()));

    // The phone number of bob's SIM becomes known
    bob.sim = SimContext::new(Some("+15550200"), "8902");
    assert!(bob.storage.has_keys_exchanged_for_sim(alice.phone, &bob.sim).unwrap());

    let records = bob.storage.session_keys(alice.phone).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].sim, SimNumber::Phone("+15550200".into()));
    assert_eq!(records[0].id, by_serial[0].id);
    assert_eq!(records[0].session_key, by_serial[0].session_key);
    assert_eq!(records[0].status, SessionKeysStatus::KeysExchanged);

    let text = alice.storage.send_text_at(bob.phone, "still here", &alice.sim, NOW).unwrap();
    assert_eq!(last(deliver(&alice, &bob, &text, NOW)).result, ParseResult::OkText);
}

#[test]
fn test_other_sim_has_no_keys() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");
    exchange(&alice, &bob, NOW);

    let other_sim = SimContext::new(Some("+15550999"), "8999");
    assert!(!bob.storage.has_keys_exchanged_for_sim(alice.phone, &other_sim).unwrap());

    let text = alice.storage.send_text_at(bob.phone, "hi", &alice.sim, NOW).unwrap();
    let outcome = bob.storage.submit_fragment_at(alice.phone, &text[0], &other_sim, NOW);
    assert_eq!(outcome.result, ParseResult::NoSessionKeys);
}

// ============================================================
// STORE LIFECYCLE
// ============================================================

#[test]
fn test_delete_conversation_frees_blocks() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");
    exchange(&alice, &bob, NOW);
    for i in 0..5 {
        let text = alice
            .storage
            .send_text_at(bob.phone, &format!("message {i}"), &alice.sim, NOW)
            .unwrap();
        deliver(&alice, &bob, &text, NOW);
    }
    assert!(bob.storage.check_structure().unwrap().live_blocks > 5);

    bob.storage.delete_conversation(alice.phone).unwrap();
    let report = bob.storage.check_structure().unwrap();
    assert_eq!(report.live_blocks, 0);
    assert_eq!(report.free_blocks as u32, report.block_count - 1);
    assert!(bob.storage.find_conversation(alice.phone).unwrap().is_none());
}

#[test]
fn test_concurrent_callers_share_one_store() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");
    exchange(&alice, &bob, NOW);

    let incoming: Vec<RawFragment> = (0..20)
        .flat_map(|i| {
            alice
                .storage
                .send_text_at(bob.phone, &format!("incoming {i}"), &alice.sim, NOW)
                .unwrap()
        })
        .collect();
    assert_eq!(incoming.len(), 20);

    let (alice_phone, bob_sim) = (alice.phone, bob.sim.clone());
    let storage = Arc::new(bob.storage);

    thread::scope(|s| {
        let parser = Arc::clone(&storage);
        let sim = bob_sim.clone();
        s.spawn(move || {
            for raw in &incoming {
                let outcome = parser.submit_fragment_at(alice_phone, raw, &sim, NOW + 1);
                assert_eq!(outcome.result, ParseResult::OkText);
            }
        });

        let sender = Arc::clone(&storage);
        let sim = bob_sim.clone();
        s.spawn(move || {
            for i in 0..20 {
                sender
                    .send_text_at(alice_phone, &format!("outgoing {i}"), &sim, NOW + 1)
                    .unwrap();
            }
        });

        let churn = Arc::clone(&storage);
        s.spawn(move || {
            for i in 0..20 {
                let phone = format!("+1555030{}", i % 10);
                churn.create_conversation(&phone).unwrap();
                churn.delete_conversation(&phone).unwrap();
            }
        });
    });

    assert!(!storage.is_fatal());
    let texts = storage
        .messages(alice_phone)
        .unwrap()
        .into_iter()
        .filter(|m| m.kind == MessageKind::Text)
        .count();
    assert_eq!(texts, 40);
    assert_eq!(storage.conversations().unwrap().len(), 1);

    let report = storage.check_structure().unwrap();
    assert_eq!(
        report.live_blocks + report.free_blocks + 1,
        report.block_count as usize
    );
}

#[test]
fn test_events_follow_handshake() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");
    let events = bob.storage.subscribe();

    let handshake = alice.storage.start_key_exchange_at(bob.phone, &alice.sim, NOW).unwrap();
    deliver(&alice, &bob, &handshake, NOW);

    let received: Vec<StorageEvent> = events.try_iter().collect();
    assert_eq!(
        received,
        vec![
            StorageEvent::ConversationCreated { phone: alice.phone.into() },
            StorageEvent::SessionKeysChanged {
                phone: alice.phone.into(),
                status: SessionKeysStatus::HandshakeSent,
            },
            StorageEvent::MessageStored { phone: alice.phone.into() },
        ]
    );
}

#[test]
fn test_corrupted_store_is_internal_error() {
    let alice = device("+15550100", "8901");
    let bob = device("+15550200", "8902");
    exchange(&alice, &bob, NOW);
    let events = bob.storage.subscribe();

    let mut bytes = bob.fs.contents();
    let align = StorageConfig::default().align_size;
    for b in &mut bytes[align..2 * align] {
        *b ^= 0xFF;
    }
    bob.fs.set_contents(bytes);

    let text = alice.storage.send_text_at(bob.phone, "hi", &alice.sim, NOW).unwrap();
    assert_eq!(last(deliver(&alice, &bob, &text, NOW)).result, ParseResult::InternalError);
    assert!(bob.storage.is_fatal());
    assert_eq!(events.try_iter().collect::<Vec<_>>(), vec![StorageEvent::Fatal]);

    assert_eq!(last(deliver(&alice, &bob, &text, NOW)).result, ParseResult::InternalError);
    assert!(matches!(
        bob.storage.conversations(),
        Err(StorageError::Fatal)
    ));
}
