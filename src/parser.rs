//! Incoming fragment parser.
//!
//! Each raw fragment handed over by the transport is classified into a
//! `ParseResult`. Classification short-circuits on the first failure:
//!
//! 1. sender identity and conversation
//! 2. fragment header
//! 3. grouping with staged siblings (missing or redundant parts)
//! 4. session keys for the active SIM
//! 5. decryption and verification
//! 6. timestamp window
//! 7. structural decode
//! 8. dispatch: advance the key exchange or store the text
//!
//! Outcomes are values. Only a failure of the store itself is reported as
//! `InternalError`, and that also puts the storage into its fatal state.

use tracing::{debug, info, warn};

use crate::block::BlockId;
use crate::config::ProtocolLimits;
use crate::conversation::{is_valid_identity, Conversation};
use crate::encoding::Reader;
use crate::exchange::{self, Confirm, ExchangeError, Handshake};
use crate::fragment::{self, Fragment, FragmentType, RawFragment};
use crate::fs::FileSystem;
use crate::message_data::{Direction, MessageData, MessageKind};
use crate::pending::PendingFragment;
use crate::pki::KeyCustody;
use crate::session_keys::{SessionKeys, SessionKeysStatus, SimContext};
use crate::storage::{now_millis, Storage, StorageError, Txn};
use crate::text::CompressedText;

/// Classification of one incoming fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseResult {
    OkText,
    OkHandshakeMessage,
    OkConfirmMessage,
    UnknownSender,
    /// Held until the rest of the group arrives
    MissingParts,
    /// A part with this index is already staged; the fragment was dropped
    RedundantParts,
    NoSessionKeys,
    CouldNotDecrypt,
    CouldNotVerify,
    TimestampInFuture,
    TimestampOld,
    CorruptedData,
    /// The store failed and is now in its fatal state
    InternalError,
    /// The key-custody service did not hand out the master key; the
    /// fragment was not consumed and may be submitted again
    NotReady,
}

impl ParseResult {
    #[must_use]
    pub fn is_ok(self) -> bool {
        matches!(
            self,
            Self::OkText | Self::OkHandshakeMessage | Self::OkConfirmMessage
        )
    }
}

impl From<ExchangeError> for ParseResult {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::NoSessionKeys => Self::NoSessionKeys,
            ExchangeError::CouldNotDecrypt => Self::CouldNotDecrypt,
            ExchangeError::CouldNotVerify => Self::CouldNotVerify,
            ExchangeError::CorruptedData => Self::CorruptedData,
        }
    }
}

/// Result of a submitted fragment plus any fragments that must be sent
/// back to the sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOutcome {
    pub result: ParseResult,
    pub replies: Vec<RawFragment>,
}

impl From<ParseResult> for ParseOutcome {
    fn from(result: ParseResult) -> Self {
        Self {
            result,
            replies: Vec::new(),
        }
    }
}

impl<F: FileSystem, K: KeyCustody> Storage<F, K> {
    /// Classify one raw fragment from `sender`, received on the SIM
    /// described by `sim`
    pub fn submit_fragment(&self, sender: &str, raw: &[u8], sim: &SimContext) -> ParseOutcome {
        self.submit_fragment_at(sender, raw, sim, now_millis())
    }

    pub fn submit_fragment_at(
        &self,
        sender: &str,
        raw: &[u8],
        sim: &SimContext,
        now: u64,
    ) -> ParseOutcome {
        let limits = self.config().limits;

        match self.transaction(|txn| classify(txn, sender, raw, sim, now, &limits)) {
            Ok(outcome) => {
                if outcome.result.is_ok() {
                    info!(result = ?outcome.result, replies = outcome.replies.len(), "fragment accepted");
                } else {
                    warn!(result = ?outcome.result, "fragment rejected");
                }
                outcome
            }
            Err(StorageError::NotReady) => {
                warn!("key service not ready, fragment not consumed");
                ParseResult::NotReady.into()
            }
            Err(e) => {
                self.mark_fatal(&e);
                ParseResult::InternalError.into()
            }
        }
    }
}

fn check_timestamp(timestamp: u64, now: u64, limits: &ProtocolLimits) -> Option<ParseResult> {
    if timestamp > now.saturating_add(limits.max_future_skew_millis) {
        Some(ParseResult::TimestampInFuture)
    } else if now.saturating_sub(timestamp) > limits.max_message_age_millis {
        Some(ParseResult::TimestampOld)
    } else {
        None
    }
}

fn classify<F: FileSystem>(
    txn: &mut Txn<'_, F>,
    sender: &str,
    raw: &[u8],
    sim: &SimContext,
    now: u64,
    limits: &ProtocolLimits,
) -> Result<ParseOutcome, StorageError> {
    if !is_valid_identity(sender) {
        return Ok(ParseResult::UnknownSender.into());
    }
    let fragment = match Fragment::parse(raw) {
        Ok(fragment) => fragment,
        Err(e) => {
            debug!(error = %e, "bad fragment header");
            return Ok(ParseResult::CorruptedData.into());
        }
    };

    let conv = txn.find_conversation(sender)?;
    if conv.is_none() && fragment.kind != FragmentType::Handshake {
        return Ok(ParseResult::UnknownSender.into());
    }

    purge_stale(txn, now, limits)?;
    let parts = match gather(txn, sender, &fragment, raw, now)? {
        Ok(parts) => parts,
        Err(result) => return Ok(result.into()),
    };
    let Ok(payload) = fragment::reassemble(&parts) else {
        return Ok(ParseResult::CorruptedData.into());
    };

    match (fragment.kind, conv) {
        (FragmentType::Handshake, _) => on_handshake(txn, sender, &payload, sim, now, limits),
        (FragmentType::Confirm, Some(conv)) => on_confirm(txn, conv, &payload, sim, now, limits),
        (FragmentType::Text, Some(conv)) => on_text(txn, conv, &payload, sim, now, limits),
        (_, None) => Ok(ParseResult::UnknownSender.into()),
    }
}

/// Drop staged fragments older than the accepted message age
fn purge_stale<F: FileSystem>(
    txn: &mut Txn<'_, F>,
    now: u64,
    limits: &ProtocolLimits,
) -> Result<(), StorageError> {
    let stale: Vec<BlockId> = txn
        .pending()?
        .into_iter()
        .filter(|p| now.saturating_sub(p.received_at) > limits.max_message_age_millis)
        .map(|p| p.id)
        .collect();
    for id in stale {
        debug!(pending = %id, "dropping stale fragment");
        txn.remove_pending(id)?;
    }
    Ok(())
}

/// Combine `fragment` with its staged siblings.
///
/// Returns the complete group (siblings unstaged), or the result to report
/// while the group is incomplete or inconsistent.
fn gather<F: FileSystem>(
    txn: &mut Txn<'_, F>,
    sender: &str,
    fragment: &Fragment,
    raw: &[u8],
    now: u64,
) -> Result<Result<Vec<Fragment>, ParseResult>, StorageError> {
    let siblings: Vec<(BlockId, Fragment)> = txn
        .pending()?
        .into_iter()
        .filter(|p| p.sender == sender)
        .filter_map(|p| p.fragment().ok().map(|f| (p.id, f)))
        .filter(|(_, f)| f.group_id == fragment.group_id)
        .collect();

    if siblings.iter().any(|(_, f)| f.index == fragment.index) {
        return Ok(Err(ParseResult::RedundantParts));
    }

    let consistent = siblings
        .iter()
        .all(|(_, f)| f.kind == fragment.kind && f.count == fragment.count);
    if !consistent {
        for (id, _) in &siblings {
            txn.remove_pending(*id)?;
        }
        return Ok(Err(ParseResult::CorruptedData));
    }

    if siblings.len() + 1 < fragment.count as usize {
        let Ok(raw) = RawFragment::try_from(raw) else {
            return Ok(Err(ParseResult::CorruptedData));
        };
        txn.stage(&mut PendingFragment::new(sender, now, raw))?;
        debug!(
            group = fragment.group_id,
            have = siblings.len() + 1,
            count = fragment.count,
            "staged fragment"
        );
        return Ok(Err(ParseResult::MissingParts));
    }

    let mut parts = Vec::with_capacity(siblings.len() + 1);
    for (id, part) in siblings {
        txn.remove_pending(id)?;
        parts.push(part);
    }
    parts.push(fragment.clone());
    Ok(Ok(parts))
}

fn on_handshake<F: FileSystem>(
    txn: &mut Txn<'_, F>,
    sender: &str,
    payload: &[u8],
    sim: &SimContext,
    now: u64,
    limits: &ProtocolLimits,
) -> Result<ParseOutcome, StorageError> {
    let handshake = match Handshake::decode(payload) {
        Ok(handshake) => handshake,
        Err(e) => return Ok(ParseResult::from(e).into()),
    };
    if let Some(result) = check_timestamp(handshake.timestamp, now, limits) {
        return Ok(result.into());
    }

    let existing = txn.find_conversation(sender)?;
    let resolved = match &existing {
        Some(conv) => txn.resolve_keys(conv, sim)?,
        None => None,
    };
    let mut keys = resolved.unwrap_or_else(|| SessionKeys::new(sim.preferred(), now));
    let confirm = match exchange::accept_handshake(&mut keys, &handshake, now) {
        Ok(Some(confirm)) => confirm,
        Ok(None) => {
            debug!(sender, "handshake already answered");
            return Ok(ParseResult::OkHandshakeMessage.into());
        }
        Err(e) => return Ok(ParseResult::from(e).into()),
    };

    let mut conv = match existing {
        Some(conv) => conv,
        None => txn.create_conversation(sender)?,
    };
    txn.save_keys(&mut conv, &mut keys)?;
    txn.add_message(
        &mut conv,
        &mut MessageData::control(MessageKind::Handshake, Direction::Incoming, handshake.timestamp),
    )?;
    info!(conversation = %conv.id, "accepted handshake");

    Ok(ParseOutcome {
        result: ParseResult::OkHandshakeMessage,
        replies: fragment::split(FragmentType::Confirm, &confirm.encode())?,
    })
}

fn on_confirm<F: FileSystem>(
    txn: &mut Txn<'_, F>,
    mut conv: Conversation,
    payload: &[u8],
    sim: &SimContext,
    now: u64,
    limits: &ProtocolLimits,
) -> Result<ParseOutcome, StorageError> {
    let Some(mut keys) = txn.resolve_keys(&conv, sim)? else {
        return Ok(ParseResult::NoSessionKeys.into());
    };
    let confirm = match Confirm::decode(payload) {
        Ok(confirm) => confirm,
        Err(e) => return Ok(ParseResult::from(e).into()),
    };
    let (key, timestamp) = match exchange::open_confirm(&keys, &confirm) {
        Ok(opened) => opened,
        Err(e) => return Ok(ParseResult::from(e).into()),
    };
    if let Some(result) = check_timestamp(timestamp, now, limits) {
        return Ok(result.into());
    }

    let advancing = keys.status != SessionKeysStatus::KeysExchanged;
    let reply = match exchange::accept_confirm(&mut keys, key, now) {
        Ok(reply) => reply,
        Err(e) => return Ok(ParseResult::from(e).into()),
    };

    let mut replies = Vec::new();
    if advancing {
        txn.save_keys(&mut conv, &mut keys)?;
        txn.add_message(
            &mut conv,
            &mut MessageData::control(MessageKind::Confirm, Direction::Incoming, timestamp),
        )?;
        info!(conversation = %conv.id, "keys exchanged");
    }
    if let Some(reply) = reply {
        replies = fragment::split(FragmentType::Confirm, &reply.encode())?;
    }

    Ok(ParseOutcome {
        result: ParseResult::OkConfirmMessage,
        replies,
    })
}

fn on_text<F: FileSystem>(
    txn: &mut Txn<'_, F>,
    mut conv: Conversation,
    payload: &[u8],
    sim: &SimContext,
    now: u64,
    limits: &ProtocolLimits,
) -> Result<ParseOutcome, StorageError> {
    let Some(keys) = txn.resolve_keys(&conv, sim)? else {
        return Ok(ParseResult::NoSessionKeys.into());
    };
    let (timestamp, body) = match exchange::open_text(&keys, payload) {
        Ok(opened) => opened,
        Err(e) => return Ok(ParseResult::from(e).into()),
    };
    if let Some(result) = check_timestamp(timestamp, now, limits) {
        return Ok(result.into());
    }

    let mut reader = Reader::new(&body);
    let text = match CompressedText::read_from(&mut reader) {
        Ok(text) if reader.remaining() == 0 && text.decode().is_ok() => text,
        _ => return Ok(ParseResult::CorruptedData.into()),
    };

    txn.add_message(
        &mut conv,
        &mut MessageData::from_text(text, Direction::Incoming, timestamp),
    )?;
    Ok(ParseResult::OkText.into())
}
