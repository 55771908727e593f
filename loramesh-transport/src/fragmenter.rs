//! Splits a payload into signed radio frames.

use loramesh_wire::crypto::SigningKeyPair;
use loramesh_wire::types::MessageKind;

use crate::error::TransportError;
use crate::frame::{self, Fragment, FragmentFlags, MessageId};

/// Fragments `payload` for transmission.
///
/// The message id is the truncated SHA-256 of the whole payload, so every
/// receiver derives the same id independently. FIRST and LAST mark the
/// boundary fragments; a single-frame message carries both. The PRIORITY
/// flag is copied onto the boundary fragments, ACK_REQUIRED onto all.
pub fn fragment_payload(
    payload: &[u8],
    kind: MessageKind,
    priority: bool,
    ack_required: bool,
    keys: &SigningKeyPair,
) -> Result<Vec<Fragment>, TransportError> {
    if payload.is_empty() {
        return Err(TransportError::InvalidFragment("empty payload"));
    }
    let cap = frame::payload_cap(kind);
    let total = payload.len().div_ceil(cap);
    if total > frame::MAX_FRAGMENTS_PER_MESSAGE as usize {
        return Err(TransportError::InvalidFragment("payload too large"));
    }
    let total = total as u16;
    let message_id = MessageId::from_payload(payload);

    let mut fragments = Vec::with_capacity(total as usize);
    for (sequence, chunk) in payload.chunks(cap).enumerate() {
        let sequence = sequence as u16;
        let mut flags = FragmentFlags::empty();
        let boundary = sequence == 0 || sequence == total - 1;
        if sequence == 0 {
            flags |= FragmentFlags::FIRST;
        }
        if sequence == total - 1 {
            flags |= FragmentFlags::LAST;
        }
        if priority && boundary {
            flags |= FragmentFlags::PRIORITY;
        }
        if ack_required {
            flags |= FragmentFlags::ACK_REQUIRED;
        }
        fragments.push(Fragment::build(
            message_id,
            sequence,
            total,
            flags,
            chunk.to_vec(),
            keys,
        ));
    }
    Ok(fragments)
}

/// Reassembles fragments back into the original payload without any session
/// bookkeeping. Used on the single-frame fast path and in tests.
pub fn concat_payloads(mut fragments: Vec<Fragment>) -> Vec<u8> {
    fragments.sort_by_key(|f| f.header.sequence);
    let mut out = Vec::with_capacity(fragments.iter().map(|f| f.payload.len()).sum());
    for fragment in fragments {
        out.extend_from_slice(&fragment.payload);
    }
    out
}
