//! Dictionary codec for repetitive payloads.
//!
//! The encoder replaces known phrases with two-byte references
//! `[0x80 | id_hi, id_lo]` (ids 1..=32767); bytes with the high bit clear
//! pass through as literals. Id 0 is reserved as an escape for literal
//! bytes >= 0x80: `[0x80, 0x00, byte]`.

use std::collections::HashMap;

use crate::error::WireError;

/// Shortest phrase worth a two-byte reference.
const MIN_PHRASE_LEN: usize = 4;
/// Longest phrase considered while building the table.
const MAX_PHRASE_LEN: usize = 32;
/// Ids must fit 15 bits; 0 is the literal escape.
pub const MAX_DICTIONARY_ID: u16 = 0x7fff;

/// A longest-match phrase table built from a sample corpus.
#[derive(Debug, Clone, Default)]
pub struct DictionaryCodec {
    /// id - 1 -> phrase.
    entries: Vec<Vec<u8>>,
    ids: HashMap<Vec<u8>, u16>,
    longest: usize,
}

impl DictionaryCodec {
    /// Builds a table from sample payloads, keeping the `max_entries`
    /// phrases with the highest estimated savings.
    pub fn build(samples: &[&[u8]], max_entries: usize) -> Self {
        let mut counts: HashMap<&[u8], u32> = HashMap::new();
        for sample in samples {
            for len in MIN_PHRASE_LEN..=MAX_PHRASE_LEN.min(sample.len()) {
                for window in sample.windows(len) {
                    *counts.entry(window).or_insert(0) += 1;
                }
            }
        }

        let mut scored: Vec<(&[u8], u64)> = counts
            .into_iter()
            .filter(|&(_, count)| count >= 2)
            .map(|(phrase, count)| {
                let savings = (phrase.len() as u64 - 2) * (u64::from(count) - 1);
                (phrase, savings)
            })
            .filter(|&(_, savings)| savings > 0)
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let limit = max_entries.min(MAX_DICTIONARY_ID as usize);
        let mut codec = DictionaryCodec::default();
        for (phrase, _) in scored.into_iter().take(limit) {
            codec.insert(phrase.to_vec());
        }
        tracing::debug!(entries = codec.entries.len(), "built dictionary table");
        codec
    }

    /// Builds a table from an explicit phrase list, in order.
    pub fn from_phrases<I: IntoIterator<Item = Vec<u8>>>(phrases: I) -> Self {
        let mut codec = DictionaryCodec::default();
        for phrase in phrases {
            if codec.entries.len() >= MAX_DICTIONARY_ID as usize {
                break;
            }
            codec.insert(phrase);
        }
        codec
    }

    fn insert(&mut self, phrase: Vec<u8>) {
        if phrase.is_empty() || self.ids.contains_key(&phrase) {
            return;
        }
        let id = self.entries.len() as u16 + 1;
        self.longest = self.longest.max(phrase.len());
        self.ids.insert(phrase.clone(), id);
        self.entries.push(phrase);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Greedy longest-match encode.
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        let mut pos = 0;
        while pos < data.len() {
            let remaining = data.len() - pos;
            let mut matched = false;
            let upper = self.longest.min(remaining);
            if upper >= MIN_PHRASE_LEN {
                for len in (MIN_PHRASE_LEN..=upper).rev() {
                    if let Some(&id) = self.ids.get(&data[pos..pos + len]) {
                        out.push(0x80 | (id >> 8) as u8);
                        out.push((id & 0xff) as u8);
                        pos += len;
                        matched = true;
                        break;
                    }
                }
            }
            if !matched {
                let byte = data[pos];
                if byte < 0x80 {
                    out.push(byte);
                } else {
                    out.extend_from_slice(&[0x80, 0x00, byte]);
                }
                pos += 1;
            }
        }
        out
    }

    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(data.len() * 2);
        let mut pos = 0;
        while pos < data.len() {
            let byte = data[pos];
            if byte < 0x80 {
                out.push(byte);
                pos += 1;
                continue;
            }
            let lo = *data.get(pos + 1).ok_or(WireError::TruncatedDictionaryRef)?;
            let id = (u16::from(byte & 0x7f) << 8) | u16::from(lo);
            if id == 0 {
                let literal = *data.get(pos + 2).ok_or(WireError::TruncatedDictionaryRef)?;
                out.push(literal);
                pos += 3;
            } else {
                let phrase = self
                    .entries
                    .get(id as usize - 1)
                    .ok_or(WireError::UnknownDictionaryId(id))?;
                out.extend_from_slice(phrase);
                pos += 2;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_refs_and_escapes() {
        let codec = DictionaryCodec::from_phrases(vec![b"lockingScript".to_vec()]);
        let data = b"lockingScript:\xF0\x9F\x92\xB0:lockingScript".to_vec();
        let encoded = codec.encode(&data);
        assert!(encoded.len() < data.len() + 8);
        assert_eq!(codec.decode(&encoded).unwrap(), data);
    }

    #[test]
    fn truncated_ref_is_detected() {
        let codec = DictionaryCodec::from_phrases(vec![b"abcd".to_vec()]);
        assert_eq!(codec.decode(&[0x80]), Err(WireError::TruncatedDictionaryRef));
        assert_eq!(
            codec.decode(&[0x80, 0x00]),
            Err(WireError::TruncatedDictionaryRef)
        );
    }

    #[test]
    fn unknown_id_is_detected() {
        let codec = DictionaryCodec::from_phrases(vec![b"abcd".to_vec()]);
        assert_eq!(
            codec.decode(&[0x80, 0x07]),
            Err(WireError::UnknownDictionaryId(7))
        );
    }

    #[test]
    fn build_prefers_high_savings_phrases() {
        let sample = b"previous_hash previous_hash previous_hash xyz";
        let codec = DictionaryCodec::build(&[sample.as_slice()], 64);
        assert!(!codec.is_empty());
        let encoded = codec.encode(sample);
        assert!(encoded.len() < sample.len());
        assert_eq!(codec.decode(&encoded).unwrap(), sample.to_vec());
    }
}
