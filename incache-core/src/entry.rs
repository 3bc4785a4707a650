//! Cached fragment entries and their persistent framing.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{IncludeResult, StorageError};
use crate::validity::{aggregate, Validity, ValidityToken};

/// Immutable pairing of validity tokens and a compiled fragment payload.
///
/// The payload is shared, so cloning an entry never copies the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    validities: Vec<ValidityToken>,
    payload: Arc<[u8]>,
}

impl CachedEntry {
    /// Create an entry guarded by a single token.
    pub fn new(validity: ValidityToken, payload: impl Into<Arc<[u8]>>) -> Self {
        Self::with_validities(vec![validity], payload)
    }

    /// Create an entry that expires `expires` from now.
    pub fn expiring(expires: Duration, payload: impl Into<Arc<[u8]>>) -> Self {
        Self::new(ValidityToken::expires(expires), payload)
    }

    pub fn with_validities(validities: Vec<ValidityToken>, payload: impl Into<Arc<[u8]>>) -> Self {
        Self {
            validities,
            payload: payload.into(),
        }
    }

    pub fn validities(&self) -> &[ValidityToken] {
        &self.validities
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Shared handle to the payload.
    pub fn shared_payload(&self) -> Arc<[u8]> {
        Arc::clone(&self.payload)
    }

    /// Combined verdict of all tokens.
    pub fn validity(&self) -> Validity {
        aggregate(self.validities.iter().map(ValidityToken::check))
    }

    /// Encode for durable storage.
    ///
    /// Format: [header length: u32 LE][JSON token array][payload]
    pub fn encode(&self) -> IncludeResult<Vec<u8>> {
        let header = serde_json::to_vec(&self.validities).map_err(|e| {
            StorageError::SerializationFailed {
                reason: e.to_string(),
            }
        })?;
        let header_len = u32::try_from(header.len()).map_err(|_| StorageError::SerializationFailed {
            reason: "validity header too large".to_string(),
        })?;

        let mut bytes = Vec::with_capacity(4 + header.len() + self.payload.len());
        bytes.extend_from_slice(&header_len.to_le_bytes());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Decode bytes produced by [`CachedEntry::encode`].
    pub fn decode(bytes: &[u8]) -> IncludeResult<Self> {
        if bytes.len() < 4 {
            return Err(corrupt("entry shorter than its header length"));
        }
        let len_bytes: [u8; 4] = bytes[0..4]
            .try_into()
            .map_err(|_| corrupt("invalid header length"))?;
        let header_len = u32::from_le_bytes(len_bytes) as usize;

        let header_end = 4usize
            .checked_add(header_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| corrupt("header extends past end of entry"))?;

        let validities: Vec<ValidityToken> = serde_json::from_slice(&bytes[4..header_end])
            .map_err(|e| corrupt(&e.to_string()))?;

        Ok(Self::with_validities(validities, &bytes[header_end..]))
    }
}

fn corrupt(reason: &str) -> crate::error::IncludeError {
    StorageError::Corrupt {
        reason: reason.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_encode_decode_preserves_tokens_and_payload() {
        let entry = CachedEntry::expiring(Duration::from_secs(60), b"CXML\x01payload".to_vec());
        let bytes = entry.encode().expect("encode should succeed");
        let decoded = CachedEntry::decode(&bytes).expect("decode should succeed");

        assert_eq!(decoded, entry);
        assert_eq!(decoded.validities().len(), 1);
        assert_eq!(decoded.payload(), b"CXML\x01payload");
    }

    #[test]
    fn test_empty_payload() {
        let entry = CachedEntry::new(ValidityToken::Always, Vec::new());
        let decoded = CachedEntry::decode(&entry.encode().expect("encode should succeed"))
            .expect("decode should succeed");
        assert!(decoded.payload().is_empty());
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        assert!(matches!(
            CachedEntry::decode(&[1, 0]),
            Err(crate::IncludeError::Storage(StorageError::Corrupt { .. }))
        ));

        let mut bytes = CachedEntry::new(ValidityToken::Always, b"x".to_vec())
            .encode()
            .expect("encode should succeed");
        bytes[0] = 0xFF;
        assert!(CachedEntry::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage_header() {
        let mut bytes = 3u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{{{");
        assert!(CachedEntry::decode(&bytes).is_err());
    }

    #[test]
    fn test_validity_follows_tokens() {
        let fresh = CachedEntry::expiring(Duration::from_secs(60), b"a".to_vec());
        assert_eq!(fresh.validity(), Validity::Valid);

        let stale = CachedEntry::new(
            ValidityToken::expires_at(
                Utc::now() - chrono::Duration::seconds(120),
                Duration::from_secs(60),
            ),
            b"a".to_vec(),
        );
        assert_eq!(stale.validity(), Validity::Invalid);

        let untracked = CachedEntry::with_validities(Vec::new(), b"a".to_vec());
        assert_eq!(untracked.validity(), Validity::Unknown);
    }

    #[test]
    fn test_clone_shares_payload() {
        let entry = CachedEntry::expiring(Duration::from_secs(1), vec![7u8; 1024]);
        let copy = entry.clone();
        assert!(Arc::ptr_eq(&entry.shared_payload(), &copy.shared_payload()));
    }
}
