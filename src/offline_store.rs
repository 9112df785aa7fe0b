use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::outbox::Outbox;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;
const STORE_MAGIC: &[u8; 4] = b"JNLS";
const MAX_STORE_BYTES: usize = 32 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Envelope around the serialized payload. The checksum is over the payload
/// bytes, so any device-storage corruption is detected before deserializing.
#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug)]
struct StorePayload {
    outbox: Outbox,
    last_sync_ms: Option<u64>,
}

/// Everything the app keeps on-device across restarts: the outbox of
/// unconfirmed writes plus sync bookkeeping. The encoded form travels as
/// opaque bytes through the key-value capability; it is local-only and may be
/// re-versioned freely between releases.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineStore {
    schema_version: u32,
    pub outbox: Outbox,
    pub last_sync_ms: Option<u64>,
}

impl Default for OfflineStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            outbox: Outbox::new(),
            last_sync_ms: None,
        }
    }

    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let payload = StorePayload {
            outbox: self.outbox.clone(),
            last_sync_ms: self.last_sync_ms,
        };

        let mut payload_bytes = Vec::new();
        ciborium::into_writer(&payload, &mut payload_bytes)?;

        let checksum = blake3::hash(&payload_bytes);

        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: self.schema_version,
            checksum: *checksum.as_bytes(),
            payload: payload_bytes,
        };

        let mut envelope_bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut envelope_bytes)?;
        Ok(envelope_bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.is_empty() {
            return Err(StoreError::Corrupted {
                reason: "empty snapshot",
            });
        }
        if bytes.len() > MAX_STORE_BYTES {
            return Err(StoreError::StoreTooLarge {
                size: bytes.len(),
                max: MAX_STORE_BYTES,
            });
        }

        let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

        if envelope.magic != *STORE_MAGIC {
            return Err(StoreError::Corrupted {
                reason: "invalid magic bytes",
            });
        }

        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::FutureSchema {
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }

        let actual_checksum = blake3::hash(&envelope.payload);
        if actual_checksum.as_bytes() != &envelope.checksum {
            return Err(StoreError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: hex::encode(actual_checksum.as_bytes()),
            });
        }

        let payload: StorePayload = ciborium::from_reader(&envelope.payload[..])?;

        let mut store = if envelope.schema_version < CURRENT_SCHEMA_VERSION {
            Self::migrate(envelope.schema_version, payload)?
        } else {
            Self {
                schema_version: envelope.schema_version,
                outbox: payload.outbox,
                last_sync_ms: payload.last_sync_ms,
            }
        };

        // An attempt that was in flight when the process died never reported
        // an outcome; it must be retried.
        store.outbox.reset_in_flight();

        Ok(store)
    }

    /// Restore from persisted bytes, falling back to an empty store on any
    /// failure. Startup never blocks on a bad snapshot; losing the queue is
    /// preferable to losing the app.
    #[must_use]
    pub fn restore(bytes: Option<&[u8]>) -> Self {
        match bytes {
            None => Self::new(),
            Some(bytes) => match Self::decode(bytes) {
                Ok(store) => store,
                Err(e) => {
                    warn!(error = %e, "discarding unreadable offline store snapshot");
                    Self::new()
                }
            },
        }
    }

    fn migrate(from_version: u32, _payload: StorePayload) -> Result<Self, StoreError> {
        // Version 0 snapshots never shipped.
        Err(StoreError::UnknownSchema(from_version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{EntryDraft, OutboxEntry, PendingWrite, WriteError};
    use crate::{OpId, UnixTimeMs, UserId};

    fn make_now() -> UnixTimeMs {
        UnixTimeMs(1_700_000_000_000)
    }

    fn sample_entry(content: &str) -> OutboxEntry {
        let draft = EntryDraft {
            content: content.into(),
            ..EntryDraft::default()
        };
        let write =
            PendingWrite::from_draft(draft, &UserId::new("user-1"), make_now()).unwrap();
        OutboxEntry::new(write, make_now())
    }

    #[test]
    fn new_store_has_current_schema() {
        let store = OfflineStore::new();
        assert_eq!(store.schema_version(), CURRENT_SCHEMA_VERSION);
        assert!(store.outbox.is_empty());
    }

    #[test]
    fn roundtrip_empty_store() {
        let store = OfflineStore::new();
        let bytes = store.encode().unwrap();
        let loaded = OfflineStore::decode(&bytes).unwrap();
        assert_eq!(loaded, store);
    }

    #[test]
    fn roundtrip_preserves_entries_and_order() {
        let mut store = OfflineStore::new();
        let mut expected: Vec<OpId> = Vec::new();
        for i in 0..5 {
            let entry = sample_entry(&format!("entry {i}"));
            expected.push(entry.op_id.clone());
            store.outbox.enqueue(entry);
        }
        store.last_sync_ms = Some(123);

        let bytes = store.encode().unwrap();
        let loaded = OfflineStore::decode(&bytes).unwrap();

        let order: Vec<OpId> = loaded.outbox.iter().map(|e| e.op_id.clone()).collect();
        assert_eq!(order, expected);
        assert_eq!(loaded.last_sync_ms, Some(123));
        for (a, b) in loaded.outbox.iter().zip(store.outbox.iter()) {
            assert_eq!(a.write, b.write);
        }
    }

    #[test]
    fn decode_resets_in_flight_entries() {
        let mut store = OfflineStore::new();
        let mut entry = sample_entry("mid-flush crash");
        entry.mark_in_flight(make_now());
        store.outbox.enqueue(entry);

        let bytes = store.encode().unwrap();
        let loaded = OfflineStore::decode(&bytes).unwrap();

        assert_eq!(loaded.outbox.ready_ids(make_now()).len(), 1);
    }

    #[test]
    fn failed_entries_survive_roundtrip() {
        let mut store = OfflineStore::new();
        let mut entry = sample_entry("rejected");
        entry.mark_in_flight(make_now());
        entry.mark_failed(WriteError::http_status(422, None), make_now());
        store.outbox.enqueue(entry);

        let bytes = store.encode().unwrap();
        let loaded = OfflineStore::decode(&bytes).unwrap();

        assert_eq!(loaded.outbox.failed_count(), 1);
        assert!(loaded.outbox.ready_ids(make_now()).is_empty());
    }

    #[test]
    fn empty_bytes_are_corrupt() {
        assert!(matches!(
            OfflineStore::decode(b""),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn corrupted_payload_fails_integrity_check() {
        let mut store = OfflineStore::new();
        store.outbox.enqueue(sample_entry("x"));
        let mut bytes = store.encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        assert!(OfflineStore::decode(&bytes).is_err());
    }

    #[test]
    fn wrong_magic_rejected() {
        let garbage = {
            let envelope = StoreEnvelope {
                magic: *b"NOPE",
                schema_version: CURRENT_SCHEMA_VERSION,
                checksum: [0u8; 32],
                payload: Vec::new(),
            };
            let mut bytes = Vec::new();
            ciborium::into_writer(&envelope, &mut bytes).unwrap();
            bytes
        };

        assert!(matches!(
            OfflineStore::decode(&garbage),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn future_schema_rejected() {
        let mut store = OfflineStore::new();
        store.schema_version = CURRENT_SCHEMA_VERSION + 1;
        let bytes = store.encode().unwrap();

        assert!(matches!(
            OfflineStore::decode(&bytes),
            Err(StoreError::FutureSchema { .. })
        ));
    }

    #[test]
    fn oversized_snapshot_rejected() {
        let oversized = vec![0u8; MAX_STORE_BYTES + 1];
        assert!(matches!(
            OfflineStore::decode(&oversized),
            Err(StoreError::StoreTooLarge { .. })
        ));
    }

    #[test]
    fn restore_falls_back_to_empty() {
        assert_eq!(OfflineStore::restore(None), OfflineStore::new());
        assert_eq!(
            OfflineStore::restore(Some(b"definitely not a snapshot")),
            OfflineStore::new()
        );
    }

    #[test]
    fn restore_roundtrips_good_bytes() {
        let mut store = OfflineStore::new();
        store.outbox.enqueue(sample_entry("kept"));
        let bytes = store.encode().unwrap();

        let restored = OfflineStore::restore(Some(&bytes));
        assert_eq!(restored.outbox.len(), 1);
    }
}
