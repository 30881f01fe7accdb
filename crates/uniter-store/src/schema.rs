//! Database schema definitions, key encoding and record framing.
//!
//! State records are framed as `blake3(payload) || payload`, where the
//! payload is the CBOR encoding of an [`OperationState`]. The checksum lets a
//! reader tell a damaged record apart from a valid one.

use uniter_core::UnitName;

use crate::error::{Result, StoreError};
use crate::types::OperationState;

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Operation state records, keyed by unit name.
    pub const OPERATION_STATE: &str = "operation_state";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![cf::OPERATION_STATE]
}

const CHECKSUM_LEN: usize = blake3::OUT_LEN;

/// Encode the key for a unit's state record.
#[must_use]
pub fn state_key(unit: &UnitName) -> Vec<u8> {
    unit.to_string().into_bytes()
}

/// Serialize and frame a state record.
///
/// # Errors
///
/// Returns `StoreError::Serialization` if CBOR encoding fails.
pub fn encode_record(state: &OperationState) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(state, &mut payload)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    let mut record = Vec::with_capacity(CHECKSUM_LEN + payload.len());
    record.extend_from_slice(blake3::hash(&payload).as_bytes());
    record.extend_from_slice(&payload);
    Ok(record)
}

/// Verify and deserialize a framed state record.
///
/// # Errors
///
/// Returns `StoreError::Corrupt` if the record is truncated or its checksum
/// does not match, and `StoreError::Serialization` if the payload does not
/// decode.
pub fn decode_record(record: &[u8]) -> Result<OperationState> {
    if record.len() < CHECKSUM_LEN {
        return Err(StoreError::Corrupt {
            expected: "<truncated>".to_string(),
            found: hex::encode(blake3::hash(record).as_bytes()),
        });
    }
    let (stored, payload) = record.split_at(CHECKSUM_LEN);
    let actual = blake3::hash(payload);
    if actual.as_bytes() != stored {
        return Err(StoreError::Corrupt {
            expected: hex::encode(stored),
            found: actual.to_hex().to_string(),
        });
    }
    ciborium::from_reader(payload).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OperationKind, OperationStep};
    use uniter_core::{HookInfo, HookKind};

    fn queued_config_changed() -> OperationState {
        OperationState {
            kind: OperationKind::RunHook,
            step: OperationStep::Queued,
            hook: Some(HookInfo::new(HookKind::ConfigChanged)),
            ..OperationState::default()
        }
    }

    #[test]
    fn record_decodes_what_was_encoded() {
        let state = queued_config_changed();
        let record = encode_record(&state).unwrap();
        assert_eq!(decode_record(&record).unwrap(), state);
    }

    #[test]
    fn flipped_byte_is_detected() {
        let mut record = encode_record(&queued_config_changed()).unwrap();
        let last = record.len() - 1;
        record[last] ^= 0xff;
        assert!(matches!(
            decode_record(&record),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn truncated_record_is_detected() {
        assert!(matches!(
            decode_record(&[1, 2, 3]),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn key_is_unit_name() {
        let unit: UnitName = "wordpress/0".parse().unwrap();
        assert_eq!(state_key(&unit), b"wordpress/0".to_vec());
    }
}
