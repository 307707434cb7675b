use bytecheck::CheckBytes;
use rkyv::de::deserializers::SharedDeserializeMap;
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};

use crate::{Identity, MemberState};

const SCRATCH_SPACE: usize = 1024;
const CHECKSUM_SIZE: usize = 4;

#[derive(Debug, thiserror::Error)]
/// The snapshot received could not be turned back into a membership view.
pub enum SnapshotError {
    #[error("Snapshot buffer is too small to contain a checksum ({0} bytes).")]
    Truncated(usize),

    #[error("Snapshot checksum does not match its contents.")]
    ChecksumMismatch,

    #[error("Snapshot contents are invalid: {0}")]
    Corrupted(String),

    #[error("Snapshot members are not strictly ordered by identity.")]
    Unordered,

    #[error("Failed to serialize snapshot: {0}")]
    Encode(String),
}

#[derive(Serialize, Deserialize, Archive, Debug, Copy, Clone, PartialEq, Eq)]
#[archive_attr(derive(CheckBytes))]
/// A single member as it is gossiped to other members.
///
/// The local update time is never sent, receivers always
/// assign their own time on receipt.
pub struct SnapshotEntry {
    pub identity: Identity,
    pub heartbeat: u64,
    pub state: MemberState,
}

#[derive(Serialize, Deserialize, Archive, Debug, Clone, Default, PartialEq, Eq)]
#[archive_attr(derive(CheckBytes))]
/// The only message exchanged by the gossip protocol.
///
/// A view of the membership list sorted by identity.
pub struct MembershipSnapshot {
    entries: Vec<SnapshotEntry>,
}

impl MembershipSnapshot {
    /// Creates a snapshot from a set of entries which are already sorted by identity.
    pub(crate) fn from_sorted(entries: Vec<SnapshotEntry>) -> Self {
        debug_assert!(is_strictly_sorted(&entries));
        Self { entries }
    }

    /// Creates a snapshot from an arbitrary set of entries.
    ///
    /// Entries are sorted by identity and, if an identity appears more
    /// than once, the entry with the highest heartbeat is kept.
    pub fn from_entries(mut entries: Vec<SnapshotEntry>) -> Self {
        entries.sort_by(|a, b| {
            a.identity
                .cmp(&b.identity)
                .then_with(|| b.heartbeat.cmp(&a.heartbeat))
        });
        entries.dedup_by(|later, first| later.identity == first.identity);
        Self { entries }
    }

    #[inline]
    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializes the snapshot with a CRC32 checksum attached to the last 4
    /// bytes of the buffer.
    pub fn encode(&self) -> Result<AlignedVec, SnapshotError> {
        let mut buffer = rkyv::to_bytes::<_, SCRATCH_SPACE>(self)
            .map_err(|e| SnapshotError::Encode(format!("{e:?}")))?;

        let checksum = crc32fast::hash(&buffer);
        buffer.extend_from_slice(&checksum.to_le_bytes());

        Ok(buffer)
    }

    /// Validates and deserializes a snapshot produced by [MembershipSnapshot::encode].
    pub fn decode(data: &[u8]) -> Result<Self, SnapshotError> {
        if data.len() < CHECKSUM_SIZE {
            return Err(SnapshotError::Truncated(data.len()));
        }

        let end = data.len() - CHECKSUM_SIZE;
        let checksum_bytes = data[end..]
            .try_into()
            .map_err(|_| SnapshotError::Truncated(data.len()))?;
        let expected_checksum = u32::from_le_bytes(checksum_bytes);
        if crc32fast::hash(&data[..end]) != expected_checksum {
            return Err(SnapshotError::ChecksumMismatch);
        }

        // Datagrams land in unaligned buffers.
        let mut aligned = AlignedVec::with_capacity(end);
        aligned.extend_from_slice(&data[..end]);

        let archived = rkyv::check_archived_root::<Self>(&aligned)
            .map_err(|e| SnapshotError::Corrupted(format!("{e:?}")))?;
        let snapshot: Self = archived
            .deserialize(&mut SharedDeserializeMap::default())
            .map_err(|e| SnapshotError::Corrupted(format!("{e:?}")))?;

        if !is_strictly_sorted(&snapshot.entries) {
            return Err(SnapshotError::Unordered);
        }

        Ok(snapshot)
    }
}

fn is_strictly_sorted(entries: &[SnapshotEntry]) -> bool {
    entries
        .windows(2)
        .all(|pair| pair[0].identity < pair[1].identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(port: u16, heartbeat: u64, state: MemberState) -> SnapshotEntry {
        SnapshotEntry {
            identity: Identity::new(([127, 0, 0, 1], port).into(), 1),
            heartbeat,
            state,
        }
    }

    #[test]
    fn test_encode_decode() {
        let snapshot = MembershipSnapshot::from_entries(vec![
            entry(8002, 4, MemberState::Leave),
            entry(8001, 9, MemberState::Alive),
        ]);

        let buffer = snapshot.encode().expect("Encode snapshot");
        let decoded = MembershipSnapshot::decode(&buffer).expect("Decode snapshot");

        assert_eq!(decoded, snapshot);
        assert_eq!(decoded.entries()[0].identity.addr().port(), 8001);
        assert_eq!(decoded.entries()[1].state, MemberState::Leave);
    }

    #[test]
    fn test_decode_unaligned_buffer() {
        let snapshot = MembershipSnapshot::from_entries(vec![entry(8001, 1, MemberState::Alive)]);
        let buffer = snapshot.encode().expect("Encode snapshot");

        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&buffer);

        let decoded = MembershipSnapshot::decode(&shifted[1..]).expect("Decode snapshot");
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let snapshot = MembershipSnapshot::from_entries(vec![entry(8001, 1, MemberState::Alive)]);
        let mut buffer = snapshot.encode().expect("Encode snapshot").into_vec();
        buffer[0] ^= 0xFF;

        let err = MembershipSnapshot::decode(&buffer).expect_err("Checksum should fail");
        assert!(matches!(err, SnapshotError::ChecksumMismatch));

        let err = MembershipSnapshot::decode(&[1, 2]).expect_err("Too small");
        assert!(matches!(err, SnapshotError::Truncated(2)));
    }

    #[test]
    fn test_decode_rejects_garbage_with_valid_checksum() {
        let mut garbage = vec![0xAB; 3];
        let checksum = crc32fast::hash(&garbage);
        garbage.extend_from_slice(&checksum.to_le_bytes());

        let err = MembershipSnapshot::decode(&garbage).expect_err("Garbage should fail");
        assert!(matches!(err, SnapshotError::Corrupted(_)));
    }

    #[test]
    fn test_decode_rejects_unordered_entries() {
        let snapshot = MembershipSnapshot {
            entries: vec![
                entry(8002, 1, MemberState::Alive),
                entry(8001, 1, MemberState::Alive),
            ],
        };
        let buffer = snapshot.encode().expect("Encode snapshot");

        let err = MembershipSnapshot::decode(&buffer).expect_err("Order should fail");
        assert!(matches!(err, SnapshotError::Unordered));
    }

    #[test]
    fn test_from_entries_keeps_highest_heartbeat() {
        let snapshot = MembershipSnapshot::from_entries(vec![
            entry(8001, 3, MemberState::Alive),
            entry(8001, 7, MemberState::Leave),
            entry(8001, 5, MemberState::Alive),
        ]);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.entries()[0].heartbeat, 7);
        assert_eq!(snapshot.entries()[0].state, MemberState::Leave);
    }
}
