//! On-disk layout of the coordination store.
//!
//! All integers are little-endian.
//!
//! ```text
//! 0    header (64 bytes)
//!        0  magic          u32  'HOFF'
//!        4  version        u32
//!        8  capacity       u32  event slots
//!       12  max_payload    u32  bytes per slot payload
//!       16  event_count    u32
//!       20  body_crc       u32  crc32 of event_count, last_event_id and the body
//!       24  notify_seq     u32  wake word, never covered by the crc
//!       32  last_event_id  u64
//! 64   lease block (64 bytes)
//!        0  present        u32
//!        4  owner_pid      u32
//!        8  owner_id       u64
//!       16  owner_start    u64
//!       24  acquired_at_ms u64
//!       32  heartbeat_ms   u64
//!       40  lease_ms       u64
//! 128  event slots, arrival order, `slot_size(max_payload)` bytes each
//!        0  id             u64
//!        8  posted_at_ms   u64
//!       16  completed_ms   u64
//!       24  state          u8
//!       28  payload_len    u32
//!       32  payload
//! ```

use std::collections::VecDeque;

use crate::core::process::InstanceId;
use crate::core::{Error, Result};
use crate::store::{Event, EventState, LeaseRecord, StoreState};

pub const STORE_MAGIC: u32 = 0x484F_4646; // 'HOFF'
pub const STORE_VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 64;
pub const LEASE_OFFSET: usize = 64;
pub const LEASE_SIZE: usize = 64;
pub const SLOTS_OFFSET: usize = LEASE_OFFSET + LEASE_SIZE;
pub const SLOT_HEADER_SIZE: usize = 32;

pub const MAGIC_OFFSET: usize = 0;
pub const VERSION_OFFSET: usize = 4;
pub const CAPACITY_OFFSET: usize = 8;
pub const MAX_PAYLOAD_OFFSET: usize = 12;
pub const EVENT_COUNT_OFFSET: usize = 16;
pub const BODY_CRC_OFFSET: usize = 20;
pub const NOTIFY_SEQ_OFFSET: usize = 24;
pub const LAST_EVENT_ID_OFFSET: usize = 32;

/// Most event slots a store may have.
pub const MAX_CAPACITY: usize = 4096;
/// Largest payload a slot may hold.
pub const MAX_PAYLOAD_LIMIT: usize = 64 * 1024;

const STATE_PENDING: u8 = 1;
const STATE_PROCESSED: u8 = 2;
const STATE_EXPIRED: u8 = 3;

/// Sizes fixed when the store file is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub capacity: usize,
    pub max_payload: usize,
}

impl Geometry {
    pub fn slot_size(&self) -> usize {
        (SLOT_HEADER_SIZE + self.max_payload + 7) & !7
    }

    /// Total bytes a store with this geometry occupies.
    pub fn file_len(&self) -> Result<usize> {
        SLOT_HEADER_SIZE
            .checked_add(self.max_payload)
            .and_then(|slot| slot.checked_add(7))
            .map(|slot| slot & !7)
            .and_then(|slot| slot.checked_mul(self.capacity))
            .and_then(|slots| slots.checked_add(SLOTS_OFFSET))
            .ok_or(Error::Corrupt("store geometry overflows"))
    }

    /// Checks the sizes against the limits every store is created within.
    pub fn check(&self) -> Result<()> {
        if self.capacity == 0 || self.capacity > MAX_CAPACITY {
            return Err(Error::Corrupt("store capacity out of range"));
        }
        if self.max_payload > MAX_PAYLOAD_LIMIT {
            return Err(Error::Corrupt("store max payload out of range"));
        }
        Ok(())
    }

    /// Reads and validates the header of an initialized store.
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < SLOTS_OFFSET {
            return Err(Error::Corrupt("store too small for header"));
        }
        if read_u32(buf, MAGIC_OFFSET) != STORE_MAGIC {
            return Err(Error::Corrupt("store magic mismatch"));
        }
        let version = read_u32(buf, VERSION_OFFSET);
        if version != STORE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let geometry = Self {
            capacity: read_u32(buf, CAPACITY_OFFSET) as usize,
            max_payload: read_u32(buf, MAX_PAYLOAD_OFFSET) as usize,
        };
        geometry.check()?;
        Ok(geometry)
    }

    /// Writes a fresh header with an empty lease and no events.
    pub fn init(&self, buf: &mut [u8]) -> Result<()> {
        self.check()?;
        if buf.len() < self.file_len()? {
            return Err(Error::Corrupt("store smaller than its geometry"));
        }
        buf[..SLOTS_OFFSET].fill(0);
        write_u32(buf, VERSION_OFFSET, STORE_VERSION);
        write_u32(buf, CAPACITY_OFFSET, self.capacity as u32);
        write_u32(buf, MAX_PAYLOAD_OFFSET, self.max_payload as u32);
        write_u32(buf, BODY_CRC_OFFSET, body_crc(buf, self)?);
        write_u32(buf, MAGIC_OFFSET, STORE_MAGIC);
        Ok(())
    }
}

/// Decodes the full store state. The caller holds the store lock.
pub fn decode(buf: &[u8]) -> Result<StoreState> {
    let geometry = Geometry::read(buf)?;
    if buf.len() < geometry.file_len()? {
        return Err(Error::Corrupt("store truncated"));
    }
    if read_u32(buf, BODY_CRC_OFFSET) != body_crc(buf, &geometry)? {
        return Err(Error::Corrupt("store checksum mismatch"));
    }

    let lease_buf = &buf[LEASE_OFFSET..LEASE_OFFSET + LEASE_SIZE];
    let lease = (read_u32(lease_buf, 0) != 0).then(|| LeaseRecord {
        owner_pid: read_u32(lease_buf, 4),
        owner: InstanceId::from_raw(read_u64(lease_buf, 8)),
        owner_start_time: read_u64(lease_buf, 16),
        acquired_at_ms: read_u64(lease_buf, 24),
        heartbeat_at_ms: read_u64(lease_buf, 32),
        lease_duration_ms: read_u64(lease_buf, 40),
    });

    let count = read_u32(buf, EVENT_COUNT_OFFSET) as usize;
    let slot_size = geometry.slot_size();
    let mut events = VecDeque::with_capacity(count);
    for index in 0..count {
        let start = SLOTS_OFFSET + index * slot_size;
        let slot = &buf[start..start + slot_size];
        let state = match slot[24] {
            STATE_PENDING => EventState::Pending,
            STATE_PROCESSED => EventState::Processed,
            STATE_EXPIRED => EventState::Expired,
            _ => return Err(Error::Corrupt("event slot state invalid")),
        };
        let len = read_u32(slot, 28) as usize;
        if len > geometry.max_payload {
            return Err(Error::Corrupt("event payload length out of range"));
        }
        events.push_back(Event {
            id: read_u64(slot, 0),
            posted_at_ms: read_u64(slot, 8),
            completed_at_ms: read_u64(slot, 16),
            state,
            payload: slot[SLOT_HEADER_SIZE..SLOT_HEADER_SIZE + len].to_vec(),
        });
    }

    Ok(StoreState::from_parts(
        lease,
        events,
        read_u64(buf, LAST_EVENT_ID_OFFSET),
        geometry.capacity,
        geometry.max_payload,
    ))
}

/// Encodes `state` back into `buf`, leaving the wake word untouched.
pub fn encode(state: &StoreState, buf: &mut [u8]) -> Result<()> {
    let geometry = Geometry::read(buf)?;
    let count = state.events().count();
    if count > geometry.capacity {
        return Err(Error::Corrupt("more events than slots"));
    }

    let lease_buf = &mut buf[LEASE_OFFSET..LEASE_OFFSET + LEASE_SIZE];
    lease_buf.fill(0);
    if let Some(lease) = &state.lease {
        write_u32(lease_buf, 0, 1);
        write_u32(lease_buf, 4, lease.owner_pid);
        write_u64(lease_buf, 8, lease.owner.as_u64());
        write_u64(lease_buf, 16, lease.owner_start_time);
        write_u64(lease_buf, 24, lease.acquired_at_ms);
        write_u64(lease_buf, 32, lease.heartbeat_at_ms);
        write_u64(lease_buf, 40, lease.lease_duration_ms);
    }

    let slot_size = geometry.slot_size();
    for (index, event) in state.events().enumerate() {
        if event.payload.len() > geometry.max_payload {
            return Err(Error::PayloadTooLarge {
                len: event.payload.len(),
                max: geometry.max_payload,
            });
        }
        let start = SLOTS_OFFSET + index * slot_size;
        let slot = &mut buf[start..start + slot_size];
        slot.fill(0);
        write_u64(slot, 0, event.id);
        write_u64(slot, 8, event.posted_at_ms);
        write_u64(slot, 16, event.completed_at_ms);
        slot[24] = match event.state {
            EventState::Pending => STATE_PENDING,
            EventState::Processed => STATE_PROCESSED,
            EventState::Expired => STATE_EXPIRED,
        };
        write_u32(slot, 28, event.payload.len() as u32);
        slot[SLOT_HEADER_SIZE..SLOT_HEADER_SIZE + event.payload.len()]
            .copy_from_slice(&event.payload);
    }

    write_u32(buf, EVENT_COUNT_OFFSET, count as u32);
    write_u64(buf, LAST_EVENT_ID_OFFSET, state.last_event_id());
    write_u32(buf, BODY_CRC_OFFSET, body_crc(buf, &geometry)?);
    Ok(())
}

fn body_crc(buf: &[u8], geometry: &Geometry) -> Result<u32> {
    let count = read_u32(buf, EVENT_COUNT_OFFSET) as usize;
    if count > geometry.capacity {
        return Err(Error::Corrupt("event count exceeds capacity"));
    }
    let end = SLOTS_OFFSET + count * geometry.slot_size();
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[EVENT_COUNT_OFFSET..EVENT_COUNT_OFFSET + 4]);
    hasher.update(&buf[LAST_EVENT_ID_OFFSET..LAST_EVENT_ID_OFFSET + 8]);
    hasher.update(&buf[LEASE_OFFSET..end]);
    Ok(hasher.finalize())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    const GEOMETRY: Geometry = Geometry {
        capacity: 4,
        max_payload: 20,
    };

    fn fresh() -> Result<Vec<u8>> {
        let mut buf = vec![0u8; GEOMETRY.file_len()?];
        GEOMETRY.init(&mut buf)?;
        Ok(buf)
    }

    #[test]
    fn slot_size_is_eight_byte_aligned() -> Result<()> {
        assert_eq!(GEOMETRY.slot_size(), 56);
        assert_eq!(GEOMETRY.file_len()?, SLOTS_OFFSET + 4 * 56);
        Ok(())
    }

    #[test]
    fn oversized_geometry_is_an_error() {
        let huge = Geometry {
            capacity: usize::MAX,
            max_payload: usize::MAX,
        };
        assert!(matches!(huge.file_len(), Err(Error::Corrupt(_))));
        assert!(huge.check().is_err());
    }

    #[test]
    fn header_sizes_are_bounded() -> Result<()> {
        let mut buf = fresh()?;
        write_u32(&mut buf, CAPACITY_OFFSET, u32::MAX);
        write_u32(&mut buf, MAX_PAYLOAD_OFFSET, u32::MAX);
        assert!(matches!(
            Geometry::read(&buf),
            Err(Error::Corrupt("store capacity out of range"))
        ));

        write_u32(&mut buf, CAPACITY_OFFSET, 4);
        assert!(matches!(
            Geometry::read(&buf),
            Err(Error::Corrupt("store max payload out of range"))
        ));

        write_u32(&mut buf, CAPACITY_OFFSET, 0);
        assert!(Geometry::read(&buf).is_err());
        Ok(())
    }

    #[test]
    fn fresh_store_decodes_empty() -> Result<()> {
        let state = decode(&fresh()?)?;
        assert!(state.lease.is_none());
        assert_eq!(state.events().count(), 0);
        assert_eq!(state.capacity(), 4);
        assert_eq!(state.max_payload(), 20);
        Ok(())
    }

    #[test]
    fn lease_and_events_survive_encode() -> Result<()> {
        let mut buf = fresh()?;
        let mut state = decode(&buf)?;
        state.lease = Some(LeaseRecord {
            owner: InstanceId::from_raw(0xABCD),
            owner_pid: 42,
            owner_start_time: 9,
            acquired_at_ms: 100,
            heartbeat_at_ms: 150,
            lease_duration_ms: 5_000,
        });
        let first = state.append_event(b"tox:abc", 200)?;
        state.append_event(b"tox:def", 200)?;
        state.mark_processed(first, 210);
        encode(&state, &mut buf)?;

        assert_eq!(decode(&buf)?, state);
        Ok(())
    }

    #[test]
    fn wake_word_is_outside_checksum() -> Result<()> {
        let mut buf = fresh()?;
        write_u32(&mut buf, NOTIFY_SEQ_OFFSET, 77);
        decode(&buf)?;
        Ok(())
    }

    #[test]
    fn detects_flipped_payload_byte() -> Result<()> {
        let mut buf = fresh()?;
        let mut state = decode(&buf)?;
        state.append_event(b"tox:abc", 1)?;
        encode(&state, &mut buf)?;
        buf[SLOTS_OFFSET + SLOT_HEADER_SIZE] ^= 0xFF;
        assert!(matches!(decode(&buf), Err(Error::Corrupt("store checksum mismatch"))));
        Ok(())
    }

    #[test]
    fn rejects_foreign_file() -> Result<()> {
        let buf = vec![0x5Au8; GEOMETRY.file_len()?];
        assert!(matches!(decode(&buf), Err(Error::Corrupt("store magic mismatch"))));
        Ok(())
    }

    #[test]
    fn rejects_other_version() -> Result<()> {
        let mut buf = fresh()?;
        write_u32(&mut buf, VERSION_OFFSET, 7);
        assert!(matches!(decode(&buf), Err(Error::UnsupportedVersion(7))));
        Ok(())
    }
}
