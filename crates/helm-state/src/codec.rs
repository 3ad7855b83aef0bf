//! Desired-state record encoding
//!
//! Record layout (little-endian):
//! - Bytes 0-3: Magic "HDSF"
//! - Bytes 4-5: Format version
//! - Bytes 6-9: CRC-32 (zeroed while hashing)
//! - Bytes 10-13: Body length
//! - Body: sequence u64, timestamp u64, valid u8, name (u8 len + bytes),
//!   actuators (u16 count + 17-byte entries), PID loops (u16 count +
//!   19-byte entries)

use bytes::{Buf, BufMut, BytesMut};
use helm_core::{crc32, StationName};

use crate::{
    desired::ShapeError, ActuatorCommand, DesiredActuatorState, DesiredPidState, DesiredState,
    PidMode, RecordError, Table, FORMAT_VERSION, MAX_ACTUATORS, MAX_PID_LOOPS,
};

/// Record magic
pub const MAGIC: [u8; 4] = *b"HDSF";

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 14;

const CHECKSUM_RANGE: std::ops::Range<usize> = 6..10;

const ACTUATOR_ENTRY_SIZE: usize = 2 + 1 + 1 + 1 + 8 + 4;
const PID_ENTRY_SIZE: usize = 2 + 1 + 4 + 4 + 8;

/// Entry bounds enforced while decoding
#[derive(Clone, Copy, Debug)]
pub struct DecodeLimits {
    pub actuator_capacity: usize,
    pub pid_capacity: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        DecodeLimits {
            actuator_capacity: MAX_ACTUATORS,
            pid_capacity: MAX_PID_LOOPS,
        }
    }
}

/// CRC-32 over the encoded document with the checksum field zeroed
pub fn compute_checksum(state: &DesiredState) -> u32 {
    crc32(&encode_with_checksum(state, 0))
}

/// Encode a document as stored (checksum field as-is)
pub fn encode(state: &DesiredState) -> BytesMut {
    encode_with_checksum(state, state.checksum)
}

fn encode_with_checksum(state: &DesiredState, checksum: u32) -> BytesMut {
    let name = state.station_name.as_bytes();
    let body_len = 8
        + 8
        + 1
        + 1
        + name.len()
        + 2
        + state.actuators.len() * ACTUATOR_ENTRY_SIZE
        + 2
        + state.pid_loops.len() * PID_ENTRY_SIZE;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_len);
    buf.put_slice(&MAGIC);
    buf.put_u16_le(state.version);
    buf.put_u32_le(checksum);
    buf.put_u32_le(body_len as u32);

    buf.put_u64_le(state.sequence);
    buf.put_u64_le(state.timestamp);
    buf.put_u8(state.valid as u8);
    // Station names are capped at 64 bytes
    buf.put_u8(name.len() as u8);
    buf.put_slice(name);

    buf.put_u16_le(state.actuators.len() as u16);
    for a in &state.actuators {
        buf.put_u16_le(a.slot);
        buf.put_u8(a.command.to_byte());
        buf.put_u8(a.pwm_duty);
        buf.put_u8(a.forced as u8);
        buf.put_u64_le(a.set_time);
        buf.put_u32_le(a.set_epoch);
    }

    buf.put_u16_le(state.pid_loops.len() as u16);
    for p in &state.pid_loops {
        buf.put_u16_le(p.loop_id);
        buf.put_u8(p.mode.to_byte());
        buf.put_f32_le(p.setpoint);
        buf.put_f32_le(p.manual_output);
        buf.put_u64_le(p.set_time);
    }

    debug_assert_eq!(buf.len(), HEADER_SIZE + body_len);
    buf
}

/// Decode and verify a stored record
///
/// The version is checked before the checksum so a record from another
/// format generation is reported as such rather than as corruption.
pub fn decode(data: &[u8], limits: &DecodeLimits) -> Result<DesiredState, RecordError> {
    let mut buf = data;
    need(buf, HEADER_SIZE)?;

    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(RecordError::BadMagic(magic));
    }

    let version = buf.get_u16_le();
    if version != FORMAT_VERSION {
        return Err(RecordError::VersionMismatch {
            found: version,
            expected: FORMAT_VERSION,
        });
    }

    let stored = buf.get_u32_le();
    let declared = buf.get_u32_le() as usize;
    if declared != buf.remaining() {
        return Err(RecordError::LengthMismatch {
            declared,
            actual: buf.remaining(),
        });
    }

    let mut zeroed = data.to_vec();
    zeroed[CHECKSUM_RANGE].fill(0);
    let computed = crc32(&zeroed);
    if computed != stored {
        return Err(RecordError::ChecksumMismatch { stored, computed });
    }

    need(buf, 8 + 8 + 1 + 1)?;
    let sequence = buf.get_u64_le();
    let timestamp = buf.get_u64_le();
    let valid = flag(&mut buf, "valid")?;
    let name_len = buf.get_u8() as usize;
    need(buf, name_len)?;
    let name = std::str::from_utf8(&buf[..name_len])
        .map_err(|_| RecordError::BadValue {
            field: "station_name",
            value: name_len as u8,
        })?
        .to_string();
    buf.advance(name_len);
    let station_name = StationName::new(name).map_err(RecordError::BadStationName)?;

    need(buf, 2)?;
    let count = buf.get_u16_le() as usize;
    check_count(Table::Actuators, count, limits.actuator_capacity)?;
    need(buf, count * ACTUATOR_ENTRY_SIZE)?;
    let mut actuators = Vec::with_capacity(count);
    for _ in 0..count {
        let slot = buf.get_u16_le();
        let command = buf.get_u8();
        let command = ActuatorCommand::from_byte(command).ok_or(RecordError::BadValue {
            field: "command",
            value: command,
        })?;
        let pwm_duty = buf.get_u8();
        let forced = flag(&mut buf, "forced")?;
        actuators.push(DesiredActuatorState {
            slot,
            command,
            pwm_duty,
            forced,
            set_time: buf.get_u64_le(),
            set_epoch: buf.get_u32_le(),
        });
    }

    need(buf, 2)?;
    let count = buf.get_u16_le() as usize;
    check_count(Table::PidLoops, count, limits.pid_capacity)?;
    need(buf, count * PID_ENTRY_SIZE)?;
    let mut pid_loops = Vec::with_capacity(count);
    for _ in 0..count {
        let loop_id = buf.get_u16_le();
        let mode = buf.get_u8();
        let mode = PidMode::from_byte(mode).ok_or(RecordError::BadValue {
            field: "mode",
            value: mode,
        })?;
        pid_loops.push(DesiredPidState {
            loop_id,
            mode,
            setpoint: buf.get_f32_le(),
            manual_output: buf.get_f32_le(),
            set_time: buf.get_u64_le(),
        });
    }

    if buf.has_remaining() {
        return Err(RecordError::TrailingBytes(buf.remaining()));
    }

    let state = DesiredState {
        version,
        sequence,
        checksum: stored,
        timestamp,
        station_name,
        valid,
        dirty: false,
        actuators,
        pid_loops,
    };

    state
        .check_shape(limits.actuator_capacity, limits.pid_capacity)
        .map_err(|err| match err {
            ShapeError::Capacity {
                table,
                count,
                capacity,
            } => RecordError::CapacityExceeded {
                table,
                count,
                capacity,
            },
            ShapeError::Duplicate(dup) => RecordError::Duplicate(dup),
        })?;

    Ok(state)
}

#[inline]
fn need(buf: &[u8], n: usize) -> Result<(), RecordError> {
    if buf.len() < n {
        return Err(RecordError::Truncated {
            needed: n,
            available: buf.len(),
        });
    }
    Ok(())
}

/// Booleans are stored as exactly 0 or 1
fn flag(buf: &mut &[u8], field: &'static str) -> Result<bool, RecordError> {
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        value => Err(RecordError::BadValue { field, value }),
    }
}

#[inline]
fn check_count(table: Table, count: usize, capacity: usize) -> Result<(), RecordError> {
    if count > capacity {
        return Err(RecordError::CapacityExceeded {
            table,
            count,
            capacity,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> DesiredState {
        let mut state = DesiredState::new(StationName::new("tank-1").unwrap());
        state.upsert_actuator(
            DesiredActuatorState {
                slot: 3,
                command: ActuatorCommand::Pwm,
                pwm_duty: 128,
                forced: true,
                set_time: 1_700_000_000_000,
                set_epoch: 5,
            },
            MAX_ACTUATORS,
        );
        state.update_pid_loop(1, MAX_PID_LOOPS, |p| {
            p.mode = PidMode::Cascade;
            p.setpoint = 72.25;
            p.manual_output = 33.0;
            p.set_time = 42;
        });
        state.touch(1_700_000_000_500);
        state
    }

    #[test]
    fn test_encode_layout() {
        let state = sample();
        let bytes = encode(&state);

        assert_eq!(&bytes[0..4], b"HDSF");
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), FORMAT_VERSION);
        assert_eq!(
            u32::from_le_bytes(bytes[6..10].try_into().unwrap()),
            state.checksum
        );
        let body_len = u32::from_le_bytes(bytes[10..14].try_into().unwrap()) as usize;
        assert_eq!(bytes.len(), HEADER_SIZE + body_len);
        assert_eq!(
            body_len,
            8 + 8 + 1 + 1 + "tank-1".len() + 2 + ACTUATOR_ENTRY_SIZE + 2 + PID_ENTRY_SIZE
        );
    }

    #[test]
    fn test_decode_reproduces_document() {
        let state = sample();
        let decoded = decode(&encode(&state), &DecodeLimits::default()).unwrap();

        let mut expected = state;
        expected.dirty = false;
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_checksum_ignores_dirty_flag() {
        let mut state = sample();
        let sealed = compute_checksum(&state);
        state.dirty = !state.dirty;
        assert_eq!(compute_checksum(&state), sealed);
    }

    #[test]
    fn test_checksum_covers_fields() {
        let base = sample();
        let sealed = compute_checksum(&base);

        let mut variants = Vec::new();
        let mut s = base.clone();
        s.sequence += 1;
        variants.push(s);
        let mut s = base.clone();
        s.timestamp += 1;
        variants.push(s);
        let mut s = base.clone();
        s.valid = false;
        variants.push(s);
        let mut s = base.clone();
        s.actuators[0].set_epoch = 6;
        variants.push(s);
        let mut s = base.clone();
        s.pid_loops[0].setpoint = 72.5;
        variants.push(s);
        let mut s = base.clone();
        s.station_name = StationName::new("tank-2").unwrap();
        variants.push(s);

        for variant in variants {
            assert_ne!(compute_checksum(&variant), sealed, "{variant:?}");
        }
    }

    #[test]
    fn test_decode_rejects_version() {
        let mut bytes = encode(&sample()).to_vec();
        bytes[4..6].copy_from_slice(&(FORMAT_VERSION + 1).to_le_bytes());
        assert_eq!(
            decode(&bytes, &DecodeLimits::default()),
            Err(RecordError::VersionMismatch {
                found: FORMAT_VERSION + 1,
                expected: FORMAT_VERSION
            })
        );
    }

    #[test]
    fn test_decode_rejects_magic() {
        let mut bytes = encode(&sample()).to_vec();
        bytes[0] = b'X';
        assert!(matches!(
            decode(&bytes, &DecodeLimits::default()),
            Err(RecordError::BadMagic(_))
        ));
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let bytes = encode(&sample());
        assert!(matches!(
            decode(&bytes[..10], &DecodeLimits::default()),
            Err(RecordError::Truncated { .. })
        ));
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1], &DecodeLimits::default()),
            Err(RecordError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_enforces_limits() {
        let bytes = encode(&sample());
        let limits = DecodeLimits {
            actuator_capacity: 0,
            pid_capacity: 64,
        };
        assert!(matches!(
            decode(&bytes, &limits),
            Err(RecordError::CapacityExceeded { count: 1, capacity: 0, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_bad_enum_with_valid_checksum() {
        let state = sample();
        let mut bytes = encode(&state).to_vec();
        // First actuator's command byte
        let offset = HEADER_SIZE + 8 + 8 + 1 + 1 + "tank-1".len() + 2 + 2;
        bytes[offset] = 9;
        bytes[CHECKSUM_RANGE].fill(0);
        let crc = crc32(&bytes);
        bytes[CHECKSUM_RANGE].copy_from_slice(&crc.to_le_bytes());

        assert_eq!(
            decode(&bytes, &DecodeLimits::default()),
            Err(RecordError::BadValue {
                field: "command",
                value: 9
            })
        );
    }

    #[test]
    fn test_decode_rejects_non_boolean_flag() {
        let mut bytes = encode(&sample()).to_vec();
        // First actuator's forced byte
        let offset = HEADER_SIZE + 8 + 8 + 1 + 1 + "tank-1".len() + 2 + 4;
        assert_eq!(bytes[offset], 1);
        bytes[offset] = 2;
        bytes[CHECKSUM_RANGE].fill(0);
        let crc = crc32(&bytes);
        bytes[CHECKSUM_RANGE].copy_from_slice(&crc.to_le_bytes());

        assert_eq!(
            decode(&bytes, &DecodeLimits::default()),
            Err(RecordError::BadValue {
                field: "forced",
                value: 2
            })
        );
    }

    proptest! {
        #[test]
        fn prop_any_corrupted_byte_is_rejected(idx in any::<usize>(), mask in 1u8..=255) {
            let bytes = encode(&sample());
            let mut corrupted = bytes.to_vec();
            let i = idx % corrupted.len();
            corrupted[i] ^= mask;
            prop_assert!(decode(&corrupted, &DecodeLimits::default()).is_err());
        }

        #[test]
        fn prop_checksum_deterministic(seq in any::<u64>(), ts in any::<u64>(), duty in any::<u8>()) {
            let mut state = sample();
            state.sequence = seq;
            state.timestamp = ts;
            state.actuators[0].pwm_duty = duty;
            prop_assert_eq!(compute_checksum(&state), compute_checksum(&state.clone()));
        }
    }
}
