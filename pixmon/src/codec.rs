//! Versioned binary frame codec.
//!
//! # Wire Format
//!
//! ```text
//! [0]        version major
//! [1]        version minor
//! [2]        delimiter ('/' = 0x2F)
//! [3..)      records, each exactly RECORD_LEN (10) bytes:
//!              [0]     tag (0x00 = data, 0x01 = timestamp)
//!              [1..8)  7-byte payload
//!              [8..10) data: chip group, chip-channel index
//!                      timestamp: reserved, must be zero
//! ```
//!
//! The data payload is the 54-bit ASIC UART word, little-endian:
//!
//! ```text
//! bits  0..2   packet type (0 = data)
//! bits  2..10  chip id
//! bits 10..17  channel
//! bits 17..41  timestamp
//! bits 41..51  ADC word
//! bit  51      FIFO half flag
//! bit  52      FIFO full flag
//! bit  53      odd parity over bits 0..54
//! bits 54..56  unused, must be zero
//! ```
//!
//! The timestamp payload is the raw 56-bit clock value, little-endian.
//!
//! Every record has the same width, so record `n` of a frame always starts
//! at byte `HEADER_LEN + n * RECORD_LEN`.

use crate::error::FormatError;
use crate::record::{DataFlags, DataRecord, Record, TimestampRecord};

/// Format major version written by this build. Frames with another major
/// version are rejected.
pub const VERSION_MAJOR: u8 = 1;

/// Format minor version written by this build.
pub const VERSION_MINOR: u8 = 0;

/// Byte separating the version from the record sequence.
pub const DELIMITER: u8 = b'/';

/// Length of the frame header (version + delimiter).
pub const HEADER_LEN: usize = 3;

/// Fixed width of every encoded record.
pub const RECORD_LEN: usize = 10;

/// Tag byte of a data record.
pub const TAG_DATA: u8 = 0x00;

/// Tag byte of a timestamp record.
pub const TAG_TIMESTAMP: u8 = 0x01;

/// Width of the packed payload inside a record.
const PAYLOAD_LEN: usize = 7;

const PACKET_TYPE_DATA: u64 = 0;

const PACKET_TYPE_BITS: u32 = 2;
const CHIP_ID_SHIFT: u32 = 2;
const CHIP_ID_BITS: u32 = 8;
const CHANNEL_SHIFT: u32 = 10;
const CHANNEL_BITS: u32 = 7;
const TIMESTAMP_SHIFT: u32 = 17;
const TIMESTAMP_BITS: u32 = 24;
const ADC_SHIFT: u32 = 41;
const ADC_BITS: u32 = 10;
const FIFO_HALF_SHIFT: u32 = 51;
const FIFO_FULL_SHIFT: u32 = 52;
const PARITY_SHIFT: u32 = 53;

/// Mask of the 54 bits that make up an ASIC word.
const WORD_MASK: u64 = (1 << 54) - 1;

/// Largest clock value a timestamp record can carry.
pub const CLOCK_MAX: u64 = (1 << 56) - 1;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Format major version.
    pub version_major: u8,
    /// Format minor version.
    pub version_minor: u8,
    /// Records in wire order.
    pub records: Vec<Record>,
}

impl Frame {
    /// Creates a frame at the current format version.
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            records,
        }
    }
}

/// Encodes records into a frame at the current format version.
///
/// # Errors
///
/// Returns [`FormatError::FieldOverflow`] if any field does not fit its
/// wire width (chip id > 255, channel > 127, timestamp > 24 bits, ADC > 10
/// bits, clock value > 56 bits).
pub fn encode(records: &[Record]) -> Result<Vec<u8>, FormatError> {
    encode_with_version(VERSION_MAJOR, VERSION_MINOR, records)
}

/// Encodes a frame, keeping its version bytes.
///
/// # Errors
///
/// See [`encode`].
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FormatError> {
    encode_with_version(frame.version_major, frame.version_minor, &frame.records)
}

fn encode_with_version(major: u8, minor: u8, records: &[Record]) -> Result<Vec<u8>, FormatError> {
    let mut out = Vec::with_capacity(HEADER_LEN + records.len() * RECORD_LEN);
    out.extend_from_slice(&[major, minor, DELIMITER]);

    for record in records {
        match record {
            Record::Data(data) => {
                let word = pack_word(data)?;
                out.push(TAG_DATA);
                out.extend_from_slice(&word.to_le_bytes()[..PAYLOAD_LEN]);
                out.push(data.chip_group);
                out.push(data.chip_channel_id);
            }
            Record::Timestamp(ts) => {
                check_width("clock_value", ts.clock_value, CLOCK_MAX)?;
                out.push(TAG_TIMESTAMP);
                out.extend_from_slice(&ts.clock_value.to_le_bytes()[..PAYLOAD_LEN]);
                out.extend_from_slice(&[0, 0]);
            }
        }
    }

    Ok(out)
}

/// Decodes a frame into its records, failing on the first malformed record.
///
/// # Errors
///
/// - [`FormatError::MissingVersionDelimiter`] if byte 2 is not `/`
/// - [`FormatError::UnsupportedVersion`] for a foreign major version
/// - [`FormatError::TruncatedRecord`] if the final chunk is short
/// - [`FormatError::UnknownRecordTag`] for a tag other than data/timestamp
/// - [`FormatError::UnsupportedPacketType`], [`FormatError::ReservedBitsSet`]
///   or [`FormatError::ReservedBytesSet`] for malformed record payloads
pub fn decode(bytes: &[u8]) -> Result<Vec<Record>, FormatError> {
    decode_frame(bytes).map(|frame| frame.records)
}

/// Decodes a frame, keeping its version bytes.
///
/// # Errors
///
/// See [`decode`].
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FormatError> {
    let iter = decode_iter(bytes)?;
    let (version_major, version_minor) = (iter.version_major, iter.version_minor);
    let records = iter.collect::<Result<Vec<_>, _>>()?;

    Ok(Frame {
        version_major,
        version_minor,
        records,
    })
}

/// Validates the frame header and returns a per-record iterator.
///
/// Unlike [`decode`], a malformed record does not end iteration: each chunk
/// yields its own `Result`, so callers can skip bad records and keep the
/// rest of the frame.
///
/// # Errors
///
/// Returns [`FormatError::MissingVersionDelimiter`] or
/// [`FormatError::UnsupportedVersion`] if the header is unusable.
pub fn decode_iter(bytes: &[u8]) -> Result<RecordIter<'_>, FormatError> {
    if bytes.len() < HEADER_LEN || bytes[2] != DELIMITER {
        return Err(FormatError::MissingVersionDelimiter { len: bytes.len() });
    }

    let (major, minor) = (bytes[0], bytes[1]);
    if major != VERSION_MAJOR {
        return Err(FormatError::UnsupportedVersion {
            major,
            minor,
            supported: VERSION_MAJOR,
        });
    }

    Ok(RecordIter {
        bytes,
        offset: HEADER_LEN,
        version_major: major,
        version_minor: minor,
    })
}

/// Iterator over the records of a frame, yielding one `Result` per chunk.
#[derive(Debug, Clone)]
pub struct RecordIter<'a> {
    bytes: &'a [u8],
    offset: usize,
    version_major: u8,
    version_minor: u8,
}

impl RecordIter<'_> {
    /// Version of the frame being iterated.
    pub fn version(&self) -> (u8, u8) {
        (self.version_major, self.version_minor)
    }
}

impl Iterator for RecordIter<'_> {
    type Item = Result<Record, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.bytes.len().checked_sub(self.offset)?;
        if remaining == 0 {
            return None;
        }

        let offset = self.offset;
        if remaining < RECORD_LEN {
            self.offset = self.bytes.len();
            return Some(Err(FormatError::TruncatedRecord {
                offset,
                remaining,
                expected: RECORD_LEN,
            }));
        }

        self.offset += RECORD_LEN;
        let mut chunk = [0u8; RECORD_LEN];
        chunk.copy_from_slice(&self.bytes[offset..offset + RECORD_LEN]);
        Some(decode_record(&chunk, offset))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.bytes.len().saturating_sub(self.offset);
        let chunks = remaining.div_ceil(RECORD_LEN);
        (chunks, Some(chunks))
    }
}

fn decode_record(chunk: &[u8; RECORD_LEN], offset: usize) -> Result<Record, FormatError> {
    let mut raw = [0u8; 8];
    raw[..PAYLOAD_LEN].copy_from_slice(&chunk[1..=PAYLOAD_LEN]);
    let payload = u64::from_le_bytes(raw);

    match chunk[0] {
        TAG_DATA => {
            let data = unpack_word(payload, chunk[8], chunk[9], offset)?;
            Ok(Record::Data(data))
        }
        TAG_TIMESTAMP => {
            let reserved = [chunk[8], chunk[9]];
            if reserved != [0, 0] {
                return Err(FormatError::ReservedBytesSet { reserved, offset });
            }
            Ok(Record::Timestamp(TimestampRecord {
                clock_value: payload,
            }))
        }
        tag => Err(FormatError::UnknownRecordTag { tag, offset }),
    }
}

/// Packs a data record into a 54-bit ASIC word with its parity bit.
fn pack_word(data: &DataRecord) -> Result<u64, FormatError> {
    let chip_id = check_width("chip_id", u64::from(data.chip_id), max_for(CHIP_ID_BITS))?;
    let channel = check_width("channel", u64::from(data.channel), max_for(CHANNEL_BITS))?;
    let timestamp = check_width("timestamp", u64::from(data.timestamp), max_for(TIMESTAMP_BITS))?;
    let adc = check_width("adc_value", u64::from(data.adc_value), max_for(ADC_BITS))?;

    let mut word = PACKET_TYPE_DATA
        | chip_id << CHIP_ID_SHIFT
        | channel << CHANNEL_SHIFT
        | timestamp << TIMESTAMP_SHIFT
        | adc << ADC_SHIFT
        | u64::from(data.flags.fifo_half) << FIFO_HALF_SHIFT
        | u64::from(data.flags.fifo_full) << FIFO_FULL_SHIFT;

    // Odd parity: the full word must carry an odd number of set bits.
    let parity = u64::from(word.count_ones() % 2 == 0);
    let parity = if data.parity_ok { parity } else { parity ^ 1 };
    word |= parity << PARITY_SHIFT;

    Ok(word)
}

#[allow(clippy::cast_possible_truncation)] // every field is masked to its width first
fn unpack_word(
    payload: u64,
    chip_group: u8,
    chip_channel_id: u8,
    offset: usize,
) -> Result<DataRecord, FormatError> {
    let stray = payload & !WORD_MASK;
    if stray != 0 {
        return Err(FormatError::ReservedBitsSet {
            bits: stray,
            offset,
        });
    }

    let word = payload;
    let packet_type = (word & max_for(PACKET_TYPE_BITS)) as u8;
    if u64::from(packet_type) != PACKET_TYPE_DATA {
        return Err(FormatError::UnsupportedPacketType {
            packet_type,
            offset,
        });
    }

    let field = |shift: u32, bits: u32| (word >> shift) & max_for(bits);

    Ok(DataRecord {
        chip_group,
        chip_channel_id,
        chip_id: field(CHIP_ID_SHIFT, CHIP_ID_BITS) as u16,
        channel: field(CHANNEL_SHIFT, CHANNEL_BITS) as u8,
        timestamp: field(TIMESTAMP_SHIFT, TIMESTAMP_BITS) as u32,
        adc_value: field(ADC_SHIFT, ADC_BITS) as u16,
        parity_ok: word.count_ones() % 2 == 1,
        flags: DataFlags {
            fifo_half: field(FIFO_HALF_SHIFT, 1) == 1,
            fifo_full: field(FIFO_FULL_SHIFT, 1) == 1,
        },
    })
}

const fn max_for(bits: u32) -> u64 {
    (1 << bits) - 1
}

fn check_width(field: &'static str, value: u64, max: u64) -> Result<u64, FormatError> {
    if value > max {
        return Err(FormatError::FieldOverflow { field, value, max });
    }
    Ok(value)
}
