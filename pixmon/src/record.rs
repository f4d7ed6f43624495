//! Typed readout records.
//!
//! A [`Record`] is one decoded unit of the wire format: either a data record
//! carrying a single ASIC hit, or a timestamp marker from the readout clock.
//! Records are addressed electronically by a [`ChipKey`] plus channel; the
//! mapping to physical pixels lives in [`crate::layout`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RecordError;

/// Electronics address of one ASIC: `(chip group, chip-channel index, chip id)`.
///
/// The group and chip-channel index identify the physical interface that
/// produced a record; a single monitor may see several chip buses, so the
/// chip id alone is not unique. Formats as `group-channel-chip`, e.g. `1-1-5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ChipKey {
    /// Chip group (I/O group) the chip is attached to.
    pub group: u8,
    /// Chip-channel index within the group.
    pub channel: u8,
    /// ASIC id on that interface.
    pub chip_id: u16,
}

impl ChipKey {
    /// Creates a chip key.
    pub const fn new(group: u8, channel: u8, chip_id: u16) -> Self {
        Self {
            group,
            channel,
            chip_id,
        }
    }
}

impl fmt::Display for ChipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.group, self.channel, self.chip_id)
    }
}

impl FromStr for ChipKey {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || RecordError::InvalidChipKey {
            input: s.to_string(),
        };
        let mut parts = s.split('-');
        let (Some(group), Some(channel), Some(chip_id), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(err());
        };

        Ok(Self {
            group: group.parse().map_err(|_| err())?,
            channel: channel.parse().map_err(|_| err())?,
            chip_id: chip_id.parse().map_err(|_| err())?,
        })
    }
}

impl From<ChipKey> for String {
    fn from(key: ChipKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for ChipKey {
    type Error = RecordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// FIFO status bits reported by the ASIC alongside each hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataFlags {
    /// The chip FIFO was at least half full when the hit was read out.
    pub fifo_half: bool,
    /// The chip FIFO was full when the hit was read out.
    pub fifo_full: bool,
}

/// One ASIC hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataRecord {
    /// Chip group (I/O group) of the interface that produced the hit.
    pub chip_group: u8,
    /// Chip-channel index of the interface that produced the hit.
    pub chip_channel_id: u8,
    /// ASIC id.
    pub chip_id: u16,
    /// Channel on the ASIC.
    pub channel: u8,
    /// 24-bit ASIC timestamp; wraps.
    pub timestamp: u32,
    /// ADC amplitude word.
    pub adc_value: u16,
    /// Whether the word passed its odd-parity check.
    pub parity_ok: bool,
    /// FIFO status bits.
    pub flags: DataFlags,
}

impl DataRecord {
    /// Returns the electronics address of the chip that produced this hit.
    pub fn chip_key(&self) -> ChipKey {
        ChipKey::new(self.chip_group, self.chip_channel_id, self.chip_id)
    }
}

/// A raw readout clock marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimestampRecord {
    /// Clock value; only the low 56 bits are representable on the wire.
    pub clock_value: u64,
}

/// One decoded unit of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    /// An ASIC hit.
    Data(DataRecord),
    /// A readout clock marker.
    Timestamp(TimestampRecord),
}

impl Record {
    /// Returns the data record, if this is one.
    pub fn as_data(&self) -> Option<&DataRecord> {
        match self {
            Record::Data(data) => Some(data),
            Record::Timestamp(_) => None,
        }
    }
}

impl From<DataRecord> for Record {
    fn from(record: DataRecord) -> Self {
        Record::Data(record)
    }
}

impl From<TimestampRecord> for Record {
    fn from(record: TimestampRecord) -> Self {
        Record::Timestamp(record)
    }
}
