//! Error types for the pixmon monitor.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all pixmon operations.
///
/// Each concern has its own enum; this one only routes them so callers that
/// don't care about the distinction can use [`Result`] and `?` throughout.
#[derive(Error, Debug)]
pub enum PixmonError {
    /// Malformed or unencodable wire bytes.
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// Invalid pixel layout or layout file.
    #[error("layout error: {0}")]
    Layout(#[from] LayoutError),

    /// Invalid monitor configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Telemetry delivery failure.
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Inbound message source failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid record field outside the wire format.
    #[error("record error: {0}")]
    Record(#[from] RecordError),
}

/// Errors raised while parsing record fields from text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// The string is not a `group-channel-chip` key.
    #[error("invalid chip key '{input}': expected group-channel-chip")]
    InvalidChipKey {
        /// The rejected input.
        input: String,
    },
}

/// Errors raised while encoding or decoding the wire format.
///
/// All of these are recoverable: the offending frame or record is skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// The frame does not carry the `/` delimiter after the version bytes.
    #[error("no version delimiter found in {len}-byte frame")]
    MissingVersionDelimiter {
        /// Length of the rejected buffer.
        len: usize,
    },

    /// The frame was produced by an incompatible format major version.
    #[error("unsupported format version {major}.{minor} (supported major {supported})")]
    UnsupportedVersion {
        /// Major version found in the frame.
        major: u8,
        /// Minor version found in the frame.
        minor: u8,
        /// The major version this build understands.
        supported: u8,
    },

    /// The final record chunk is shorter than the fixed record width.
    #[error("truncated record at offset {offset}: {remaining} of {expected} bytes")]
    TruncatedRecord {
        /// Byte offset of the chunk within the frame.
        offset: usize,
        /// Bytes actually present.
        remaining: usize,
        /// Fixed record width.
        expected: usize,
    },

    /// A record chunk starts with a tag that is neither data nor timestamp.
    #[error("unknown record tag {tag:#04x} at offset {offset}")]
    UnknownRecordTag {
        /// The tag byte.
        tag: u8,
        /// Byte offset of the chunk within the frame.
        offset: usize,
    },

    /// The ASIC word inside a data record is not a data packet.
    #[error("unsupported ASIC packet type {packet_type} at offset {offset}")]
    UnsupportedPacketType {
        /// The 2-bit packet type found in the word.
        packet_type: u8,
        /// Byte offset of the chunk within the frame.
        offset: usize,
    },

    /// A data payload has bits set above the 54-bit ASIC word.
    #[error("stray bits {bits:#x} above the ASIC word at offset {offset}")]
    ReservedBitsSet {
        /// The payload bits outside the word, in place.
        bits: u64,
        /// Byte offset of the chunk within the frame.
        offset: usize,
    },

    /// The reserved trailer of a timestamp record is not zero.
    #[error("reserved bytes {reserved:02x?} set in timestamp record at offset {offset}")]
    ReservedBytesSet {
        /// The two reserved bytes as found.
        reserved: [u8; 2],
        /// Byte offset of the chunk within the frame.
        offset: usize,
    },

    /// A field does not fit its bit width in the wire format.
    #[error("field {field} value {value} exceeds maximum {max}")]
    FieldOverflow {
        /// Name of the offending field.
        field: &'static str,
        /// The value that was supplied.
        value: u64,
        /// Largest encodable value.
        max: u64,
    },
}

/// Errors raised while building or loading a pixel layout.
///
/// On any of these the previously active lookup tables stay in effect.
#[derive(Error, Debug)]
pub enum LayoutError {
    /// The same pixel is assigned to two different electronics addresses.
    #[error("pixel {pixel} assigned to both {first} and {second}")]
    DuplicatePixelAssignment {
        /// The ambiguous pixel id.
        pixel: u16,
        /// First `chip/channel` address seen.
        first: String,
        /// Conflicting `chip/channel` address.
        second: String,
    },

    /// The same chip appears twice in the layout.
    #[error("chip {chip} listed more than once")]
    DuplicateChip {
        /// The repeated chip key.
        chip: String,
    },

    /// A pixel id does not fit the configured pixel table.
    #[error("pixel {pixel} out of range: layout table holds {pixel_count} pixels")]
    PixelOutOfRange {
        /// The offending pixel id.
        pixel: u16,
        /// Size of the per-pixel tables.
        pixel_count: usize,
    },

    /// A chip lists more channels than the ASIC has.
    #[error("chip {chip} lists {channels} channels (max {max})")]
    TooManyChannels {
        /// The chip key.
        chip: String,
        /// Number of channel entries supplied.
        channels: usize,
        /// Channels per chip.
        max: usize,
    },

    /// The layout name is not usable as a file name.
    #[error("invalid layout name '{name}'")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// The layout file could not be read.
    #[error("failed to read layout '{}': {source}", path.display())]
    Read {
        /// The layout file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The layout file is not valid layout JSON.
    #[error("failed to parse layout '{}': {source}", path.display())]
    Parse {
        /// The layout file path.
        path: PathBuf,
        /// The underlying JSON parsing error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised while validating or loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A bounded window was configured with zero capacity.
    #[error("{field} must be greater than zero")]
    ZeroCapacity {
        /// The offending field.
        field: &'static str,
    },

    /// The receive timeout would starve the per-second tick.
    #[error("receive timeout {timeout_ms}ms must be between 1ms and 1000ms")]
    ReceiveTimeout {
        /// The configured timeout in milliseconds.
        timeout_ms: u128,
    },

    /// The config file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON.
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: PathBuf,
        /// The underlying JSON parsing error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised while delivering a report to a telemetry sink.
///
/// These are logged and suppressed by the publisher; they never stop ingestion.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The report could not be serialized.
    #[error("failed to serialize report: {source}")]
    Serialize {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Writing the report failed.
    #[error("failed to write report: {source}")]
    Io {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to create the HTTP client.
    #[cfg(feature = "http-sink")]
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// HTTP request failed after retries.
    #[cfg(feature = "http-sink")]
    #[error("HTTP request failed: {source}")]
    RequestFailed {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The sink answered with a non-success status.
    #[error("sink returned status {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },

    /// The sink is not accepting reports.
    #[error("sink unavailable: {reason}")]
    Unavailable {
        /// Why the sink refused.
        reason: String,
    },
}

/// Errors raised by an inbound message source.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Every producer has gone away; no more messages will arrive.
    #[error("message source disconnected")]
    Disconnected,

    /// An envelope could not be parsed.
    #[error("malformed envelope: {reason}")]
    Malformed {
        /// Description of the problem.
        reason: String,
    },

    /// Reading from the underlying stream failed.
    #[error("transport I/O failed: {source}")]
    Io {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Type alias for `Result<T, PixmonError>`.
pub type Result<T> = std::result::Result<T, PixmonError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ChipKey;

    fn parse_key(s: &str) -> Result<ChipKey> {
        Ok(s.parse::<ChipKey>()?)
    }

    #[test]
    fn test_concern_errors_route_into_pixmon_error() {
        let err = parse_key("1-2").unwrap_err();
        assert!(matches!(err, PixmonError::Record(RecordError::InvalidChipKey { .. })));
        assert_eq!(
            err.to_string(),
            "record error: invalid chip key '1-2': expected group-channel-chip"
        );

        let err = PixmonError::from(TransportError::Disconnected);
        assert!(matches!(err, PixmonError::Transport(TransportError::Disconnected)));
        assert_eq!(err.to_string(), "transport error: message source disconnected");
    }

    #[test]
    fn test_result_alias_propagates_with_question_mark() {
        assert_eq!(parse_key("1-1-5").unwrap(), ChipKey::new(1, 1, 5));
    }
}
