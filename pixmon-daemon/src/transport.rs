//! TCP message transport.
//!
//! Producers connect over TCP and send length-prefixed envelopes:
//!
//! ```text
//! kind: u8 | len: u32 (big-endian) | body: len bytes
//! ```
//!
//! | kind | message | body                                        |
//! |------|---------|---------------------------------------------|
//! | 0    | data    | one encoded wire frame                      |
//! | 1    | info    | `origin \0 text` (UTF-8)                    |
//! | 2    | state   | one byte: 0 not-running, 1 ready, 2 running, 3 stopped |
//! | 3    | run     | one byte: 0 started, 1 ended; then origin   |
//!
//! Each connection gets a reader thread that forwards decoded messages into
//! one bounded channel consumed by the monitor loop.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::SyncSender;
use std::thread;

use pixmon::error::TransportError;
use pixmon::monitor::{DataMetadata, InboundMessage};
use pixmon::{DaqState, RunEvent};

const KIND_DATA: u8 = 0;
const KIND_INFO: u8 = 1;
const KIND_STATE: u8 = 2;
const KIND_RUN: u8 = 3;

/// Largest accepted envelope body.
pub const MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

fn malformed(reason: impl Into<String>) -> TransportError {
    TransportError::Malformed {
        reason: reason.into(),
    }
}

/// Reads one envelope. Returns `Ok(None)` on a clean end of stream.
///
/// # Errors
///
/// Returns [`TransportError::Malformed`] for an unknown kind, an oversized
/// or invalid body, and [`TransportError::Io`] for read failures, including
/// a stream that ends mid-envelope.
pub fn read_envelope<R: Read>(
    reader: &mut R,
    origin: &str,
    sequence: u64,
) -> Result<Option<InboundMessage>, TransportError> {
    let mut header = [0u8; 5];
    match reader.read_exact(&mut header[..1]) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TransportError::Io { source: e }),
    }
    reader
        .read_exact(&mut header[1..])
        .map_err(|e| TransportError::Io { source: e })?;

    let kind = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_BODY_LEN {
        return Err(malformed(format!("body of {len} bytes exceeds {MAX_BODY_LEN}")));
    }

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .map_err(|e| TransportError::Io { source: e })?;

    decode_body(kind, body, origin, sequence).map(Some)
}

fn decode_body(
    kind: u8,
    body: Vec<u8>,
    origin: &str,
    sequence: u64,
) -> Result<InboundMessage, TransportError> {
    match kind {
        KIND_DATA => Ok(InboundMessage::Data {
            metadata: DataMetadata {
                origin: origin.to_string(),
                sequence: Some(sequence),
            },
            payload: body,
        }),
        KIND_INFO => {
            let text = String::from_utf8(body).map_err(|_| malformed("info is not UTF-8"))?;
            let (origin, text) = text
                .split_once('\0')
                .ok_or_else(|| malformed("info without origin separator"))?;
            Ok(InboundMessage::Info {
                origin: origin.to_string(),
                text: text.to_string(),
            })
        }
        KIND_STATE => {
            let new_state = match body.as_slice() {
                [0] => DaqState::NotRunning,
                [1] => DaqState::Ready,
                [2] => DaqState::Running,
                [3] => DaqState::Stopped,
                _ => return Err(malformed("invalid state body")),
            };
            Ok(InboundMessage::State { new_state })
        }
        KIND_RUN => {
            let (&code, rest) = body
                .split_first()
                .ok_or_else(|| malformed("empty run event"))?;
            let event = match code {
                0 => RunEvent::RunStarted,
                1 => RunEvent::RunEnded,
                other => return Err(malformed(format!("unknown run event {other}"))),
            };
            let origin =
                String::from_utf8(rest.to_vec()).map_err(|_| malformed("origin is not UTF-8"))?;
            Ok(InboundMessage::Run { origin, event })
        }
        other => Err(malformed(format!("unknown envelope kind {other}"))),
    }
}

/// Encodes a message as an envelope.
///
/// # Errors
///
/// Returns [`TransportError::Malformed`] if the body does not fit in an
/// envelope or an info origin contains the separator.
pub fn encode_envelope(message: &InboundMessage) -> Result<Vec<u8>, TransportError> {
    let (kind, body) = match message {
        InboundMessage::Data { payload, .. } => (KIND_DATA, payload.clone()),
        InboundMessage::Info { origin, text } => {
            if origin.contains('\0') {
                return Err(malformed("origin contains NUL"));
            }
            (KIND_INFO, format!("{origin}\0{text}").into_bytes())
        }
        InboundMessage::State { new_state } => {
            let code = match new_state {
                DaqState::NotRunning => 0,
                DaqState::Ready => 1,
                DaqState::Running => 2,
                DaqState::Stopped => 3,
            };
            (KIND_STATE, vec![code])
        }
        InboundMessage::Run { origin, event } => {
            let code = match event {
                RunEvent::RunStarted => 0,
                RunEvent::RunEnded => 1,
            };
            let mut body = vec![code];
            body.extend_from_slice(origin.as_bytes());
            (KIND_RUN, body)
        }
    };

    let len = u32::try_from(body.len())
        .ok()
        .filter(|&len| len <= MAX_BODY_LEN)
        .ok_or_else(|| malformed(format!("body of {} bytes too large", body.len())))?;

    let mut out = Vec::with_capacity(5 + body.len());
    out.push(kind);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Writes one envelope.
///
/// # Errors
///
/// See [`encode_envelope`]; write failures are [`TransportError::Io`].
pub fn write_envelope<W: Write>(
    writer: &mut W,
    message: &InboundMessage,
) -> Result<(), TransportError> {
    let bytes = encode_envelope(message)?;
    writer
        .write_all(&bytes)
        .map_err(|e| TransportError::Io { source: e })
}

/// Envelopes buffered between the connection readers and the monitor loop.
///
/// When the loop falls behind, readers block on the full queue and stop
/// reading their sockets, so TCP flow control pushes back on producers.
pub const INBOUND_QUEUE_DEPTH: usize = 1024;

/// Accepts producer connections forever (blocking; run it on a
/// dedicated thread).
pub fn run_listener(listener: TcpListener, tx: SyncSender<InboundMessage>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("accept error: {e}");
                continue;
            }
        };

        let tx = tx.clone();
        let spawned = thread::Builder::new()
            .name("pixmon-conn".to_string())
            .spawn(move || serve_connection(stream, &tx));
        if let Err(e) = spawned {
            tracing::error!("failed to spawn connection thread: {e}");
        }
    }
}

fn serve_connection(mut stream: TcpStream, tx: &SyncSender<InboundMessage>) {
    let peer = stream
        .peer_addr()
        .map_or_else(|_| "unknown".to_string(), |a| a.to_string());
    tracing::info!(%peer, "producer connected");

    let envelopes = forward_envelopes(&mut stream, &peer, tx);
    tracing::info!(%peer, envelopes, "producer disconnected");
}

/// Forwards envelopes from one producer until it closes or misbehaves.
///
/// Blocks while the queue is full. Returns the number of envelopes
/// forwarded.
fn forward_envelopes<R: Read>(
    reader: &mut R,
    peer: &str,
    tx: &SyncSender<InboundMessage>,
) -> u64 {
    let mut sequence = 0u64;
    loop {
        match read_envelope(reader, peer, sequence) {
            Ok(Some(message)) => {
                if tx.send(message).is_err() {
                    tracing::debug!(%peer, "monitor loop gone, closing connection");
                    return sequence;
                }
                sequence += 1;
            }
            Ok(None) => return sequence,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "dropping producer connection");
                return sequence;
            }
        }
    }
}
