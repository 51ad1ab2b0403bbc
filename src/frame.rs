//! Length-prefixed binary framing shared by server and client.
//!
//! Every frame starts with an 8-byte big-endian header: a command id followed
//! by the total frame length (header included). Bodies are fixed-width per
//! command, so a length that disagrees with its command is a protocol
//! violation. The codec is driven through `FramedRead`/`FramedWrite`, which
//! buffer partial frames across reads and hand back one decoded frame at a
//! time regardless of how TCP segmented the bytes.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::record::{RecordError, SampleRecord, TIMESTAMP_LEN};

pub const HEADER_LEN: usize = 8;
/// Both data frames carry a fixed-width timestamp plus a 4-byte value.
pub const SAMPLE_BODY_LEN: usize = TIMESTAMP_LEN + 4;
pub const MAX_FRAME_LEN: usize = HEADER_LEN + SAMPLE_BODY_LEN;

/// Initial capacity of each connection's read buffer.
pub const READ_BUFFER_CAPACITY: usize = 1024;

const HEARTBEAT: i32 = 1;
const DATA_REQUEST: i32 = 2;
const DATA_RESPONSE: i32 = 3;

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Liveness signal, empty body.
    Heartbeat,
    /// Client asks for history, carrying its last locally-recorded sample.
    /// `None` means the client has no local records yet (the field is sent
    /// as all-zero bytes on the wire).
    DataRequest { last_seen: Option<SampleRecord> },
    /// One sample, either replayed from the log or freshly broadcast.
    DataResponse { record: SampleRecord },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unknown command id {0}")]
    UnknownCommand(i32),
    #[error("command {command} declared total length {total_len}")]
    BadLength { command: i32, total_len: i32 },
    #[error("timestamp field is not valid UTF-8")]
    BadTimestamp,
    #[error("request carries a zero timestamp with a nonzero value")]
    BadSentinel,
    #[error(transparent)]
    BadRecord(#[from] RecordError),
}

/// Stateless codec; all reassembly state lives in the `BytesMut` that
/// `FramedRead` owns.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Frame {
    fn command_id(&self) -> i32 {
        match self {
            Frame::Heartbeat => HEARTBEAT,
            Frame::DataRequest { .. } => DATA_REQUEST,
            Frame::DataResponse { .. } => DATA_RESPONSE,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Frame::Heartbeat => 0,
            Frame::DataRequest { .. } | Frame::DataResponse { .. } => SAMPLE_BODY_LEN,
        }
    }

    fn expected_body_len(command: i32) -> usize {
        match command {
            HEARTBEAT => 0,
            _ => SAMPLE_BODY_LEN,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < HEADER_LEN {
            // Not even a full header yet; leave the bytes untouched.
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        // Peek the header without consuming it so an incomplete body leaves
        // the buffer exactly as it was.
        let mut header = &src[..HEADER_LEN];
        let command = header.get_i32();
        let total_len = header.get_i32();

        if !matches!(command, HEARTBEAT | DATA_REQUEST | DATA_RESPONSE) {
            return Err(FrameError::UnknownCommand(command));
        }
        let expected = HEADER_LEN + Frame::expected_body_len(command);
        if total_len as usize != expected {
            return Err(FrameError::BadLength { command, total_len });
        }
        if src.len() < expected {
            src.reserve(expected - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let mut body = src.split_to(expected - HEADER_LEN);
        let frame = match command {
            HEARTBEAT => Frame::Heartbeat,
            DATA_REQUEST => Frame::DataRequest {
                last_seen: decode_request_field(&mut body)?,
            },
            _ => Frame::DataResponse {
                record: decode_sample_field(&mut body)?,
            },
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let total_len = HEADER_LEN + frame.body_len();
        dst.reserve(total_len);
        dst.put_i32(frame.command_id());
        dst.put_i32(total_len as i32);
        match frame {
            Frame::Heartbeat => {}
            Frame::DataRequest { last_seen: None } => {
                dst.put_bytes(0, SAMPLE_BODY_LEN);
            }
            Frame::DataRequest {
                last_seen: Some(record),
            }
            | Frame::DataResponse { record } => {
                dst.put_slice(record.timestamp.as_bytes());
                dst.put_i32(record.value);
            }
        }
        Ok(())
    }
}

/// Reads the fixed-width (timestamp, value) body shared by request and
/// response frames.
fn decode_sample_field(body: &mut BytesMut) -> Result<SampleRecord, FrameError> {
    let timestamp = body.split_to(TIMESTAMP_LEN);
    let value = body.get_i32();
    let timestamp =
        std::str::from_utf8(&timestamp).map_err(|_| FrameError::BadTimestamp)?;
    Ok(SampleRecord::new(timestamp, value)?)
}

/// Like [`decode_sample_field`], but an all-zero body decodes to `None`,
/// the request sent by a client with no local history. A zero timestamp with
/// a nonzero value is neither the sentinel nor a record and is rejected.
fn decode_request_field(body: &mut BytesMut) -> Result<Option<SampleRecord>, FrameError> {
    if body[..TIMESTAMP_LEN].iter().all(|&b| b == 0) {
        if body[TIMESTAMP_LEN..].iter().any(|&b| b != 0) {
            return Err(FrameError::BadSentinel);
        }
        return Ok(None);
    }
    decode_sample_field(body).map(Some)
}
