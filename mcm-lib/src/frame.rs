//! Framed bulk messages.
//!
//! Layout, all little-endian:
//!
//! ```text
//! u32 magic = 0xAA55AA55 | u16 length | u16 command | u32 reserved = 0 | payload | u16 crc16
//! ```
//!
//! `length` covers the whole frame including the CRC. The CRC covers every byte
//! before it.

use crate::constants::{
    CRC16_SEED, FRAME_CRC_SIZE, FRAME_HEADER_SIZE, FRAME_MAGIC, FRAME_MAX_PAYLOAD, FRAME_MIN_SIZE,
    FRAME_PREFIX_SIZE, MessageId,
};
use crate::error::{McmError, Result};
use bytes::{Buf, Bytes, BytesMut};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Fixed 12-byte header of a framed message.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    pub magic: U32,
    /// Total frame length: header, payload and CRC
    pub length: U16,
    pub command: U16,
    pub reserved: U32,
}

/// Feed one byte into the CRC16 used by the MCM (poly 0x1021, MSB first).
///
/// The shift/XOR sequence must stay exactly as is; the firmware computes the same thing.
pub fn crc16_update(crc: u16, byte: u8) -> u16 {
    let mut crc = crc.swap_bytes() ^ u16::from(byte);
    crc ^= (crc & 0x00FF) >> 4;
    crc ^= crc << 12;
    crc ^= (crc & 0x00FF) << 5;
    crc
}

pub fn crc16_with_seed(seed: u16, data: &[u8]) -> u16 {
    data.iter().fold(seed, |crc, &byte| crc16_update(crc, byte))
}

/// CRC16 over `data` with the frame seed.
pub fn crc16(data: &[u8]) -> u16 {
    crc16_with_seed(CRC16_SEED, data)
}

/// Build a complete frame for `command` carrying `payload`.
pub fn encode(command: u16, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > FRAME_MAX_PAYLOAD {
        return Err(McmError::FrameTooLarge { len: payload.len() });
    }
    let length = FRAME_MIN_SIZE + payload.len();
    let header = FrameHeader {
        magic: U32::new(FRAME_MAGIC),
        length: U16::new(length as u16),
        command: U16::new(command),
        reserved: U32::new(0),
    };

    let mut frame = BytesMut::with_capacity(length);
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame.freeze())
}

/// Check a complete frame and return its payload.
///
/// The CRC is verified before anything in the header is trusted. A frame carrying
/// [`MessageId::ErrorReport`] is turned into [`McmError::DeviceReportedError`].
pub fn validate(frame: Bytes, expected_command: u16) -> Result<Bytes> {
    if frame.len() < FRAME_MIN_SIZE {
        return Err(McmError::InvalidResponse(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }

    let crc_offset = frame.len() - FRAME_CRC_SIZE;
    let received = (&frame[crc_offset..]).get_u16_le();
    let computed = crc16(&frame[..crc_offset]);
    if received != computed {
        return Err(McmError::CorruptChecksum { received, computed });
    }

    let (header, _) = FrameHeader::read_from_prefix(&frame)
        .map_err(|_| McmError::InvalidResponse("frame header truncated".to_string()))?;
    if header.magic.get() != FRAME_MAGIC || usize::from(header.length.get()) != frame.len() {
        return Err(McmError::InvalidResponse(format!(
            "inconsistent header: magic 0x{:08X}, length {} for {} bytes",
            header.magic.get(),
            header.length.get(),
            frame.len()
        )));
    }

    let command = header.command.get();
    let payload = frame.slice(FRAME_HEADER_SIZE..crc_offset);
    if command == u16::from(MessageId::ErrorReport) {
        return Err(parse_error_report(&payload));
    }
    if command != expected_command {
        return Err(McmError::UnexpectedCommand {
            got: command,
            want: expected_command,
        });
    }
    Ok(payload)
}

/// Decode the first frame found in `data` and validate it against `expected_command`.
pub fn decode(data: &[u8], expected_command: u16) -> Result<Bytes> {
    let mut decoder = FrameDecoder::new();
    decoder.push(data);
    let frame = decoder
        .next_frame()
        .ok_or_else(|| McmError::InvalidResponse("no complete frame in data".to_string()))?;
    validate(frame, expected_command)
}

fn parse_error_report(payload: &[u8]) -> McmError {
    if payload.len() < 3 {
        return McmError::InvalidResponse(format!(
            "error report too short: {} bytes",
            payload.len()
        ));
    }
    let mut fields = payload;
    let command = fields.get_u16_le();
    let code = fields.get_u8();
    let text = fields.split(|&b| b == 0).next().unwrap_or_default();
    McmError::DeviceReportedError {
        command,
        code,
        message: String::from_utf8_lossy(text).into_owned(),
    }
}

/// Reassembles frames from bulk IN chunks that are not message aligned.
///
/// Garbage in front of a frame is dropped one byte at a time until a magic value
/// with a plausible length lines up.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Pop the next complete frame, or `None` if more data is needed.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            if self.buffer.len() < FRAME_PREFIX_SIZE {
                return None;
            }
            let mut prefix = &self.buffer[..FRAME_PREFIX_SIZE];
            let magic = prefix.get_u32_le();
            let length = usize::from(prefix.get_u16_le());

            if magic != FRAME_MAGIC || length < FRAME_MIN_SIZE {
                self.buffer.advance(1);
                continue;
            }
            if self.buffer.len() < length {
                return None;
            }
            return Some(self.buffer.split_to(length).freeze());
        }
    }
}
