// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HDLC-style framing for the node serial protocol.
//!
//! A frame is `FLAG || escape(msg || crc) || FLAG`, where the CRC is
//! CRC-16/X-25 appended little-endian. Escaping replaces any in-body flag or
//! escape byte with `ESCAPE` followed by the byte XORed with `ESCAPE_MASK`,
//! so the flag byte only ever appears as a frame boundary.

use crc::{Crc, CRC_16_IBM_SDLC};
use thiserror::Error;

/// Frame delimiter.
pub const FLAG: u8 = 0x7e;
/// Escape introducer for in-body `FLAG`/`ESCAPE` bytes.
pub const ESCAPE: u8 = 0x7d;
/// XOR mask applied to the byte following `ESCAPE`.
pub const ESCAPE_MASK: u8 = 0x20;
/// Shortest well-formed frame: flag, one message byte, two CRC bytes, flag.
pub const MIN_FRAME_LEN: usize = 5;

// CRC-16/X-25: polynomial 0x1021, init 0xffff, reflected, xorout 0xffff.
const X25: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("input is empty")]
    EmptyInput,
    #[error("escape byte at end of input has nothing to escape")]
    TruncatedEscape,
    #[error("frame is not flag-delimited")]
    NotDelimited,
    #[error("packet too short ({0} bytes)")]
    PacketTooShort(usize),
    #[error("wrong CRC (expected {expected:#06x}, got {actual:#06x})")]
    WrongCrc { expected: u16, actual: u16 },
}

/// Computes the CRC-16/X-25 of `data`, little-endian encoded.
pub fn calc_crc(data: &[u8]) -> Result<[u8; 2], FrameError> {
    if data.is_empty() {
        return Err(FrameError::EmptyInput);
    }
    Ok(X25.checksum(data).to_le_bytes())
}

/// Checks that the last two bytes of `data` are the CRC of the prefix.
pub fn verify_crc(data: &[u8]) -> Result<(), FrameError> {
    if data.len() < 3 {
        return Err(FrameError::PacketTooShort(data.len()));
    }
    let (body, trailer) = data.split_at(data.len() - 2);
    let expected = X25.checksum(body);
    let actual = u16::from_le_bytes([trailer[0], trailer[1]]);
    if expected != actual {
        return Err(FrameError::WrongCrc { expected, actual });
    }
    Ok(())
}

/// Escapes every in-body `FLAG` and `ESCAPE` byte in a single pass.
pub fn escape(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    if data.is_empty() {
        return Err(FrameError::EmptyInput);
    }
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        if byte == FLAG || byte == ESCAPE {
            out.push(ESCAPE);
            out.push(byte ^ ESCAPE_MASK);
        } else {
            out.push(byte);
        }
    }
    Ok(out)
}

/// Inverse of [`escape`]. Fails if the input ends in a dangling escape byte.
pub fn unescape(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    if data.is_empty() {
        return Err(FrameError::EmptyInput);
    }
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&byte) = iter.next() {
        if byte == ESCAPE {
            match iter.next() {
                Some(&escaped) => out.push(escaped ^ ESCAPE_MASK),
                None => return Err(FrameError::TruncatedEscape),
            }
        } else {
            out.push(byte);
        }
    }
    Ok(out)
}

/// Wraps `msg` into a complete frame: CRC appended, body escaped, flags added.
pub fn hdlcify(msg: &[u8]) -> Result<Vec<u8>, FrameError> {
    let crc = calc_crc(msg)?;
    let mut body = Vec::with_capacity(msg.len() + 2);
    body.extend_from_slice(msg);
    body.extend_from_slice(&crc);
    let escaped = escape(&body)?;
    let mut frame = Vec::with_capacity(escaped.len() + 2);
    frame.push(FLAG);
    frame.extend_from_slice(&escaped);
    frame.push(FLAG);
    Ok(frame)
}

/// Unwraps a complete flag-delimited frame back into the message it carries,
/// verifying and stripping the CRC.
pub fn dehdlcify(frame: &[u8]) -> Result<Vec<u8>, FrameError> {
    if frame.len() < 2 || frame[0] != FLAG || frame[frame.len() - 1] != FLAG {
        return Err(FrameError::NotDelimited);
    }
    let body = &frame[1..frame.len() - 1];
    if body.is_empty() {
        return Err(FrameError::PacketTooShort(0));
    }
    let mut unescaped = unescape(body)?;
    // type byte plus two CRC bytes at minimum
    if unescaped.len() < 3 {
        return Err(FrameError::PacketTooShort(unescaped.len()));
    }
    verify_crc(&unescaped)?;
    unescaped.truncate(unescaped.len() - 2);
    Ok(unescaped)
}
