// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reassembly of protocol messages from a chunked byte stream.
//!
//! The transport hands back whatever bytes happen to be available, so frame
//! boundaries land anywhere: a chunk may hold garbage, half a frame, or
//! several frames at once. `MsgStream` accumulates chunks until one complete
//! flag-delimited frame is present, returns exactly one decoded message per
//! call, and carries everything after it over to the next call. The leftover
//! buffer is always either empty or starts with the flag byte.

use log::{debug, error, info};
use node_messages::{MsgKind, Request};

use crate::transport::{Transport, TransportError};

// Flow-control escaping applied by some firmware UART drivers underneath the
// HDLC layer; restored before de-framing when the firmware family uses it.
const UART_XON: u8 = 0x11;
const UART_XON_ESCAPED: u8 = 0x01;
const UART_XOFF: u8 = 0x13;
const UART_XOFF_ESCAPED: u8 = 0x03;
const UART_ESCAPE: u8 = 0x12;
const UART_ESCAPE_ESCAPED: u8 = 0x02;

pub struct MsgStream {
    peer: String,
    transport: Box<dyn Transport>,
    leftover: Vec<u8>,
    restore_flow_escapes: bool,
}

impl MsgStream {
    pub fn new(
        peer: impl Into<String>,
        transport: Box<dyn Transport>,
        restore_flow_escapes: bool,
    ) -> MsgStream {
        MsgStream {
            peer: peer.into(),
            transport,
            leftover: Vec::new(),
            restore_flow_escapes,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Frames and sends one request.
    pub fn send_request(&mut self, request: &Request) -> Result<(), TransportError> {
        let msg = request.encode();
        let frame = hdlc::hdlcify(&msg).expect("requests are never empty");
        info!("send {} to {}", request.kind(), self.peer);
        debug!("send frame to {}: {}", self.peer, hex(&frame));
        self.transport.send(&frame)
    }

    /// Returns one complete, CRC-verified, de-framed message, or an empty
    /// buffer if none becomes available within one transport read timeout.
    /// Malformed frames are dropped here and reported as "nothing available";
    /// the stream resynchronizes on the next flag byte.
    pub fn recv_msg(&mut self) -> Result<Vec<u8>, TransportError> {
        let frame = match self.read_frame()? {
            Some(frame) => frame,
            None => return Ok(Vec::new()),
        };
        let frame = if self.restore_flow_escapes {
            restore_flow_escapes(&frame)
        } else {
            frame
        };
        debug!("recv frame from {}: {}", self.peer, hex(&frame));
        let msg = match hdlc::dehdlcify(&frame) {
            Ok(msg) => msg,
            Err(err) => {
                error!("dropping malformed frame from {}: {err}", self.peer);
                return Ok(Vec::new());
            }
        };
        match msg.first().copied().and_then(MsgKind::from_u8) {
            // logging every IND_RX of a burst would flood the output
            Some(MsgKind::IndRx) => {}
            Some(kind) => info!("recv {kind} from {}", self.peer),
            None => {}
        }
        Ok(msg)
    }

    /// Accumulates transport chunks until the buffer holds one complete
    /// frame, then splits it off, leaving the remainder (trimmed back to the
    /// next flag byte) for the following call.
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut buf = std::mem::take(&mut self.leftover);
        let frame = loop {
            discard_garbage(&self.peer, &mut buf);
            if buf.len() >= hdlc::MIN_FRAME_LEN {
                if let Some(end) = buf[1..].iter().position(|&b| b == hdlc::FLAG) {
                    let end = end + 1;
                    self.leftover = buf.split_off(end + 1);
                    break buf;
                }
            }
            let chunk = self.transport.recv()?;
            if chunk.is_empty() {
                self.leftover = buf;
                return Ok(None);
            }
            debug!("recv bytes from {}: {}", self.peer, hex(&chunk));
            buf.extend_from_slice(&chunk);
        };
        let mut leftover = std::mem::take(&mut self.leftover);
        discard_garbage(&self.peer, &mut leftover);
        self.leftover = leftover;
        Ok(Some(frame))
    }

    #[cfg(test)]
    pub(crate) fn leftover(&self) -> &[u8] {
        &self.leftover
    }
}

/// Drops everything ahead of the first flag byte, so the buffer is either
/// empty or frame-aligned.
fn discard_garbage(peer: &str, buf: &mut Vec<u8>) {
    if buf.is_empty() || buf[0] == hdlc::FLAG {
        return;
    }
    match buf.iter().position(|&b| b == hdlc::FLAG) {
        Some(pos) => {
            error!(
                "discarding {pos} garbage bytes from {peer}: {}",
                hex(&buf[..pos])
            );
            buf.drain(..pos);
        }
        None => {
            error!(
                "discarding {} garbage bytes from {peer}: {}",
                buf.len(),
                hex(buf)
            );
            buf.clear();
        }
    }
}

/// Undoes the firmware UART's XON/XOFF/ESC substitution in a single
/// left-to-right pass. An escape byte followed by anything else is passed
/// through untouched.
fn restore_flow_escapes(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == UART_ESCAPE && i + 1 < data.len() {
            let restored = match data[i + 1] {
                UART_XON_ESCAPED => Some(UART_XON),
                UART_XOFF_ESCAPED => Some(UART_XOFF),
                UART_ESCAPE_ESCAPED => Some(UART_ESCAPE),
                _ => None,
            };
            if let Some(byte) = restored {
                out.push(byte);
                i += 2;
                continue;
            }
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testutil::mock;

    fn stream_with_chunks(chunks: Vec<Vec<u8>>) -> MsgStream {
        let (transport, state) = mock();
        {
            let mut state = state.lock().unwrap();
            for chunk in chunks {
                state.push_chunk(0, chunk);
            }
        }
        MsgStream::new("n1", Box::new(transport), false)
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let first = hdlc::hdlcify(&[0x08]).unwrap();
        let second = hdlc::hdlcify(&[0x0a]).unwrap();
        let mut chunk = first.clone();
        chunk.extend_from_slice(&second);

        let mut stream = stream_with_chunks(vec![chunk]);
        assert_eq!(stream.recv_msg().unwrap(), [0x08]);
        // the second frame survives verbatim in the leftover
        assert_eq!(stream.leftover(), &second[..]);
        assert_eq!(stream.recv_msg().unwrap(), [0x0a]);
        assert!(stream.leftover().is_empty());
    }

    #[test]
    fn leading_garbage_is_discarded() {
        let frame = hdlc::hdlcify(&[0x08]).unwrap();
        let mut chunk = vec![0xaa, 0xbb, 0xcc];
        chunk.extend_from_slice(&frame);

        let mut stream = stream_with_chunks(vec![chunk]);
        assert_eq!(stream.recv_msg().unwrap(), [0x08]);
    }

    #[test]
    fn garbage_between_frames_is_discarded() {
        let first = hdlc::hdlcify(&[0x08]).unwrap();
        let second = hdlc::hdlcify(&[0x0a]).unwrap();
        let mut chunk = first;
        chunk.extend_from_slice(&[0x42, 0x42]);
        chunk.extend_from_slice(&second);

        let mut stream = stream_with_chunks(vec![chunk]);
        assert_eq!(stream.recv_msg().unwrap(), [0x08]);
        assert_eq!(stream.leftover(), &second[..]);
        assert_eq!(stream.recv_msg().unwrap(), [0x0a]);
    }

    #[test]
    fn frame_split_across_chunks() {
        let frame = hdlc::hdlcify(&[0x08]).unwrap();
        let (head, tail) = frame.split_at(2);

        let mut stream = stream_with_chunks(vec![head.to_vec(), tail.to_vec()]);
        assert_eq!(stream.recv_msg().unwrap(), [0x08]);
    }

    #[test]
    fn partial_frame_survives_across_calls() {
        let frame = hdlc::hdlcify(&[0x08]).unwrap();
        let (head, tail) = frame.split_at(3);

        let (transport, state) = mock();
        state.lock().unwrap().push_chunk(0, head.to_vec());
        let mut stream = MsgStream::new("n1", Box::new(transport), false);

        // only a prefix available: nothing to return, prefix kept
        assert_eq!(stream.recv_msg().unwrap(), Vec::<u8>::new());
        assert_eq!(stream.leftover(), head);

        state.lock().unwrap().push_chunk(0, tail.to_vec());
        assert_eq!(stream.recv_msg().unwrap(), [0x08]);
    }

    #[test]
    fn corrupted_frame_is_dropped_and_stream_recovers() {
        let mut bad = hdlc::hdlcify(&[0x08]).unwrap();
        bad[1] ^= 0xff; // breaks the CRC
        let good = hdlc::hdlcify(&[0x0a]).unwrap();
        let mut chunk = bad;
        chunk.extend_from_slice(&good);

        let mut stream = stream_with_chunks(vec![chunk]);
        assert_eq!(stream.recv_msg().unwrap(), Vec::<u8>::new());
        assert_eq!(stream.recv_msg().unwrap(), [0x0a]);
    }

    #[test]
    fn send_request_frames_the_encoding() {
        let (transport, state) = mock();
        let mut stream = MsgStream::new("n1", Box::new(transport), false);
        stream.send_request(&Request::Status).unwrap();

        let sent = state.lock().unwrap().sent.clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(hdlc::dehdlcify(&sent[0]).unwrap(), [0x01]);
    }

    #[test]
    fn flow_escapes_restored_before_deframing() {
        // a message whose bytes collide with XON, XOFF and the UART escape
        let msg = [0x08, UART_XON, UART_XOFF, UART_ESCAPE];
        let frame = hdlc::hdlcify(&msg).unwrap();
        // what the firmware UART would actually put on the wire
        let mut wire = Vec::new();
        for &byte in &frame {
            match byte {
                UART_XON => wire.extend_from_slice(&[UART_ESCAPE, UART_XON_ESCAPED]),
                UART_XOFF => wire.extend_from_slice(&[UART_ESCAPE, UART_XOFF_ESCAPED]),
                UART_ESCAPE => {
                    wire.extend_from_slice(&[UART_ESCAPE, UART_ESCAPE_ESCAPED])
                }
                byte => wire.push(byte),
            }
        }

        let (transport, state) = mock();
        state.lock().unwrap().push_chunk(0, wire);
        let mut stream = MsgStream::new("n1", Box::new(transport), true);
        assert_eq!(stream.recv_msg().unwrap(), msg);
    }

    #[test]
    fn restore_flow_escapes_passes_unknown_escapes() {
        assert_eq!(
            restore_flow_escapes(&[0x12, 0x01, 0x12, 0x03, 0x12, 0x02]),
            [0x11, 0x13, 0x12]
        );
        // escape followed by something else is not a substitution
        assert_eq!(restore_flow_escapes(&[0x12, 0x55]), [0x12, 0x55]);
        // trailing escape is passed through
        assert_eq!(restore_flow_escapes(&[0x08, 0x12]), [0x08, 0x12]);
    }
}
