// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types for messages exchanged between the host and a measurement node over
//! the framed serial link.
//!
//! The wire format is fixed: one kind byte followed by a kind-specific
//! payload, all multi-byte fields big-endian. The kind values and layouts
//! here must match the node firmware byte for byte; the unit tests pin them
//! with literal encodings.

use std::fmt;

use bitflags::bitflags;
use thiserror::Error;

/// Message kind byte, the first byte of every message in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgKind {
    ReqStatus = 1,
    RespStatus = 2,
    ReqIdle = 3,
    ReqTx = 4,
    IndTxDone = 5,
    ReqRx = 6,
    IndRx = 7,
    IndUp = 8,
    RespIdle = 10,
    RespTx = 11,
    RespRx = 12,
}

impl MsgKind {
    pub fn from_u8(value: u8) -> Option<MsgKind> {
        match value {
            1 => Some(MsgKind::ReqStatus),
            2 => Some(MsgKind::RespStatus),
            3 => Some(MsgKind::ReqIdle),
            4 => Some(MsgKind::ReqTx),
            5 => Some(MsgKind::IndTxDone),
            6 => Some(MsgKind::ReqRx),
            7 => Some(MsgKind::IndRx),
            8 => Some(MsgKind::IndUp),
            10 => Some(MsgKind::RespIdle),
            11 => Some(MsgKind::RespTx),
            12 => Some(MsgKind::RespRx),
            _ => None,
        }
    }

    /// Protocol name of the kind, as it appears in the logs.
    pub fn name(&self) -> &'static str {
        match self {
            MsgKind::ReqStatus => "REQ_ST",
            MsgKind::RespStatus => "RESP_ST",
            MsgKind::ReqIdle => "REQ_IDLE",
            MsgKind::ReqTx => "REQ_TX",
            MsgKind::IndTxDone => "IND_TXDONE",
            MsgKind::ReqRx => "REQ_RX",
            MsgKind::IndRx => "IND_RX",
            MsgKind::IndUp => "IND_UP",
            MsgKind::RespIdle => "RESP_IDLE",
            MsgKind::RespTx => "RESP_TX",
            MsgKind::RespRx => "RESP_RX",
        }
    }
}

impl fmt::Display for MsgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Node state as observed by the host.
///
/// `Idle`, `TxDone`, `Tx` and `Rx` are reported by the firmware in `RESP_ST`.
/// `StoppingRx` is a host-internal transient asking the receive loop to exit,
/// and `Unknown` is the initial state, re-entered on transport loss; neither
/// is ever accepted off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    StoppingRx,
    Idle,
    TxDone,
    Tx,
    Rx,
    Unknown,
}

impl NodeStatus {
    pub fn from_wire(value: u8) -> Option<NodeStatus> {
        match value {
            1 => Some(NodeStatus::Idle),
            2 => Some(NodeStatus::TxDone),
            3 => Some(NodeStatus::Tx),
            4 => Some(NodeStatus::Rx),
            _ => None,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeStatus::StoppingRx => "STOPPING_RX",
            NodeStatus::Idle => "IDLE",
            NodeStatus::TxDone => "TXDONE",
            NodeStatus::Tx => "TX",
            NodeStatus::Rx => "RX",
            NodeStatus::Unknown => "UNKNOWN",
        })
    }
}

bitflags! {
    /// Reception quality flags carried in `IND_RX`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RxFlags: u8 {
        const GOOD_CRC = 0x80;
        const RIGHT_FRAME = 0x40;
        /// The only acceptable combination for a recorded packet.
        const EXPECTED = 0xc0;
    }
}

/// An EUI-64 node address, displayed in the dash-separated form used
/// throughout the output records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub u64);

impl MacAddr {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        for (i, byte) in bytes.iter().enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// Burst parameters for a `REQ_TX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxParams {
    pub channel: u8,
    pub power_dbm: i8,
    pub trans_ctr: u16,
    pub num_packets: u16,
    pub ifdur_ms: u16,
    pub packet_len: u8,
    pub fill_byte: u8,
}

/// A host-to-node request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Status,
    Idle,
    StartTx(TxParams),
    StartRx {
        channel: u8,
        src_mac: MacAddr,
        trans_ctr: u16,
        packet_len: u8,
        fill_byte: u8,
    },
}

impl Request {
    pub fn kind(&self) -> MsgKind {
        match self {
            Request::Status => MsgKind::ReqStatus,
            Request::Idle => MsgKind::ReqIdle,
            Request::StartTx(_) => MsgKind::ReqTx,
            Request::StartRx { .. } => MsgKind::ReqRx,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Request::Status | Request::Idle => vec![self.kind() as u8],
            Request::StartTx(TxParams {
                channel,
                power_dbm,
                trans_ctr,
                num_packets,
                ifdur_ms,
                packet_len,
                fill_byte,
            }) => {
                let mut buf = Vec::with_capacity(11);
                buf.push(MsgKind::ReqTx as u8);
                buf.push(channel);
                buf.push(power_dbm as u8);
                buf.extend_from_slice(&trans_ctr.to_be_bytes());
                buf.extend_from_slice(&num_packets.to_be_bytes());
                buf.extend_from_slice(&ifdur_ms.to_be_bytes());
                buf.push(packet_len);
                buf.push(fill_byte);
                buf
            }
            Request::StartRx {
                channel,
                src_mac,
                trans_ctr,
                packet_len,
                fill_byte,
            } => {
                let mut buf = Vec::with_capacity(14);
                buf.push(MsgKind::ReqRx as u8);
                buf.push(channel);
                buf.extend_from_slice(&src_mac.0.to_be_bytes());
                buf.extend_from_slice(&trans_ctr.to_be_bytes());
                buf.push(packet_len);
                buf.push(fill_byte);
                buf
            }
        }
    }
}

/// A node-to-host response or indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    RespStatus {
        status: NodeStatus,
        notifications: u16,
        mac_addr: MacAddr,
    },
    RespIdle,
    RespTx,
    IndTxDone,
    RespRx,
    IndRx {
        length: u8,
        rssi: i8,
        flags: RxFlags,
        pkctr: u16,
    },
    IndUp,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,
    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),
    #[error("{0} is host-to-node only")]
    UnexpectedKind(MsgKindName),
    #[error("{kind} has {actual} bytes, expected {expected}")]
    WrongLength {
        kind: MsgKindName,
        expected: usize,
        actual: usize,
    },
    #[error("invalid status byte {0:#04x} in RESP_ST")]
    BadStatus(u8),
}

/// Newtype so `DecodeError` prints protocol names without dragging the whole
/// enum into its variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgKindName(pub MsgKind);

impl fmt::Display for MsgKindName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.name())
    }
}

impl Message {
    pub fn kind(&self) -> MsgKind {
        match self {
            Message::RespStatus { .. } => MsgKind::RespStatus,
            Message::RespIdle => MsgKind::RespIdle,
            Message::RespTx => MsgKind::RespTx,
            Message::IndTxDone => MsgKind::IndTxDone,
            Message::RespRx => MsgKind::RespRx,
            Message::IndRx { .. } => MsgKind::IndRx,
            Message::IndUp => MsgKind::IndUp,
        }
    }

    /// Parses a de-framed message. Every kind has a fixed length; anything
    /// else, including a host-to-node kind echoed back at us, is an error for
    /// the caller to treat as a protocol violation.
    pub fn decode(buf: &[u8]) -> Result<Message, DecodeError> {
        let &kind_byte = buf.first().ok_or(DecodeError::Empty)?;
        let kind = MsgKind::from_u8(kind_byte)
            .ok_or(DecodeError::UnknownKind(kind_byte))?;
        match kind {
            MsgKind::RespStatus => {
                expect_len(kind, buf, 12)?;
                let status = NodeStatus::from_wire(buf[1])
                    .ok_or(DecodeError::BadStatus(buf[1]))?;
                let notifications = u16::from_be_bytes([buf[2], buf[3]]);
                let mac = u64::from_be_bytes([
                    buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10],
                    buf[11],
                ]);
                Ok(Message::RespStatus {
                    status,
                    notifications,
                    mac_addr: MacAddr(mac),
                })
            }
            MsgKind::RespIdle => {
                expect_len(kind, buf, 1)?;
                Ok(Message::RespIdle)
            }
            MsgKind::RespTx => {
                expect_len(kind, buf, 1)?;
                Ok(Message::RespTx)
            }
            MsgKind::IndTxDone => {
                expect_len(kind, buf, 1)?;
                Ok(Message::IndTxDone)
            }
            MsgKind::RespRx => {
                expect_len(kind, buf, 1)?;
                Ok(Message::RespRx)
            }
            MsgKind::IndRx => {
                expect_len(kind, buf, 6)?;
                Ok(Message::IndRx {
                    length: buf[1],
                    rssi: buf[2] as i8,
                    flags: RxFlags::from_bits_retain(buf[3]),
                    pkctr: u16::from_be_bytes([buf[4], buf[5]]),
                })
            }
            MsgKind::IndUp => {
                expect_len(kind, buf, 1)?;
                Ok(Message::IndUp)
            }
            MsgKind::ReqStatus
            | MsgKind::ReqIdle
            | MsgKind::ReqTx
            | MsgKind::ReqRx => Err(DecodeError::UnexpectedKind(MsgKindName(kind))),
        }
    }
}

fn expect_len(kind: MsgKind, buf: &[u8], expected: usize) -> Result<(), DecodeError> {
    if buf.len() != expected {
        return Err(DecodeError::WrongLength {
            kind: MsgKindName(kind),
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}
