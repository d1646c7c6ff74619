// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-stream transports to a node's serial port.
//!
//! The core only needs two primitives: write some bytes, and read whatever
//! is available within a short timeout. Reassembly into protocol messages
//! happens above this layer, so a transport is free to chop the stream into
//! arbitrary chunks. All transport errors are terminal; there is no
//! reconnection, the radio protocol above is the reliability layer.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use log::debug;
use thiserror::Error;

/// How long `recv` waits before reporting that nothing is available. This is
/// the building block for all higher-level timeouts, which are expressed as
/// retry budgets on top of it.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// A connection-oriented byte stream to one node.
pub trait Transport: Send {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Returns the bytes available within [`RECV_TIMEOUT`], which may be an
    /// empty buffer. An error is terminal.
    fn recv(&mut self) -> Result<Vec<u8>, TransportError>;
}

/// TCP adapter, for serial-over-TCP bridges (testbed gateways and the like).
pub struct TcpTransport {
    peer: String,
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(addr: &str) -> io::Result<TcpTransport> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(RECV_TIMEOUT))?;
        stream.set_nodelay(true)?;
        Ok(TcpTransport {
            peer: addr.to_string(),
            stream,
        })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes).map_err(|err| match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => TransportError::Closed,
            _ => TransportError::Io(err),
        })
    }

    fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut buf = [0u8; 1024];
        match self.stream.read(&mut buf) {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                debug!("recv from {} timed out", self.peer);
                Ok(Vec::new())
            }
            Err(err) => match err.kind() {
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted => Err(TransportError::Closed),
                _ => Err(TransportError::Io(err)),
            },
        }
    }
}
