// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-node protocol engine.
//!
//! Each node is driven through a small state machine (UNKNOWN, IDLE, TX,
//! TXDONE, RX, STOPPING_RX) by request/response exchanges that have to
//! tolerate an unreliable link: responses get dropped, arrive late, arrive
//! twice, and interleave with asynchronous indications. The engine owns the
//! message stream except while a measurement's receive loop is running, in
//! which case the loop thread owns it and hands it back on join. The status
//! field is the only datum shared between the command thread and the receive
//! loop.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};
use node_messages::{
    DecodeError, MacAddr, Message, MsgKind, NodeStatus, Request, RxFlags,
    TxParams,
};
use thiserror::Error;

use crate::config::BurstConfig;
use crate::stream::MsgStream;
use crate::transport::{Transport, TransportError};

/// How many times a request is retransmitted before giving up.
pub const MAX_REQUEST_RETRIES: usize = 3;

/// Per-burst RSSI values, indexed by packet counter. `None` is a packet that
/// never arrived.
pub type RssiRecords = Vec<Option<i8>>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node {node} doesn't respond to {request}")]
    RequestTimeout { node: String, request: MsgKind },
    #[error("unexpected {kind} from node {node}")]
    UnexpectedMessage { node: String, kind: MsgKind },
    #[error("malformed message from node {node}")]
    Decode {
        node: String,
        #[source]
        source: DecodeError,
    },
    #[error("node {node} is {status}, expected {expected}")]
    StatusInvariant {
        node: String,
        status: NodeStatus,
        expected: NodeStatus,
    },
    #[error("lost connection to node {node}")]
    TransportClosed {
        node: String,
        #[source]
        source: TransportError,
    },
    #[error("node {node} delivered pkctr {pkctr} after {prev_pkctr}")]
    OutOfOrder {
        node: String,
        pkctr: u16,
        prev_pkctr: i32,
    },
    #[error("node {node} reported pkctr {pkctr} beyond the burst size")]
    RecordOutOfRange { node: String, pkctr: u16 },
    #[error("receive loop for node {node} panicked")]
    ReceiveLoopPanicked { node: String },
}

/// What a node is currently transmitting to or listening for.
#[derive(Debug, Clone, Copy)]
struct MeasurementContext {
    channel: u8,
    trans_ctr: u16,
    peer_mac: MacAddr,
}

/// What the receive loop hands back when it exits.
struct RxLoopOutcome {
    stream: MsgStream,
    records: RssiRecords,
}

pub struct Node {
    id: String,
    mac_addr: Option<MacAddr>,
    burst: BurstConfig,
    status: Arc<Mutex<NodeStatus>>,
    /// `None` exactly while the receive loop owns the stream.
    stream: Option<MsgStream>,
    rx_loop: Option<JoinHandle<Result<RxLoopOutcome, NodeError>>>,
    rssi_records: RssiRecords,
    context: Option<MeasurementContext>,
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        transport: Box<dyn Transport>,
        restore_flow_escapes: bool,
        burst: BurstConfig,
    ) -> Node {
        let id = id.into();
        let stream = MsgStream::new(id.clone(), transport, restore_flow_escapes);
        let records = vec![None; usize::from(burst.tx_num_per_transaction)];
        Node {
            id,
            mac_addr: None,
            burst,
            status: Arc::new(Mutex::new(NodeStatus::Unknown)),
            stream: Some(stream),
            rx_loop: None,
            rssi_records: records,
            context: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The node's EUI-64, learned from the first `RESP_ST` during setup.
    pub fn mac_addr(&self) -> MacAddr {
        self.mac_addr.expect("mac address is learned during setup")
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, status: NodeStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// RSSI records of the most recently completed RX phase.
    pub fn rssi_records(&self) -> &[Option<i8>] {
        &self.rssi_records
    }

    /// Whether a receive loop is currently running.
    pub fn rx_active(&self) -> bool {
        self.rx_loop.is_some()
    }

    /// Brings a freshly attached node from UNKNOWN to IDLE: drain a possible
    /// boot indication, learn the MAC, and force IDLE if the node is mid-
    /// measurement from an earlier run.
    pub fn setup(&mut self) -> Result<(), NodeError> {
        self.wait_ind_up()?;
        let (status, mac_addr) = self.request_status()?;
        self.mac_addr = Some(mac_addr);
        if status == NodeStatus::Idle {
            self.set_status(NodeStatus::Idle);
        } else {
            self.request_idle()?;
        }
        Ok(())
    }

    /// Asks for the node's status and identity. Does not change the cached
    /// status; this is an observation, not a transition.
    pub fn request_status(&mut self) -> Result<(NodeStatus, MacAddr), NodeError> {
        self.issue(Request::Status, |msg| match *msg {
            Message::RespStatus {
                status, mac_addr, ..
            } => Some((status, mac_addr)),
            _ => None,
        })
    }

    /// Forces the node to IDLE.
    pub fn request_idle(&mut self) -> Result<(), NodeError> {
        self.issue(Request::Idle, |msg| {
            matches!(msg, Message::RespIdle).then_some(())
        })?;
        self.set_status(NodeStatus::Idle);
        Ok(())
    }

    /// `request_status` plus adoption of the observed status.
    pub fn update_status(&mut self) -> Result<NodeStatus, NodeError> {
        let (status, _) = self.request_status()?;
        self.set_status(status);
        Ok(status)
    }

    /// Performs a single read hoping for the boot indication. Its absence is
    /// normal: the node may have booted before we attached to its stream.
    pub fn wait_ind_up(&mut self) -> Result<(), NodeError> {
        info!("wait for IND_UP from {}", self.id);
        let raw = self.recv_msg()?;
        if raw.first() != Some(&(MsgKind::IndUp as u8)) {
            info!("no IND_UP from {}", self.id);
        }
        Ok(())
    }

    /// Starts a TX burst.
    ///
    /// A burst, once started, must be allowed to complete, and the host may
    /// have missed the acknowledgment. So `REQ_TX` is never blindly
    /// retransmitted: on silence the node is probed with `REQ_ST`, and a
    /// delayed `RESP_TX`, an `IND_TXDONE`, or a `RESP_ST` reporting TX all
    /// prove the burst is (or was) running. Only a probe showing the node
    /// still idle earns another `REQ_TX`.
    pub fn start_tx(&mut self, channel: u8, trans_ctr: u16) -> Result<(), NodeError> {
        assert!(self.context.is_none(), "measurement already in progress");
        self.context = Some(MeasurementContext {
            channel,
            trans_ctr,
            peer_mac: self.mac_addr(),
        });
        let request = self.tx_request();

        let mut attempts = 0;
        loop {
            if attempts > MAX_REQUEST_RETRIES {
                error!("node {} doesn't respond to REQ_TX", self.id);
                return Err(NodeError::RequestTimeout {
                    node: self.id.clone(),
                    request: MsgKind::ReqTx,
                });
            }
            if attempts > 0 {
                info!("retry REQ_TX to {}", self.id);
            }
            let first = self.issue_once(request, accept_tx_progress)?;
            if let Some(TxProgress::Acked) = first {
                break;
            }
            match self.issue(Request::Status, accept_tx_progress)? {
                TxProgress::Acked | TxProgress::Done => break,
                TxProgress::Observed(NodeStatus::Tx) => break,
                TxProgress::Observed(_) => attempts += 1,
            }
        }
        self.set_status(NodeStatus::Tx);
        Ok(())
    }

    /// Waits out the burst, consumes `IND_TXDONE`, and returns the node to
    /// IDLE. A lost indication is tolerated; `request_idle` converges the
    /// state either way.
    pub fn wait_tx_done(&mut self) -> Result<(), NodeError> {
        info!("wait for IND_TXDONE from {}", self.id);
        // the burst cannot finish sooner than this
        let burst = Duration::from_millis(
            u64::from(self.burst.tx_num_per_transaction)
                * u64::from(self.burst.tx_interval_ms),
        );
        thread::sleep(burst);

        loop {
            let raw = self.recv_msg()?;
            if raw.is_empty() {
                error!("IND_TXDONE from {} may be dropped", self.id);
                break;
            }
            match self.decode(&raw)? {
                Message::IndTxDone => break,
                // stale reply to a status probe sent by start_tx
                Message::RespStatus { .. } => {
                    info!("ignore RESP_ST from {}", self.id)
                }
                msg => {
                    error!("unexpected {} from {}", msg.kind(), self.id);
                    return Err(NodeError::UnexpectedMessage {
                        node: self.id.clone(),
                        kind: msg.kind(),
                    });
                }
            }
        }

        self.request_idle()?;
        self.context = None;
        Ok(())
    }

    /// Puts the node into RX for the given transmitter and spawns the
    /// receive loop that records incoming `IND_RX`.
    pub fn start_rx(
        &mut self,
        channel: u8,
        src_mac: MacAddr,
        trans_ctr: u16,
    ) -> Result<(), NodeError> {
        assert!(self.context.is_none(), "measurement already in progress");
        self.context = Some(MeasurementContext {
            channel,
            trans_ctr,
            peer_mac: src_mac,
        });
        let request = self.rx_request();
        self.issue(request, |msg| {
            matches!(msg, Message::RespRx).then_some(())
        })?;
        self.set_status(NodeStatus::Rx);

        let stream = self
            .stream
            .take()
            .expect("stream is owned by the receive loop");
        let status = Arc::clone(&self.status);
        let records = vec![None; usize::from(self.burst.tx_num_per_transaction)];
        let expected_len = self.burst.tx_len;
        let id = self.id.clone();
        self.rx_loop = Some(thread::spawn(move || {
            receive_loop(id, stream, status, records, expected_len)
        }));
        Ok(())
    }

    /// Stops the receive loop cooperatively, reclaims the stream and the
    /// records, and returns the node to IDLE.
    pub fn stop_rx(&mut self) -> Result<(), NodeError> {
        self.set_status(NodeStatus::StoppingRx);
        let handle = self
            .rx_loop
            .take()
            .expect("stop_rx without an active receive loop");
        let outcome = handle.join().map_err(|_| NodeError::ReceiveLoopPanicked {
            node: self.id.clone(),
        })??;
        self.stream = Some(outcome.stream);
        self.rssi_records = outcome.records;

        self.request_idle()?;
        let status = self.status();
        if status != NodeStatus::Idle {
            return Err(NodeError::StatusInvariant {
                node: self.id.clone(),
                status,
                expected: NodeStatus::Idle,
            });
        }
        self.context = None;
        Ok(())
    }

    fn tx_request(&self) -> Request {
        let ctx = self.context.expect("context is set before building REQ_TX");
        Request::StartTx(TxParams {
            channel: ctx.channel,
            power_dbm: self.burst.tx_power_dbm,
            trans_ctr: ctx.trans_ctr,
            num_packets: self.burst.tx_num_per_transaction,
            ifdur_ms: self.burst.tx_interval_ms,
            packet_len: self.burst.tx_len,
            fill_byte: self.burst.tx_fill_byte,
        })
    }

    fn rx_request(&self) -> Request {
        let ctx = self.context.expect("context is set before building REQ_RX");
        Request::StartRx {
            channel: ctx.channel,
            src_mac: ctx.peer_mac,
            trans_ctr: ctx.trans_ctr,
            packet_len: self.burst.tx_len,
            fill_byte: self.burst.tx_fill_byte,
        }
    }

    /// Sends a request and drains replies through `accept` until it claims
    /// one; everything it declines is logged and skipped. Silence triggers a
    /// retransmission, up to the retry budget.
    fn issue<T>(
        &mut self,
        request: Request,
        accept: impl FnMut(&Message) -> Option<T>,
    ) -> Result<T, NodeError> {
        let value = self.issue_inner(request, true, accept)?;
        Ok(value.expect("a retrying issue either yields a value or fails"))
    }

    /// Like [`Node::issue`] but gives up silently after one unanswered send,
    /// leaving the next step to the caller.
    fn issue_once<T>(
        &mut self,
        request: Request,
        accept: impl FnMut(&Message) -> Option<T>,
    ) -> Result<Option<T>, NodeError> {
        self.issue_inner(request, false, accept)
    }

    fn issue_inner<T>(
        &mut self,
        request: Request,
        retry: bool,
        mut accept: impl FnMut(&Message) -> Option<T>,
    ) -> Result<Option<T>, NodeError> {
        let mut attempts = 0;
        loop {
            if attempts > 0 {
                if attempts > MAX_REQUEST_RETRIES {
                    error!(
                        "node {} doesn't respond to {}",
                        self.id,
                        request.kind()
                    );
                    return Err(NodeError::RequestTimeout {
                        node: self.id.clone(),
                        request: request.kind(),
                    });
                }
                info!("retry {} to {}", request.kind(), self.id);
            }
            self.send(&request)?;
            let mut raw = self.recv_msg()?;
            while !raw.is_empty() {
                let msg = self.decode(&raw)?;
                if let Some(value) = accept(&msg) {
                    return Ok(Some(value));
                }
                info!("ignore {} from {}", msg.kind(), self.id);
                raw = self.recv_msg()?;
            }
            if !retry {
                return Ok(None);
            }
            attempts += 1;
        }
    }

    fn send(&mut self, request: &Request) -> Result<(), NodeError> {
        match self.stream_mut().send_request(request) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.transport_lost(err)),
        }
    }

    fn recv_msg(&mut self) -> Result<Vec<u8>, NodeError> {
        match self.stream_mut().recv_msg() {
            Ok(raw) => Ok(raw),
            Err(err) => Err(self.transport_lost(err)),
        }
    }

    fn decode(&self, raw: &[u8]) -> Result<Message, NodeError> {
        Message::decode(raw).map_err(|err| {
            error!("protocol violation from {}: {err}", self.id);
            NodeError::Decode {
                node: self.id.clone(),
                source: err,
            }
        })
    }

    fn transport_lost(&mut self, err: TransportError) -> NodeError {
        error!("connection to {} is lost: {err}", self.id);
        self.set_status(NodeStatus::Unknown);
        NodeError::TransportClosed {
            node: self.id.clone(),
            source: err,
        }
    }

    fn stream_mut(&mut self) -> &mut MsgStream {
        self.stream
            .as_mut()
            .expect("stream is owned by the receive loop")
    }

    #[cfg(test)]
    pub(crate) fn leftover(&self) -> &[u8] {
        self.stream.as_ref().map(MsgStream::leftover).unwrap_or(&[])
    }

    #[cfg(test)]
    pub(crate) fn set_mac_for_tests(&mut self, mac: MacAddr) {
        self.mac_addr = Some(mac);
    }
}

/// Evidence that a requested burst is running or already ran.
enum TxProgress {
    Acked,
    Done,
    Observed(NodeStatus),
}

fn accept_tx_progress(msg: &Message) -> Option<TxProgress> {
    match *msg {
        Message::RespTx => Some(TxProgress::Acked),
        Message::IndTxDone => Some(TxProgress::Done),
        Message::RespStatus { status, .. } => Some(TxProgress::Observed(status)),
        _ => None,
    }
}

/// Body of the per-measurement receive thread. Runs while the shared status
/// stays RX; the controller stops it by flipping the status to STOPPING_RX,
/// and the node itself ends it by acknowledging IDLE.
fn receive_loop(
    id: String,
    mut stream: MsgStream,
    status: Arc<Mutex<NodeStatus>>,
    mut records: RssiRecords,
    expected_len: u8,
) -> Result<RxLoopOutcome, NodeError> {
    let mut prev_pkctr: i32 = -1;
    while *status.lock().unwrap() == NodeStatus::Rx {
        let mut raw = rx_recv(&id, &mut stream, &status)?;
        while !raw.is_empty() {
            let msg = Message::decode(&raw).map_err(|err| {
                error!("protocol violation from {id}: {err}");
                NodeError::Decode {
                    node: id.clone(),
                    source: err,
                }
            })?;
            match msg {
                Message::IndRx {
                    length,
                    rssi,
                    flags,
                    pkctr,
                } => {
                    debug!("recv IND_RX from {id}: pkctr {pkctr}, rssi {rssi}");
                    if flags != RxFlags::EXPECTED {
                        error!(
                            "discarding IND_RX from {id} with flags {:#04x}",
                            flags.bits()
                        );
                    } else if length != expected_len {
                        error!(
                            "discarding IND_RX from {id} with length {length}, \
                             expected {expected_len}"
                        );
                    } else {
                        prev_pkctr = store_rx_record(
                            &id,
                            &mut records,
                            rssi,
                            pkctr,
                            prev_pkctr,
                        )?;
                    }
                }
                // stale response to a retried REQ_RX
                Message::RespRx => info!("ignore RESP_RX from {id}"),
                // the node ended the measurement on its own
                Message::RespIdle => {
                    *status.lock().unwrap() = NodeStatus::Idle;
                }
                msg => {
                    error!("unexpected {} from {id} during RX", msg.kind());
                    return Err(NodeError::UnexpectedMessage {
                        node: id,
                        kind: msg.kind(),
                    });
                }
            }
            raw = rx_recv(&id, &mut stream, &status)?;
        }
    }
    Ok(RxLoopOutcome { stream, records })
}

fn rx_recv(
    id: &str,
    stream: &mut MsgStream,
    status: &Mutex<NodeStatus>,
) -> Result<Vec<u8>, NodeError> {
    stream.recv_msg().map_err(|err| {
        error!("connection to {id} is lost: {err}");
        *status.lock().unwrap() = NodeStatus::Unknown;
        NodeError::TransportClosed {
            node: id.to_string(),
            source: err,
        }
    })
}

/// Applies one `IND_RX` to the record vector: duplicates are dropped,
/// forward progress is recorded, regression is a protocol violation. Returns
/// the new high-water packet counter.
fn store_rx_record(
    id: &str,
    records: &mut RssiRecords,
    rssi: i8,
    pkctr: u16,
    prev_pkctr: i32,
) -> Result<i32, NodeError> {
    let pkctr_wide = i32::from(pkctr);
    if pkctr_wide == prev_pkctr {
        error!("node {id} received a duplicate packet (pkctr {pkctr})");
        Ok(prev_pkctr)
    } else if pkctr_wide > prev_pkctr {
        match records.get_mut(usize::from(pkctr)) {
            Some(slot) => {
                *slot = Some(rssi);
                Ok(pkctr_wide)
            }
            None => {
                error!("node {id} reported pkctr {pkctr} beyond the burst size");
                Err(NodeError::RecordOutOfRange {
                    node: id.to_string(),
                    pkctr,
                })
            }
        }
    } else {
        error!("node {id} delivered pkctr {pkctr} after {prev_pkctr}");
        Err(NodeError::OutOfOrder {
            node: id.to_string(),
            pkctr,
            prev_pkctr,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::transport::testutil::{mock, DeadTransport, ScriptedTransport};

    const TEST_MAC: MacAddr = MacAddr(0x0201_0304_0506_0708);

    fn burst() -> BurstConfig {
        BurstConfig {
            tx_power_dbm: 0,
            tx_len: 100,
            tx_num_per_transaction: 5,
            tx_interval_ms: 1,
            tx_fill_byte: 0x5a,
        }
    }

    fn test_node(transport: impl Transport + 'static) -> Node {
        let mut node = Node::new("n1", Box::new(transport), false, burst());
        node.set_mac_for_tests(TEST_MAC);
        node
    }

    fn frame(msg: &[u8]) -> Vec<u8> {
        hdlc::hdlcify(msg).unwrap()
    }

    fn resp_st(status: NodeStatus) -> Vec<u8> {
        let wire = match status {
            NodeStatus::Idle => 1,
            NodeStatus::TxDone => 2,
            NodeStatus::Tx => 3,
            NodeStatus::Rx => 4,
            _ => panic!("not a wire status"),
        };
        let mut msg = vec![MsgKind::RespStatus as u8, wire, 0xab, 0xcd];
        msg.extend_from_slice(&TEST_MAC.0.to_be_bytes());
        msg
    }

    fn ind_rx(pkctr: u16, rssi: i8) -> Vec<u8> {
        let mut msg = vec![MsgKind::IndRx as u8, 100, rssi as u8, 0xc0];
        msg.extend_from_slice(&pkctr.to_be_bytes());
        msg
    }

    fn sent_kinds(frames: &[Vec<u8>]) -> Vec<u8> {
        frames
            .iter()
            .map(|f| hdlc::dehdlcify(f).unwrap()[0])
            .collect()
    }

    #[test]
    fn request_status_returns_status_and_mac() {
        let (transport, state) = mock();
        state
            .lock()
            .unwrap()
            .push_chunk(1, frame(&resp_st(NodeStatus::Idle)));
        let mut node = test_node(transport);

        let (status, mac) = node.request_status().unwrap();
        assert_eq!(status, NodeStatus::Idle);
        assert_eq!(mac, TEST_MAC);

        let sent = state.lock().unwrap().sent.clone();
        assert_eq!(sent_kinds(&sent), [MsgKind::ReqStatus as u8]);
    }

    #[test]
    fn request_status_ignores_ind_up() {
        let (transport, state) = mock();
        let mut chunk = frame(&[MsgKind::IndUp as u8]);
        chunk.extend_from_slice(&frame(&resp_st(NodeStatus::Idle)));
        state.lock().unwrap().push_chunk(1, chunk);
        let mut node = test_node(transport);

        let (status, mac) = node.request_status().unwrap();
        assert_eq!(status, NodeStatus::Idle);
        assert_eq!(mac, TEST_MAC);
    }

    #[test]
    fn request_status_keeps_second_response_in_leftover() {
        let (transport, state) = mock();
        let second = frame(&resp_st(NodeStatus::Idle));
        let mut chunk = frame(&resp_st(NodeStatus::Rx));
        chunk.extend_from_slice(&second);
        state.lock().unwrap().push_chunk(1, chunk);
        let mut node = test_node(transport);

        let (status, _) = node.request_status().unwrap();
        assert_eq!(status, NodeStatus::Rx);
        assert_eq!(node.leftover(), &second[..]);
    }

    #[test]
    fn request_status_retries_once() {
        let (transport, state) = mock();
        // only answered after the second send
        state
            .lock()
            .unwrap()
            .push_chunk(2, frame(&resp_st(NodeStatus::Idle)));
        let mut node = test_node(transport);

        let (status, _) = node.request_status().unwrap();
        assert_eq!(status, NodeStatus::Idle);

        let sent = state.lock().unwrap().sent.clone();
        assert_eq!(
            sent_kinds(&sent),
            [MsgKind::ReqStatus as u8, MsgKind::ReqStatus as u8]
        );
    }

    #[test]
    fn request_status_times_out_after_retry_budget() {
        let (transport, state) = mock();
        let mut node = test_node(transport);

        match node.request_status() {
            Err(NodeError::RequestTimeout { request, .. }) => {
                assert_eq!(request, MsgKind::ReqStatus)
            }
            other => panic!("unexpected {other:?}"),
        }
        let sent = state.lock().unwrap().sent.clone();
        assert_eq!(sent.len(), MAX_REQUEST_RETRIES + 1);
    }

    #[test]
    fn request_idle_sets_status() {
        let (transport, state) = mock();
        state
            .lock()
            .unwrap()
            .push_chunk(1, frame(&[MsgKind::RespIdle as u8]));
        let mut node = test_node(transport);

        node.request_idle().unwrap();
        assert_eq!(node.status(), NodeStatus::Idle);
    }

    #[test]
    fn wait_ind_up_is_fine_either_way() {
        let (transport, state) = mock();
        state
            .lock()
            .unwrap()
            .push_chunk(0, frame(&[MsgKind::IndUp as u8]));
        let mut node = test_node(transport);
        node.wait_ind_up().unwrap();

        // silence is not an error
        let (transport, _state) = mock();
        let mut node = test_node(transport);
        node.wait_ind_up().unwrap();
    }

    #[test]
    fn setup_learns_mac_and_forces_idle() {
        let (transport, state) = mock();
        {
            let mut state = state.lock().unwrap();
            state.push_chunk(1, frame(&resp_st(NodeStatus::Rx)));
            state.push_chunk(2, frame(&[MsgKind::RespIdle as u8]));
        }
        let mut node = Node::new("n1", Box::new(transport), false, burst());

        node.setup().unwrap();
        assert_eq!(node.status(), NodeStatus::Idle);
        assert_eq!(node.mac_addr(), TEST_MAC);

        let sent = state.lock().unwrap().sent.clone();
        assert_eq!(
            sent_kinds(&sent),
            [MsgKind::ReqStatus as u8, MsgKind::ReqIdle as u8]
        );
    }

    #[test]
    fn start_tx_plain_ack() {
        let (transport, state) = mock();
        state
            .lock()
            .unwrap()
            .push_chunk(1, frame(&[MsgKind::RespTx as u8]));
        let mut node = test_node(transport);

        node.start_tx(11, 100).unwrap();
        assert_eq!(node.status(), NodeStatus::Tx);

        let sent = state.lock().unwrap().sent.clone();
        assert_eq!(sent_kinds(&sent), [MsgKind::ReqTx as u8]);
        // and the request carries the burst parameters
        let req = hdlc::dehdlcify(&sent[0]).unwrap();
        assert_eq!(req, [4, 11, 0, 0x00, 0x64, 0x00, 0x05, 0x00, 0x01, 100, 0x5a]);
    }

    #[test]
    fn start_tx_accepts_ind_txdone_from_probe() {
        // REQ_TX goes unanswered, but the REQ_ST probe reveals the burst
        // already ran; no second REQ_TX may ever be sent.
        let (transport, sent) = ScriptedTransport::new(|call| match call {
            1 => Vec::new(),
            2 => hdlc::hdlcify(&[MsgKind::IndTxDone as u8]).unwrap(),
            _ => Vec::new(),
        });
        let mut node = test_node(transport);

        node.start_tx(11, 100).unwrap();
        assert_eq!(node.status(), NodeStatus::Tx);

        let sent = sent.lock().unwrap().clone();
        assert_eq!(
            sent_kinds(&sent),
            [MsgKind::ReqTx as u8, MsgKind::ReqStatus as u8]
        );
    }

    #[test]
    fn start_tx_accepts_delayed_resp_tx_from_probe() {
        let (transport, sent) = ScriptedTransport::new(|call| match call {
            1 => Vec::new(),
            2 => hdlc::hdlcify(&[MsgKind::RespTx as u8]).unwrap(),
            _ => Vec::new(),
        });
        let mut node = test_node(transport);

        node.start_tx(11, 100).unwrap();
        assert_eq!(node.status(), NodeStatus::Tx);
        let sent = sent.lock().unwrap().clone();
        assert_eq!(
            sent_kinds(&sent),
            [MsgKind::ReqTx as u8, MsgKind::ReqStatus as u8]
        );
    }

    #[test]
    fn start_tx_gives_up_when_node_stays_idle() {
        // every REQ_TX is lost and every probe reports IDLE
        let idle = resp_st(NodeStatus::Idle);
        let (transport, sent) = ScriptedTransport::new(move |call| {
            if call % 2 == 1 {
                Vec::new()
            } else {
                hdlc::hdlcify(&idle).unwrap()
            }
        });
        let mut node = test_node(transport);

        match node.start_tx(11, 100) {
            Err(NodeError::RequestTimeout { request, .. }) => {
                assert_eq!(request, MsgKind::ReqTx)
            }
            other => panic!("unexpected {other:?}"),
        }

        let sent = sent.lock().unwrap().clone();
        let req_tx_count = sent_kinds(&sent)
            .iter()
            .filter(|&&k| k == MsgKind::ReqTx as u8)
            .count();
        assert_eq!(req_tx_count, MAX_REQUEST_RETRIES + 1);
    }

    #[test]
    fn wait_tx_done_tolerates_stale_resp_st() {
        let (transport, state) = mock();
        {
            let mut chunk = frame(&resp_st(NodeStatus::Tx));
            chunk.extend_from_slice(&frame(&[MsgKind::IndTxDone as u8]));
            chunk.extend_from_slice(&frame(&[MsgKind::RespIdle as u8]));
            state.lock().unwrap().push_chunk(0, chunk);
        }
        let mut node = test_node(transport);

        node.wait_tx_done().unwrap();
        assert_eq!(node.status(), NodeStatus::Idle);

        let sent = state.lock().unwrap().sent.clone();
        assert_eq!(sent_kinds(&sent), [MsgKind::ReqIdle as u8]);
    }

    #[test]
    fn wait_tx_done_survives_dropped_indication() {
        // no IND_TXDONE ever arrives; the node still answers REQ_IDLE
        let (transport, state) = mock();
        state
            .lock()
            .unwrap()
            .push_chunk(1, frame(&[MsgKind::RespIdle as u8]));
        let mut node = test_node(transport);

        node.wait_tx_done().unwrap();
        assert_eq!(node.status(), NodeStatus::Idle);
    }

    #[test]
    fn wait_tx_done_fails_when_idle_times_out() {
        let (transport, _state) = mock();
        let mut node = test_node(transport);

        match node.wait_tx_done() {
            Err(NodeError::RequestTimeout { request, .. }) => {
                assert_eq!(request, MsgKind::ReqIdle)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn start_rx_records_and_ignores_duplicates() {
        let (transport, state) = mock();
        {
            let mut state = state.lock().unwrap();
            state.push_chunk(1, frame(&[MsgKind::RespRx as u8]));
            let mut stream_chunk = frame(&ind_rx(0, -50));
            stream_chunk.extend_from_slice(&frame(&ind_rx(1, -51)));
            // duplicate pkctr with a different reading must not overwrite
            stream_chunk.extend_from_slice(&frame(&ind_rx(1, -99)));
            stream_chunk.extend_from_slice(&frame(&ind_rx(3, -53)));
            state.push_chunk(1, stream_chunk);
            // RESP_IDLE only after REQ_IDLE went out
            state.push_chunk(2, frame(&[MsgKind::RespIdle as u8]));
        }
        let mut node = test_node(transport);

        node.start_rx(11, TEST_MAC, 100).unwrap();
        assert_eq!(node.status(), NodeStatus::Rx);
        assert!(node.rx_active());

        // give the receive loop a moment to drain the indications
        thread::sleep(Duration::from_millis(50));

        let stopped_at = Instant::now();
        node.stop_rx().unwrap();
        assert!(stopped_at.elapsed() < Duration::from_secs(1));
        assert_eq!(node.status(), NodeStatus::Idle);
        assert!(!node.rx_active());

        assert_eq!(
            node.rssi_records(),
            [Some(-50), Some(-51), None, Some(-53), None]
        );
    }

    #[test]
    fn receive_loop_rejects_unexpected_kinds() {
        let (transport, state) = mock();
        {
            let mut state = state.lock().unwrap();
            state.push_chunk(1, frame(&[MsgKind::RespRx as u8]));
            state.push_chunk(1, frame(&[MsgKind::IndUp as u8]));
        }
        let mut node = test_node(transport);

        node.start_rx(11, TEST_MAC, 100).unwrap();
        thread::sleep(Duration::from_millis(50));

        match node.stop_rx() {
            Err(NodeError::UnexpectedMessage { kind, .. }) => {
                assert_eq!(kind, MsgKind::IndUp)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn start_rx_times_out_without_ack() {
        let (transport, _state) = mock();
        let mut node = test_node(transport);

        match node.start_rx(11, TEST_MAC, 100) {
            Err(NodeError::RequestTimeout { request, .. }) => {
                assert_eq!(request, MsgKind::ReqRx)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn transport_loss_is_terminal_and_degrades_status() {
        let mut node = test_node(DeadTransport);
        match node.update_status() {
            Err(NodeError::TransportClosed { .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(node.status(), NodeStatus::Unknown);
    }

    #[test]
    fn store_rx_record_rules() {
        let mut records: RssiRecords = vec![None; 5];

        // forward progress
        let prev = store_rx_record("n1", &mut records, -50, 2, -1).unwrap();
        assert_eq!(prev, 2);
        assert_eq!(records[2], Some(-50));

        // duplicate: logged, not overwritten
        let prev = store_rx_record("n1", &mut records, -99, 2, prev).unwrap();
        assert_eq!(prev, 2);
        assert_eq!(records[2], Some(-50));

        // regression is fatal
        match store_rx_record("n1", &mut records, -50, 1, prev) {
            Err(NodeError::OutOfOrder { pkctr, prev_pkctr, .. }) => {
                assert_eq!((pkctr, prev_pkctr), (1, 2));
            }
            other => panic!("unexpected {other:?}"),
        }

        // a counter past the burst size is fatal too
        match store_rx_record("n1", &mut records, -50, 5, 2) {
            Err(NodeError::RecordOutOfRange { pkctr, .. }) => {
                assert_eq!(pkctr, 5)
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
