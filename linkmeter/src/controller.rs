// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The measurement schedule.
//!
//! For every transaction, channel, and choice of transmitter: check that
//! every node is idle, start all other nodes listening, run the burst on the
//! transmitter, stop the listeners, and persist one `tx` record plus one
//! `rx` record per receiver. Each fan-out phase runs one thread per node and
//! joins all of them before looking at any result, so a failing node never
//! leaves a sibling operation detached. A stop request is honored between
//! measurements only; an in-flight measurement always completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result};
use chrono::Local;
use log::{error, info};
use node_messages::{MacAddr, NodeStatus};
use serde_json::json;

use crate::config::MeasurementConfig;
use crate::node::{Node, NodeError};
use crate::progress::Progress;
use crate::sink::Outfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Stopped,
}

/// Brings every node to IDLE, in parallel, and verifies they all got there.
pub fn setup_nodes(nodes: &mut [Node]) -> Result<()> {
    info!("setting up {} nodes", nodes.len());
    let results = fan_out(nodes.iter_mut(), |node| node.setup());
    collect(results).context("node setup failed")?;
    all_idle(nodes)
}

/// Runs the whole measurement schedule against an already validated output
/// file: opens it, writes the leading `config` and `start_time` records,
/// sweeps the grid, and, unless a fatal error cut the run short, ends the
/// capture with `node_info` records and `end_time`. The caller closes the
/// file either way, so partial output survives an abort.
pub fn execute_run(
    nodes: &mut [Node],
    measurement: &MeasurementConfig,
    config_record: serde_json::Value,
    outfile: &mut Outfile,
    stop: &AtomicBool,
) -> Result<RunOutcome> {
    outfile.open()?;
    outfile.write("config", config_record)?;
    outfile.write("start_time", json!({ "timestamp": Local::now().to_rfc3339() }))?;

    let total = measurement.transactions().map(|transactions| {
        u64::from(transactions)
            * measurement.channels.len() as u64
            * nodes.len() as u64
    });
    let mut controller = Controller {
        nodes,
        measurement,
        outfile,
        stop,
        progress: Progress::new(total),
    };
    let outcome = controller.run()?;

    for (idx, node) in controller.nodes.iter().enumerate() {
        controller.outfile.write(
            "node_info",
            json!({
                "node_idx": idx,
                "node_id": node.id(),
                "mac_addr": node.mac_addr().to_string(),
            }),
        )?;
    }
    controller
        .outfile
        .write("end_time", json!({ "timestamp": Local::now().to_rfc3339() }))?;
    controller.outfile.flush()?;
    Ok(outcome)
}

struct Controller<'run> {
    nodes: &'run mut [Node],
    measurement: &'run MeasurementConfig,
    outfile: &'run mut Outfile,
    stop: &'run AtomicBool,
    progress: Progress,
}

impl Controller<'_> {
    fn run(&mut self) -> Result<RunOutcome> {
        let mut trans_ctr: u32 = 0;
        loop {
            if let Some(limit) = self.measurement.transactions() {
                if trans_ctr >= limit {
                    return Ok(RunOutcome::Completed);
                }
            }
            let measurement = self.measurement;
            for &channel in &measurement.channels {
                for tx_idx in 0..self.nodes.len() {
                    if self.stop.load(Ordering::SeqCst) {
                        info!(
                            "stop requested; ending the run after {} measurements",
                            self.progress.completed()
                        );
                        return Ok(RunOutcome::Stopped);
                    }
                    self.run_measurement(trans_ctr, channel, tx_idx)?;
                }
            }
            trans_ctr += 1;
        }
    }

    fn run_measurement(
        &mut self,
        trans_ctr: u32,
        channel: u8,
        tx_idx: usize,
    ) -> Result<()> {
        let num_nodes = self.nodes.len();
        self.progress.begin(trans_ctr, channel, tx_idx, num_nodes);
        let started_at = Local::now();
        // the counter is 16 bits on the wire; unbounded runs wrap it
        let wire_ctr = (trans_ctr & 0xffff) as u16;

        all_status_idle(self.nodes)?;
        let tx_mac = self.nodes[tx_idx].mac_addr();

        start_receivers(self.nodes, tx_idx, channel, tx_mac, wire_ctr)?;

        let tx_result = {
            let tx_node = &mut self.nodes[tx_idx];
            tx_node
                .start_tx(channel, wire_ctr)
                .and_then(|()| tx_node.wait_tx_done())
        };
        // receivers are stopped whether or not the burst went well; a
        // radio must never be left in RX across measurements
        let stop_result = stop_receivers(self.nodes, tx_idx);
        tx_result?;
        stop_result?;

        self.outfile.write(
            "tx",
            json!({
                "datetime": started_at.to_rfc3339(),
                "trans_ctr": trans_ctr,
                "channel": channel,
                "mac_addr": tx_mac.to_string(),
            }),
        )?;
        for (idx, node) in self.nodes.iter().enumerate() {
            if idx == tx_idx {
                continue;
            }
            self.outfile.write(
                "rx",
                json!({
                    "mac_addr": node.mac_addr().to_string(),
                    "rssi_records": node.rssi_records(),
                }),
            )?;
        }
        self.outfile.flush()?;

        self.progress.complete(trans_ctr, channel, tx_idx, num_nodes);
        Ok(())
    }
}

/// Polls every node's status in parallel and requires IDLE across the board.
fn all_status_idle(nodes: &mut [Node]) -> Result<()> {
    let results = fan_out(nodes.iter_mut(), |node| {
        node.update_status().map(|_| ())
    });
    collect(results).context("pre-measurement status check failed")?;
    all_idle(nodes)
}

fn all_idle(nodes: &[Node]) -> Result<()> {
    for node in nodes {
        let status = node.status();
        if status != NodeStatus::Idle {
            return Err(NodeError::StatusInvariant {
                node: node.id().to_string(),
                status,
                expected: NodeStatus::Idle,
            }
            .into());
        }
    }
    Ok(())
}

fn start_receivers(
    nodes: &mut [Node],
    tx_idx: usize,
    channel: u8,
    tx_mac: MacAddr,
    trans_ctr: u16,
) -> Result<()> {
    let results = for_each_receiver(nodes, tx_idx, |node| {
        node.start_rx(channel, tx_mac, trans_ctr)
    });
    if let Err(err) = collect(results) {
        // don't leave the receive loops that did start running
        abort_receivers(nodes, tx_idx);
        return Err(err);
    }
    Ok(())
}

fn stop_receivers(nodes: &mut [Node], tx_idx: usize) -> Result<()> {
    let results = for_each_receiver(nodes, tx_idx, |node| node.stop_rx());
    collect(results)
}

/// Best-effort teardown after a partial failure; errors are logged, not
/// surfaced, because the caller already has a better one to report.
fn abort_receivers(nodes: &mut [Node], tx_idx: usize) {
    let results = for_each_receiver(nodes, tx_idx, |node| {
        if node.rx_active() {
            node.stop_rx()
        } else {
            Ok(())
        }
    });
    for (_, result) in results {
        if let Err(err) = result {
            error!("while aborting RX: {err}");
        }
    }
}

/// Runs `op` on every node except the transmitter, one thread per node, and
/// returns every result.
fn for_each_receiver<F>(
    nodes: &mut [Node],
    tx_idx: usize,
    op: F,
) -> Vec<(String, Result<(), NodeError>)>
where
    F: Fn(&mut Node) -> Result<(), NodeError> + Sync,
{
    let (before, rest) = nodes.split_at_mut(tx_idx);
    let (_tx_node, after) = rest.split_first_mut().expect("tx index in range");
    fan_out(before.iter_mut().chain(after.iter_mut()), op)
}

/// Fan-out/fan-in: one thread per node, all joined before any result is
/// inspected.
fn fan_out<'nodes, F>(
    nodes: impl Iterator<Item = &'nodes mut Node>,
    op: F,
) -> Vec<(String, Result<(), NodeError>)>
where
    F: Fn(&mut Node) -> Result<(), NodeError> + Sync,
{
    thread::scope(|scope| {
        let op = &op;
        let handles: Vec<_> = nodes
            .map(|node| {
                scope.spawn(move || {
                    let id = node.id().to_string();
                    let result = op(node);
                    (id, result)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("node worker panicked"))
            .collect()
    })
}

/// Logs every failure and surfaces the first one.
fn collect(results: Vec<(String, Result<(), NodeError>)>) -> Result<()> {
    let mut first: Option<NodeError> = None;
    for (_, result) in results {
        if let Err(err) = result {
            error!("{err}");
            if first.is_none() {
                first = Some(err);
            }
        }
    }
    match first {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
