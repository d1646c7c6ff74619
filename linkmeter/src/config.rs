// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Measurement configuration, read from a single TOML file.
//!
//! The whole document is also serialized verbatim into the output file as
//! the leading `config` record, so a capture is self-describing.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// A starting point for a valid configuration, printed by `--sample-config`.
pub const SAMPLE: &str = "\
# linkmeter measurement configuration

[measurement]
# number of sweeps over (channel x tx-node); negative means run until
# interrupted
num_transactions = 10
# IEEE 802.15.4 channels to sweep
channels = [11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26]
tx_power_dbm = 0
# payload length of each probe packet, in bytes
tx_len = 100
# packets per burst
tx_num_per_transaction = 100
# spacing between packets of a burst, in milliseconds
tx_interval_ms = 10
tx_fill_byte = 0x5a

[firmware]
family = \"openwsn\"

# one [[nodes]] block per radio; addr points at its serial-over-TCP bridge
[[nodes]]
id = \"node-00\"
addr = \"192.0.2.10:20000\"

[[nodes]]
id = \"node-01\"
addr = \"192.0.2.11:20000\"
";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub measurement: MeasurementConfig,
    pub firmware: FirmwareConfig,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasurementConfig {
    /// Sweeps over the full (channel, tx-node) grid. Negative runs forever.
    pub num_transactions: i64,
    pub channels: Vec<u8>,
    pub tx_power_dbm: i8,
    pub tx_len: u8,
    pub tx_num_per_transaction: u16,
    pub tx_interval_ms: u16,
    pub tx_fill_byte: u8,
}

impl MeasurementConfig {
    /// `None` means unbounded.
    pub fn transactions(&self) -> Option<u32> {
        u32::try_from(self.num_transactions).ok()
    }

    pub fn burst(&self) -> BurstConfig {
        BurstConfig {
            tx_power_dbm: self.tx_power_dbm,
            tx_len: self.tx_len,
            tx_num_per_transaction: self.tx_num_per_transaction,
            tx_interval_ms: self.tx_interval_ms,
            tx_fill_byte: self.tx_fill_byte,
        }
    }
}

/// The burst parameters every node needs at hand; a plain-data subset of
/// [`MeasurementConfig`].
#[derive(Debug, Clone, Copy)]
pub struct BurstConfig {
    pub tx_power_dbm: i8,
    pub tx_len: u8,
    pub tx_num_per_transaction: u16,
    pub tx_interval_ms: u16,
    pub tx_fill_byte: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirmwareConfig {
    pub family: FirmwareFamily,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareFamily {
    OpenWsn,
}

impl FirmwareFamily {
    /// Whether the firmware's UART driver applies XON/XOFF/ESC substitution
    /// that has to be undone on received bytes.
    pub fn uses_flow_control_escapes(&self) -> bool {
        match self {
            FirmwareFamily::OpenWsn => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub id: String,
    pub addr: String,
}

pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;
    let config: Config = toml::from_str(&text)
        .with_context(|| format!("could not parse {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let m = &config.measurement;
    if m.channels.is_empty() {
        bail!("measurement.channels must not be empty");
    }
    if m.tx_num_per_transaction == 0 {
        bail!("measurement.tx_num_per_transaction must be at least 1");
    }
    if m.tx_len == 0 {
        bail!("measurement.tx_len must be at least 1");
    }
    // the transaction counter is a u16 on the wire
    if m.num_transactions > i64::from(u16::MAX) {
        bail!(
            "measurement.num_transactions must be at most {} (or negative \
             for an unbounded run)",
            u16::MAX
        );
    }
    if config.nodes.len() < 2 {
        bail!("at least two nodes are required, one transmitter and one receiver");
    }
    let mut ids: Vec<&str> = config.nodes.iter().map(|n| n.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.len() != config.nodes.len() {
        bail!("node ids must be unique");
    }
    Ok(())
}
