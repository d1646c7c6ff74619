// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Link-quality measurement controller for clusters of IEEE 802.15.4 nodes.
//!
//! For every configured channel and every choice of transmitter, one node
//! sends a burst of packets while every other node records per-packet RSSI.
//! The controller drives each node through its request/response/indication
//! protocol over an unreliable byte stream and appends the results to a
//! gzip-compressed JSONL file.

pub mod config;
pub mod controller;
pub mod node;
pub mod progress;
pub mod sink;
pub mod stream;
pub mod transport;
