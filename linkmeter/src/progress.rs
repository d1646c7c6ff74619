// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Progress accounting over the measurement grid.

use log::info;

pub struct Progress {
    completed: u64,
    /// Total number of measurements, unless the run is unbounded.
    total: Option<u64>,
}

impl Progress {
    pub fn new(total: Option<u64>) -> Progress {
        Progress {
            completed: 0,
            total,
        }
    }

    pub fn begin(&self, trans_ctr: u32, channel: u8, tx_pos: usize, num_nodes: usize) {
        info!(
            "beginning of measurement - trans_ctr: {trans_ctr}, channel: \
             {channel}, tx node: {}/{num_nodes}",
            tx_pos + 1
        );
    }

    pub fn complete(&mut self, trans_ctr: u32, channel: u8, tx_pos: usize, num_nodes: usize) {
        self.completed += 1;
        info!(
            "end of measurement - trans_ctr: {trans_ctr}, channel: {channel}, \
             tx node: {}/{num_nodes}",
            tx_pos + 1
        );
        match self.total {
            Some(total) => info!("progress: {}/{total} measurements", self.completed),
            None => info!("progress: {} measurements", self.completed),
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_measurements() {
        let mut progress = Progress::new(Some(4));
        assert_eq!(progress.completed(), 0);
        progress.begin(0, 11, 0, 2);
        progress.complete(0, 11, 0, 2);
        progress.complete(0, 11, 1, 2);
        assert_eq!(progress.completed(), 2);
    }
}
