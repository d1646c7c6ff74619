// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Append-only measurement output: gzip-compressed JSON lines.
//!
//! Every record is one object, `{"data_type": <kind>, "data": <payload>}`.
//! A well-formed capture runs `config`, `start_time`, repeated `tx`/`rx`
//! groups, `node_info` per node, and `end_time`; a capture cut short by a
//! fatal error simply stops after the last flushed measurement.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use serde_json::json;

pub const OUT_FILE_SUFFIX: &str = ".jsonl.gz";

pub struct Outfile {
    path: PathBuf,
    encoder: Option<GzEncoder<File>>,
}

impl Outfile {
    /// Validates the output path without touching the filesystem content:
    /// the suffix must be right, and an existing file is only accepted when
    /// `force` is given. The file itself is created by [`Outfile::open`].
    pub fn new(path: &Path, force: bool) -> Result<Outfile> {
        let name = path.to_string_lossy();
        if !name.ends_with(OUT_FILE_SUFFIX) {
            bail!("output filename must end with {OUT_FILE_SUFFIX}");
        }
        if path.exists() && !force {
            bail!(
                "{} already exists; pass --force to overwrite",
                path.display()
            );
        }
        Ok(Outfile {
            path: path.to_path_buf(),
            encoder: None,
        })
    }

    pub fn open(&mut self) -> Result<()> {
        let file = File::create(&self.path)
            .with_context(|| format!("could not create {}", self.path.display()))?;
        self.encoder = Some(GzEncoder::new(file, Compression::default()));
        info!("outfile {} is opened", self.path.display());
        Ok(())
    }

    pub fn write(&mut self, kind: &str, data: serde_json::Value) -> Result<()> {
        let line = serde_json::to_string(&json!({
            "data_type": kind,
            "data": data,
        }))?;
        let encoder = self.encoder.as_mut().expect("outfile is open");
        writeln!(encoder, "{line}")
            .with_context(|| format!("could not write to {}", self.path.display()))
    }

    pub fn flush(&mut self) -> Result<()> {
        let encoder = self.encoder.as_mut().expect("outfile is open");
        encoder
            .flush()
            .with_context(|| format!("could not flush {}", self.path.display()))
    }

    /// Finishes the gzip stream. Dropping an unfinished encoder would
    /// truncate the trailer, so every exit path must come through here.
    pub fn close(mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.take() {
            encoder
                .finish()
                .with_context(|| format!("could not finish {}", self.path.display()))?;
        }
        Ok(())
    }
}
