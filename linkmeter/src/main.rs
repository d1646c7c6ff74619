// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use log::{info, warn};

use linkmeter::config;
use linkmeter::controller::{self, RunOutcome};
use linkmeter::node::Node;
use linkmeter::sink::Outfile;
use linkmeter::transport::TcpTransport;

#[derive(Debug, Parser)]
#[command(
    about = "Sweeps link-quality measurements across a cluster of \
             IEEE 802.15.4 nodes"
)]
struct Args {
    /// Path to the measurement configuration, in TOML.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where to write the captured records.
    #[arg(short, long, default_value = "output.jsonl.gz")]
    output: PathBuf,

    /// Overwrite the output file if it already exists.
    #[arg(short, long)]
    force: bool,

    /// Only log warnings and errors.
    #[arg(short, long)]
    quiet: bool,

    /// Print a sample configuration file and exit.
    #[arg(long)]
    sample_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter),
    )
    .init();

    if args.sample_config {
        print!("{}", config::SAMPLE);
        return Ok(());
    }
    let Some(config_path) = args.config.as_deref() else {
        bail!("--config is required (or use --sample-config for a template)");
    };
    let config = config::load(config_path)?;

    if args.output.exists() && args.force && !args.quiet {
        print_bold(&format!("{} will be overwritten", args.output.display()));
    }
    let mut outfile = Outfile::new(&args.output, args.force)?;

    if !args.quiet {
        print_bold(&format!(
            "starting linkmeter: {} nodes, {} channels, output {}",
            config.nodes.len(),
            config.measurement.channels.len(),
            args.output.display()
        ));
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            warn!("stop requested; finishing the current measurement first");
            stop.store(true, Ordering::SeqCst);
        })
        .context("could not install the stop handler")?;
    }

    let mut nodes = connect_nodes(&config)?;
    controller::setup_nodes(&mut nodes)?;

    let config_record = serde_json::to_value(&config)?;
    let result = controller::execute_run(
        &mut nodes,
        &config.measurement,
        config_record,
        &mut outfile,
        &stop,
    );
    // the file is closed on every exit path so partial captures stay
    // readable
    let close_result = outfile.close();
    let outcome = result?;
    close_result?;

    if outcome == RunOutcome::Stopped && !args.quiet {
        print_bold("stopped; the capture is complete up to the last measurement");
    }
    info!("done");
    Ok(())
}

fn connect_nodes(config: &config::Config) -> Result<Vec<Node>> {
    let restore = config.firmware.family.uses_flow_control_escapes();
    let burst = config.measurement.burst();
    let mut nodes = Vec::with_capacity(config.nodes.len());
    for node_config in &config.nodes {
        info!("connecting to {} at {}", node_config.id, node_config.addr);
        let transport = TcpTransport::connect(&node_config.addr).with_context(|| {
            format!(
                "could not connect to {} at {}",
                node_config.id, node_config.addr
            )
        })?;
        nodes.push(Node::new(
            node_config.id.clone(),
            Box::new(transport),
            restore,
            burst,
        ));
    }
    Ok(nodes)
}

fn print_bold(message: &str) {
    println!("{}", message.bold());
}
