//! Loss Simulator
//!
//! Generates an FEC-protected RTP stream, drops packets, and reports what the
//! receive side recovered and what it would NACK.

use anyhow::Context;
use clap::Parser;
use rtp_recovery_cli::{display_report, run, SimConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "loss-sim")]
#[command(about = "RTP loss and FEC recovery simulator", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of media packets
    #[arg(short = 'n', long)]
    packets: Option<u32>,

    /// Media packets per parity packet (1-16)
    #[arg(short, long)]
    group: Option<usize>,

    /// Sequence numbers to drop, comma separated
    #[arg(short, long, value_delimiter = ',')]
    drop: Vec<u16>,

    /// Drop every Nth emitted packet
    #[arg(long)]
    drop_every: Option<u32>,

    /// First sequence number
    #[arg(long)]
    start_seq: Option<u16>,

    /// Carry parity in RFC 2198 redundant packets
    #[arg(long)]
    red: bool,

    /// Write the effective configuration to this file and exit
    #[arg(long)]
    dump_config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => SimConfig::from_file(path)
            .with_context(|| format!("Failed to load config '{}'", path.display()))?,
        None => SimConfig::default(),
    };

    if let Some(packets) = args.packets {
        config.packets = packets;
    }
    if let Some(group) = args.group {
        config.group = group;
    }
    if !args.drop.is_empty() {
        config.drop = args.drop;
    }
    if args.drop_every.is_some() {
        config.drop_every = args.drop_every;
    }
    if let Some(start_seq) = args.start_seq {
        config.start_seq = start_seq;
    }
    config.red |= args.red;

    config.validate()?;

    if let Some(path) = &args.dump_config {
        config
            .to_file(path)
            .with_context(|| format!("Failed to write config '{}'", path.display()))?;
        tracing::info!("Configuration written to {}", path.display());
        return Ok(());
    }

    tracing::info!(
        packets = config.packets,
        group = config.group,
        red = config.red,
        "Starting simulation"
    );

    let report = run(&config)?;
    display_report(&report);

    if report.mismatched > 0 {
        anyhow::bail!("{} recovered packets did not match the originals", report.mismatched);
    }
    Ok(())
}
