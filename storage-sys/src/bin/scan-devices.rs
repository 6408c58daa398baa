// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use storage_sys::discover_from;
use storage_types::bytes_to_pretty;

#[derive(Debug, Parser)]
#[command(name = "scan-devices")]
#[command(about = "Scan the block-device topology from sysfs")]
struct Args {
    #[arg(long, default_value = "/sys/block")]
    sys_block: PathBuf,

    #[arg(long, default_value = "/proc/mdstat")]
    mdstat: PathBuf,

    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mdstat = std::fs::read_to_string(&args.mdstat).unwrap_or_default();
    let devices = discover_from(&args.sys_block, &mdstat)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    println!("{:<16} {:<12} {:>14}  PARENTS", "NAME", "KIND", "SIZE");
    println!("{}", "-".repeat(56));
    for device in &devices {
        let parents = device
            .parents
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<16} {:<12} {:>14}  {}",
            device.name,
            device.kind.tag(),
            bytes_to_pretty(&device.size, false),
            parents
        );
    }
    println!();
    println!("{} devices", devices.len());
    Ok(())
}
