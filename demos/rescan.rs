//! Rescan a bitcoind node's chain for payments to the given addresses.
//!
//! cargo run --example rescan -- --datadir ~/.bitcoin --height 800000 --address bc1q...

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::Address;
use chainsync::{
    BitcoindChainClient, ChainClient, ProgressListener, ProgressSnapshot, SyncConfig, WalletSync,
};
use clap::Command;

struct PrintListener;

impl ProgressListener for PrintListener {
    fn on_headers_fetch_progress(&self, snapshot: &ProgressSnapshot) {
        println!(
            "Headers: {}% ({}/{}), {} left",
            snapshot.percent,
            snapshot.current_height,
            snapshot.target_height,
            snapshot.time_remaining_label()
        );
    }

    fn on_rescan_progress(&self, snapshot: &ProgressSnapshot) {
        println!(
            "Rescan: {}% (block {}/{}), {} left",
            snapshot.percent,
            snapshot.current_height,
            snapshot.target_height,
            snapshot.time_remaining_label()
        );
    }

    fn on_address_discovery_progress(&self, snapshot: &ProgressSnapshot) {
        println!("Address discovery: {}%", snapshot.percent);
    }

    fn on_sync_completed(&self) {
        println!("Wallet is in sync with the chain");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let matches = Command::new("rescan")
        .about("Rescan the chain of a bitcoind node for wallet transactions")
        .arg(
            clap::Arg::new("conf")
                .long("conf")
                .value_name("FILE")
                .help("Specify configuration file (default: <datadir>/bitcoin.conf)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            clap::Arg::new("datadir")
                .long("datadir")
                .value_name("DIR")
                .help("bitcoind data directory")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            clap::Arg::new("height")
                .long("height")
                .value_name("HEIGHT")
                .help("Height to start rescanning from")
                .default_value("0")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            clap::Arg::new("address")
                .long("address")
                .value_name("ADDRESS")
                .help("Address to look for, may be repeated")
                .action(clap::ArgAction::Append)
                .required(true)
                .value_parser(clap::value_parser!(String)),
        )
        .get_matches();

    let data_dir = matches
        .get_one::<PathBuf>("datadir")
        .cloned()
        .ok_or("missing --datadir")?;
    let conf_path = matches
        .get_one::<PathBuf>("conf")
        .cloned()
        .unwrap_or_else(|| data_dir.join("bitcoin.conf"));
    let height = matches.get_one::<u32>("height").copied().unwrap_or(0);

    let config = SyncConfig::load(&conf_path, &data_dir)?;
    let mut addrs = HashSet::new();
    for addr in matches.get_many::<String>("address").into_iter().flatten() {
        addrs.insert(Address::from_str(addr)?.require_network(config.network)?);
    }

    let chain = Arc::new(BitcoindChainClient::connect(&config).await?);
    chain.register_address_filter(&addrs).await?;
    let wallet = WalletSync::open(chain);
    wallet.set_progress_listener(Arc::new(PrintListener));

    wallet.start_sync();
    while !wallet.is_synced() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    wallet.rescan_from_height(height).await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                wallet.cancel_rescan();
                println!("Rescan cancelled");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                if !wallet.is_rescanning() {
                    break;
                }
            }
        }
    }

    let progress = wallet.progress();
    println!(
        "Found {} relevant transactions up to block {}",
        progress.relevant_txs, progress.rescan_height
    );
    wallet.close();
    Ok(())
}
