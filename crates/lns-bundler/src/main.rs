// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! LNS Function Bundler CLI
//!
//! Configuration tooling and a local multi-gateway simulation.
//!
//! # Usage
//!
//! ```bash
//! # Write a configuration file with every default spelled out
//! lns-bundler gen-config --output bundler.toml
//!
//! # Check a configuration file
//! lns-bundler validate --config bundler.toml
//!
//! # Three gateways hearing 25 uplinks of one device
//! lns-bundler simulate --dev-eui 70B3D57ED0000001 --gateways 3 --frames 25
//! ```

use clap::{Parser, Subcommand};
use lns_bundler::{
    AdrRequest, BundlerConfig, BundlerRequest, BundlerResult, DevEui, FunctionBundler,
    GatewayCommand, GatewayConnectionRegistry, GatewayId, InMemoryStore, StageSet,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing_subscriber::EnvFilter;

/// LoRaWAN Network Server Function Bundler
#[derive(Parser, Debug)]
#[command(name = "lns-bundler")]
#[command(about = "LoRaWAN function bundler - deduplication, ADR and downlink counter arbitration")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "bundler.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Simulate gateways sharing one in-memory store
    Simulate {
        /// Configuration file path (defaults when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Device EUI
        #[arg(long, default_value = "70B3D57ED0000001")]
        dev_eui: String,

        /// Number of gateways hearing the device
        #[arg(long, default_value = "3")]
        gateways: usize,

        /// Number of uplinks
        #[arg(long, default_value = "25")]
        frames: u32,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match args.command {
        Commands::GenConfig { output } => cmd_gen_config(output),
        Commands::Validate { config } => cmd_validate(config),
        Commands::Simulate {
            config,
            dev_eui,
            gateways,
            frames,
        } => cmd_simulate(config, &dev_eui, gateways, frames).await,
    }
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = BundlerConfig {
        name: "example-bundler".into(),
        ..Default::default()
    };

    // Add comments
    let content = format!(
        r#"# LNS Function Bundler Configuration
# Generated by lns-bundler gen-config

{}
"#,
        config.to_toml_string()?
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match BundlerConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Bundler: {}", config.name);
            println!("Request timeout: {} ms", config.request_timeout_ms);
            println!(
                "TTLs: ownership {}s, fcnt down {}s, adr {}s, preferred gateway {}s",
                config.store.ownership_ttl_secs,
                config.store.fcnt_down_ttl_secs,
                config.store.adr_ttl_secs,
                config.store.preferred_gateway_ttl_secs
            );
            println!("ADR history: {} frames", config.adr.frame_count_capture_count);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

async fn cmd_simulate(
    config_path: Option<PathBuf>,
    dev_eui: &str,
    gateways: usize,
    frames: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config_path {
        Some(path) => BundlerConfig::from_file(path)?,
        None => BundlerConfig::default(),
    };
    let dev_eui: DevEui = dev_eui.parse()?;
    if gateways == 0 {
        return Err("--gateways must be at least 1".into());
    }

    let store = Arc::new(InMemoryStore::new());
    let shutdown = Arc::new(Notify::new());
    let sweeper = config
        .store
        .sweep_interval()
        .map(|interval| store.spawn_sweeper(interval, shutdown.clone()));

    let registry = Arc::new(GatewayConnectionRegistry::new());
    let mut gateway_ids = Vec::with_capacity(gateways);
    for i in 0..gateways {
        let id = GatewayId::new(format!("gw-{}", i))?;
        let (tx, mut rx) = mpsc::channel(16);
        registry.register(id.clone(), tx);

        let name = id.clone();
        tokio::spawn(async move {
            while let Some(GatewayCommand::CloseConnection(req)) = rx.recv().await {
                println!(
                    "  [{}] close connection for {} (fcnt up {})",
                    name, req.dev_eui, req.fcnt_up
                );
            }
        });
        gateway_ids.push(id);
    }

    let bundler = Arc::new(FunctionBundler::with_standard_strategy(
        &config,
        store.clone(),
        registry.clone(),
    ));

    println!("LNS Function Bundler v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!(
        "Device {} heard by {} gateways, {} uplinks",
        dev_eui, gateways, frames
    );
    println!();

    let mut fcnt_down = 0u32;
    let mut data_rate = 0u8;
    for fcnt_up in 1..=frames {
        let mut handles = Vec::with_capacity(gateways);
        for (i, id) in gateway_ids.iter().enumerate() {
            let bundler = bundler.clone();
            let request = simulated_request(id.clone(), i, fcnt_up, fcnt_down, data_rate);
            handles.push(tokio::spawn(async move {
                let result = bundler.execute(dev_eui, &request).await;
                (request.gateway_id, result)
            }));
        }

        for handle in handles {
            let (id, result) = handle.await?;
            let result = result?;
            if let Some(next) = result.next_fcnt_down {
                fcnt_down = fcnt_down.max(next);
            }
            if let Some(rec) = result
                .adr
                .as_ref()
                .filter(|adr| adr.can_confirm_to_device)
                .and_then(|adr| adr.recommendation())
            {
                data_rate = rec.data_rate;
            }
            print_outcome(fcnt_up, &id, &result);
        }
    }

    // Let pending close notifications drain
    tokio::task::yield_now().await;

    let stats = bundler.stats();
    println!();
    println!("--- Bundler Statistics ---");
    println!("  requests:            {}", stats.requests);
    println!("  duplicates:          {}", stats.duplicates);
    println!("  ownership transfers: {}", stats.ownership_transfers);
    println!("  stage failures:      {}", stats.stage_failures);
    println!("  deadline exceeded:   {}", stats.deadline_exceeded);
    println!("  store entries:       {}", store.len());

    shutdown.notify_one();
    if let Some(sweeper) = sweeper {
        sweeper.await?;
    }
    Ok(())
}

/// Gateway `index` hears the device a little worse than gateway `index - 1`,
/// with some frame-to-frame jitter so ownership moves around.
fn simulated_request(
    gateway: GatewayId,
    index: usize,
    fcnt_up: u32,
    fcnt_down: u32,
    data_rate: u8,
) -> BundlerRequest {
    let jitter = f64::from((fcnt_up % 5 + (index % 5) as u32 * 3) % 5);
    let snr = 8.0 - 2.5 * index as f64 + jitter;
    let rssi = -70.0 - 6.0 * index as f64 + jitter;

    BundlerRequest::new(gateway, fcnt_up, StageSet::all())
        .with_fcnt_down(fcnt_down)
        .with_adr(AdrRequest::new(data_rate, snr))
        .with_radio(rssi, Some(snr))
}

fn print_outcome(fcnt_up: u32, gateway: &GatewayId, result: &BundlerResult) {
    let role = match &result.deduplication {
        Some(d) if d.is_duplicate => format!("duplicate (owner {})", d.owner),
        Some(_) => "owner".to_string(),
        None => "-".to_string(),
    };

    let adr = match &result.adr {
        Some(adr) => match adr.recommendation() {
            Some(rec) => format!(
                "dr {} txpower {} nbrep {}{}",
                rec.data_rate,
                rec.tx_power,
                rec.nb_repetition,
                if adr.can_confirm_to_device {
                    " (confirm)"
                } else {
                    ""
                }
            ),
            None => format!("{} frames", adr.number_of_frames),
        },
        None => "-".to_string(),
    };

    let fcnt_down = result
        .next_fcnt_down
        .map_or_else(|| "-".to_string(), |n| n.to_string());

    println!(
        "fcnt {:>4} {:<8} {:<28} adr: {:<32} fcnt down: {}",
        fcnt_up,
        gateway.as_str(),
        role,
        adr,
        fcnt_down
    );
    for failure in &result.failures {
        println!("    {} failed: {}", failure.stage, failure.error);
    }
}
