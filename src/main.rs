//! CLI Entry Point for esp-cam-retriever
//!
//! Provides command-line interface for:
//! - Retrieving all images and performance data from a camera
//! - Reading a single performance record
//! - Listing serial ports
//! - Running the full flow against the simulated camera
//!
//! # Usage
//!
//! ```bash
//! esp-cam-retriever retrieve --port /dev/ttyUSB0 --count 20
//! esp-cam-retriever metrics --port /dev/ttyUSB0
//! esp-cam-retriever ports
//! esp-cam-retriever simulate --count 3 --output /tmp/cam
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use esp_cam_retriever::config::RetrieverConfig;
use esp_cam_retriever::logging::{self, LoggingConfig};
use esp_cam_retriever::mock::SimulatedCamera;
use esp_cam_retriever::session::{RetrievalReport, RetrievalSession, RetrievalStep};
use esp_cam_retriever::transport::{list_ports, SerialTransport};
use esp_cam_retriever::RetrievalClient;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "esp-cam-retriever")]
#[command(about = "Retrieve images and performance data from an ESP32-CAM over serial", long_about = None)]
struct Cli {
    /// Optional TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch metrics, all image triples and the performance chart
    Retrieve {
        /// Serial port (overrides config)
        #[arg(long)]
        port: Option<String>,

        /// Number of image indices to fetch (overrides config)
        #[arg(long)]
        count: Option<usize>,

        /// Parent directory for the session folder (overrides config)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Fetch and print one performance record
    Metrics {
        /// Serial port (overrides config)
        #[arg(long)]
        port: Option<String>,
    },

    /// List serial ports on this machine
    Ports,

    /// Run the retrieve flow against a simulated camera
    Simulate {
        /// Number of image indices to fetch
        #[arg(long, default_value = "3")]
        count: usize,

        /// Parent directory for the session folder (overrides config)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        RetrieverConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Retrieve {
            port,
            count,
            output,
        } => {
            if let Some(port) = port {
                config.serial.port = port;
            }
            if let Some(count) = count {
                config.image.count = count;
            }
            if let Some(output) = output {
                config.output.base_dir = output;
            }
            init(&config)?;
            retrieve(&config)
        }
        Commands::Metrics { port } => {
            if let Some(port) = port {
                config.serial.port = port;
            }
            init(&config)?;
            metrics(&config)
        }
        Commands::Ports => ports(),
        Commands::Simulate { count, output } => {
            if let Some(output) = output {
                config.output.base_dir = output;
            }
            config.image.count = count;
            init(&config)?;
            simulate(&config)
        }
    }
}

fn init(config: &RetrieverConfig) -> Result<()> {
    config.validate()?;
    logging::init(LoggingConfig::from_config(&config.application)?)?;
    Ok(())
}

fn retrieve(config: &RetrieverConfig) -> Result<()> {
    let mut session = RetrievalSession::open(config)
        .with_context(|| format!("Could not open port {}", config.serial.port))?;
    let report = session.run(config.image.count)?;
    print_report(&report, session.output_dir());
    session.close();
    Ok(())
}

fn metrics(config: &RetrieverConfig) -> Result<()> {
    let transport = SerialTransport::open(&config.serial)
        .with_context(|| format!("Could not open port {}", config.serial.port))?;
    let mut client = RetrievalClient::new(transport, config.protocol.clone());
    let metrics = client
        .get_performance_metrics()
        .context("Could not get performance metrics")?;

    println!("Performance Metrics:");
    println!("FPS: {:.2}", metrics.fps);
    for (label, ms) in metrics.timings_ms() {
        println!("{label} time: {ms:.2} ms");
    }
    for violation in &metrics.violations {
        println!("Warning: {violation} (zeroed)");
    }
    Ok(())
}

fn ports() -> Result<()> {
    let ports = list_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{:<32} {}", port.name, port.kind);
    }
    Ok(())
}

fn simulate(config: &RetrieverConfig) -> Result<()> {
    let camera = SimulatedCamera::new(
        config.protocol.clone(),
        config.image.width,
        config.image.height,
    );
    let mut session = RetrievalSession::with_transport(camera, config)?;
    let report = session.run(config.image.count)?;
    print_report(&report, session.output_dir());
    session.close();
    Ok(())
}

fn print_report(report: &RetrievalReport, output_dir: &std::path::Path) {
    println!();
    println!("Saved {} images", report.saved.len());
    if let Some(chart) = &report.chart {
        println!("Performance chart: {}", chart.display());
    }
    for failure in &report.failures {
        let step = match failure.step {
            RetrievalStep::Metrics => "metrics".to_string(),
            RetrievalStep::Image { category, index } => format!("{category} image {index:02}"),
            RetrievalStep::Chart => "performance chart".to_string(),
        };
        println!("Failed: {step}: {}", failure.error);
    }
    println!("Images saved in directory: {}", output_dir.display());
}
