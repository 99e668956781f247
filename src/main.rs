//! danalink - Diagnostics for the Dana pump link protocol
//!
//! Builds and inspects frames offline and manages persisted pump state.

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use danalink_client::Config;
use danalink_protocol::Generation;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "danalink")]
#[command(about = "Diagnostics for the Dana insulin pump BLE protocol")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Encryption generation as given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum GenerationArg {
    Default,
    Rsv3,
    Ble5,
}

impl From<GenerationArg> for Generation {
    fn from(arg: GenerationArg) -> Self {
        match arg {
            GenerationArg::Default => Generation::Default,
            GenerationArg::Rsv3 => Generation::Generation2,
            GenerationArg::Ble5 => Generation::Generation3,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the frame CRC of a body (type, opcode, payload)
    Crc {
        /// Body bytes as hex
        data: String,

        /// Encryption generation
        #[arg(short, long, value_enum, default_value = "default")]
        generation: GenerationArg,

        /// Use the handshake variant
        #[arg(long)]
        handshake: bool,
    },

    /// Build a first-level encoded frame
    Encode {
        /// Advertised device name (10 characters)
        #[arg(short, long, env = "DANALINK_DEVICE_NAME")]
        device_name: String,

        /// Operation code (decimal or 0x-prefixed hex)
        #[arg(value_parser = parse_opcode)]
        opcode: u8,

        /// Payload bytes as hex
        payload: Option<String>,

        /// Build an encryption request instead of a command
        #[arg(long)]
        handshake: bool,
    },

    /// Decode a captured first-level frame
    Decode {
        /// Advertised device name (10 characters)
        #[arg(short, long, env = "DANALINK_DEVICE_NAME")]
        device_name: String,

        /// Frame bytes as hex
        data: String,
    },

    /// Validate a pin pair shown by an RSv3 pump
    Pin {
        /// First pin (12 hex digits)
        pin1: String,

        /// Second pin (8 hex digits)
        pin2: String,
    },

    /// Print the effective configuration as YAML
    Config,

    /// Show a persisted pump state file
    State {
        /// Path to the state JSON
        path: PathBuf,

        /// Drop the stored pairing keys
        #[arg(long)]
        forget: bool,
    },
}

fn parse_opcode(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid opcode '{}': {}", s, e))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Configuration error".red(), e);
            std::process::exit(1);
        }
    };

    match commands::execute(cli.command, &config) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }

    Ok(())
}
