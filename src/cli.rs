use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::Level;

use crate::{
    config::{Config, ConfigError, ConnectionPolicy, Parity, SerialSettings, StopBits},
    endpoint::EndpointId,
};

/// The command line interface for serialtcp.
#[derive(Parser, Debug)]
#[command(author, version, about = "Serve a serial port over TCP")]
#[command(subcommand_required = true, arg_required_else_help = true)]
pub struct Cli {
    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Commands available in the command line interface.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a TCP server connected to a serial port.
    ///
    /// Opens the serial port and a TCP server, and pipes communication between both.
    /// There's NO security implemented, only use this in secure networks at your own risk.
    Serve(Serve),

    /// List the serial ports found on this machine.
    List,

    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Debug, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,
}

/// Arguments to `serve`.
///
/// Every flag may also be given as an environment variable,
/// e.g. `SERIALTCP_BAUD_RATE=9600`.
/// Flags win over the environment, which wins over the configuration file.
#[derive(Args, Debug, Clone)]
pub struct Serve {
    /// Serial port name, e.g. /dev/ttyUSB0 or COM3.
    #[arg(short, long, env = "SERIALTCP_PORT_NAME")]
    pub port_name: Option<String>,

    /// TCP address to listen on (host:port) [default: 127.0.0.1:9999]
    #[arg(short, long, env = "SERIALTCP_ADDRESS")]
    pub address: Option<String>,

    /// Serial port baud rate [default: 115200]
    #[arg(short, long, env = "SERIALTCP_BAUD_RATE")]
    pub baud_rate: Option<u32>,

    /// Serial port data bits (5, 6, 7 or 8) [default: 8]
    #[arg(short, long, env = "SERIALTCP_DATA_BITS")]
    pub data_bits: Option<u8>,

    /// Serial port parity (none, odd, even, mark or space) [default: none]
    #[arg(long, env = "SERIALTCP_PARITY", value_parser = parse_parity)]
    pub parity: Option<String>,

    /// Serial port stop bits (1, 1.5 or 2) [default: 1]
    #[arg(long, env = "SERIALTCP_STOP_BITS", value_parser = parse_stop_bits)]
    pub stop_bits: Option<String>,

    /// Do not assert RTS (Request To Send) when opening the port.
    #[arg(long, env = "SERIALTCP_DISABLE_RTS")]
    pub disable_rts: bool,

    /// Do not assert DTR (Data Terminal Ready) when opening the port.
    #[arg(long, env = "SERIALTCP_DISABLE_DTR")]
    pub disable_dtr: bool,

    /// Only allow one client at a time.
    /// Further clients are disconnected right after connecting.
    #[arg(long, env = "SERIALTCP_EXCLUSIVE")]
    pub exclusive: bool,

    /// Path to a configuration file.
    #[arg(short, long, env = "SERIALTCP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level for stderr.
    #[arg(long, env = "SERIALTCP_LOG_LEVEL", default_value_t = Level::INFO)]
    pub log_level: Level,

    /// Also log to daily rotated files in this directory.
    #[arg(long, env = "SERIALTCP_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

fn parse_parity(s: &str) -> Result<String, ConfigError> {
    s.parse::<Parity>().map(|_| s.to_string())
}

fn parse_stop_bits(s: &str) -> Result<String, ConfigError> {
    s.parse::<StopBits>().map(|_| s.to_string())
}

impl Serve {
    /// The configuration given by flags and environment.
    ///
    /// Unset flags are left unset, so that this may be layered over a configuration file.
    pub fn to_config(&self) -> Config {
        Config {
            endpoint: self.port_name.as_deref().map(EndpointId::tty),
            address: self.address.clone(),
            serial: SerialSettings {
                baud_rate: self.baud_rate,
                data_bits: self.data_bits,
                parity: self.parity.clone(),
                stop_bits: self.stop_bits.clone(),
                rts: self.disable_rts.then_some(false),
                dtr: self.disable_dtr.then_some(false),
            },
            policy: self.exclusive.then_some(ConnectionPolicy::Exclusive),
        }
    }

    /// Layer flags over the configuration file, if any.
    pub fn load_config(&self) -> Result<Config, crate::error::Error> {
        let file = match &self.config {
            Some(path) => Config::new_from_path(path)?,
            None => Config::default(),
        };

        Ok(self.to_config().or(file))
    }
}
