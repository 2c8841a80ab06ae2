use std::{fmt::Display, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{endpoint::EndpointId, error::Error};

/// The address the bridge listens on if nothing else is asked for.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:9999";

/// The baud rate used if nothing else is asked for.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// A serial setting which could not be accepted.
///
/// Each variant names the field it belongs to.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    /// Baud rate was zero.
    #[error("baud rate must be a positive integer, got `{0}`")]
    BaudRate(u32),

    /// Data bits outside of 5..=8.
    #[error("data bits must be one of 5, 6, 7 or 8, got `{0}`")]
    DataBits(u8),

    /// Unrecognized parity token.
    #[error("invalid parity value `{0}`, expected one of none, odd, even, mark or space")]
    Parity(String),

    /// Unrecognized stop bits token.
    #[error("invalid stop bits value `{0}`, expected one of 1, 1.5 or 2")]
    StopBits(String),

    /// No serial port was given.
    #[error("no serial port given, use --port-name or set `endpoint` in the configuration file")]
    MissingEndpoint,
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    /// 5 bits.
    Five,
    /// 6 bits.
    Six,
    /// 7 bits.
    Seven,
    /// 8 bits.
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = ConfigError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            5 => Ok(Self::Five),
            6 => Ok(Self::Six),
            7 => Ok(Self::Seven),
            8 => Ok(Self::Eight),
            other => Err(ConfigError::DataBits(other)),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

impl Display for DataBits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Parity scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    /// No parity bit.
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
    /// Parity bit always set.
    Mark,
    /// Parity bit always cleared.
    Space,
}

impl FromStr for Parity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "no" => Ok(Self::None),
            "odd" => Ok(Self::Odd),
            "even" => Ok(Self::Even),
            "mark" => Ok(Self::Mark),
            "space" => Ok(Self::Space),
            _ => Err(ConfigError::Parity(s.into())),
        }
    }
}

impl Display for Parity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Parity::None => "none",
            Parity::Odd => "odd",
            Parity::Even => "even",
            Parity::Mark => "mark",
            Parity::Space => "space",
        };

        write!(f, "{s}")
    }
}

/// Trailing bits marking the end of a character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    /// 1 stop bit.
    One,
    /// 1.5 stop bits.
    OnePointFive,
    /// 2 stop bits.
    Two,
}

impl FromStr for StopBits {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" => Ok(Self::One),
            "1.5" => Ok(Self::OnePointFive),
            "2" => Ok(Self::Two),
            _ => Err(ConfigError::StopBits(s.into())),
        }
    }
}

impl Display for StopBits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopBits::One => "1",
            StopBits::OnePointFive => "1.5",
            StopBits::Two => "2",
        };

        write!(f, "{s}")
    }
}

/// A validated serial port configuration.
///
/// Only obtainable through [`SerialSettings::resolve`] (or [`Default`]),
/// so holding one means every field is in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialConfig {
    baud_rate: u32,
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
    rts: bool,
    dtr: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            rts: true,
            dtr: true,
        }
    }
}

impl SerialConfig {
    /// Symbols per second.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Data bits per character.
    pub fn data_bits(&self) -> DataBits {
        self.data_bits
    }

    /// The parity scheme.
    pub fn parity(&self) -> Parity {
        self.parity
    }

    /// Stop bits per character.
    pub fn stop_bits(&self) -> StopBits {
        self.stop_bits
    }

    /// Whether RTS is asserted when the port opens.
    pub fn rts(&self) -> bool {
        self.rts
    }

    /// Whether DTR is asserted when the port opens.
    pub fn dtr(&self) -> bool {
        self.dtr
    }
}

impl Display for SerialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} baud, {} data bits, parity {}, {} stop bits, rts: {}, dtr: {}",
            self.baud_rate, self.data_bits, self.parity, self.stop_bits, self.rts, self.dtr
        )
    }
}

/// Serial settings as given by the user, not yet validated.
///
/// Unset fields fall back to the defaults when resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Symbols per second.
    pub baud_rate: Option<u32>,

    /// 5, 6, 7 or 8.
    pub data_bits: Option<u8>,

    /// none, odd, even, mark or space.
    pub parity: Option<String>,

    /// 1, 1.5 or 2.
    pub stop_bits: Option<String>,

    /// Assert RTS on open.
    pub rts: Option<bool>,

    /// Assert DTR on open.
    pub dtr: Option<bool>,
}

impl SerialSettings {
    /// Fill in whatever is unset in `self` from `other`.
    pub fn or(self, other: Self) -> Self {
        Self {
            baud_rate: self.baud_rate.or(other.baud_rate),
            data_bits: self.data_bits.or(other.data_bits),
            parity: self.parity.or(other.parity),
            stop_bits: self.stop_bits.or(other.stop_bits),
            rts: self.rts.or(other.rts),
            dtr: self.dtr.or(other.dtr),
        }
    }

    /// Validate the settings.
    ///
    /// Fields which were given must be valid, unset fields get defaults.
    pub fn resolve(&self) -> Result<SerialConfig, ConfigError> {
        let defaults = SerialConfig::default();

        let baud_rate = match self.baud_rate {
            Some(0) => return Err(ConfigError::BaudRate(0)),
            Some(baud_rate) => baud_rate,
            None => defaults.baud_rate,
        };

        let data_bits = match self.data_bits {
            Some(bits) => DataBits::try_from(bits)?,
            None => defaults.data_bits,
        };

        let parity = match &self.parity {
            Some(parity) => parity.parse()?,
            None => defaults.parity,
        };

        let stop_bits = match &self.stop_bits {
            Some(stop_bits) => stop_bits.parse()?,
            None => defaults.stop_bits,
        };

        Ok(SerialConfig {
            baud_rate,
            data_bits,
            parity,
            stop_bits,
            rts: self.rts.unwrap_or(defaults.rts),
            dtr: self.dtr.unwrap_or(defaults.dtr),
        })
    }
}

/// How concurrent TCP clients share the serial port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionPolicy {
    /// Any number of clients, all reading and writing the port at once.
    /// Writes from different clients may interleave.
    #[default]
    Shared,

    /// One client at a time. Others are closed right after being accepted.
    Exclusive,
}

/// The configuration used for running the bridge, as found in a configuration file
/// or assembled from the command line.
///
/// Every field is optional so that several sources can be layered,
/// see [`Config::or`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The serial port to bridge.
    pub endpoint: Option<EndpointId>,

    /// TCP address to listen on (host:port).
    pub address: Option<String>,

    /// Serial line settings.
    pub serial: SerialSettings,

    /// How concurrent clients are handled.
    pub policy: Option<ConnectionPolicy>,
}

/// A fully resolved configuration.
/// Built once at startup and handed to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// The serial port to bridge.
    pub endpoint: EndpointId,

    /// TCP address to listen on (host:port).
    pub address: String,

    /// Validated serial line settings.
    pub serial: SerialConfig,

    /// How concurrent clients are handled.
    pub policy: ConnectionPolicy,
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, ron::error::SpannedError> {
        Self::ron().from_str::<Config>(input)
    }

    /// An example configuration with all fields filled in.
    pub fn example() -> Self {
        Self {
            endpoint: Some(EndpointId::tty("/dev/ttyUSB0")),
            address: Some(DEFAULT_ADDRESS.into()),
            serial: SerialSettings {
                baud_rate: Some(DEFAULT_BAUD_RATE),
                data_bits: Some(8),
                parity: Some("none".into()),
                stop_bits: Some("1".into()),
                rts: Some(true),
                dtr: Some(true),
            },
            policy: Some(ConnectionPolicy::Shared),
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, ron::Error> {
        Self::ron().to_string_pretty(self, ron::ser::PrettyConfig::default())
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let path = p.as_ref().display().to_string();

        let s = std::fs::read_to_string(p).map_err(|e| Error::ConfigFile {
            path: path.clone(),
            problem: e.to_string(),
        })?;

        Self::deserialize(&s).map_err(|e| Error::ConfigFile {
            path,
            problem: e.to_string(),
        })
    }

    /// Fill in whatever is unset in `self` from `other`.
    pub fn or(self, other: Self) -> Self {
        Self {
            endpoint: self.endpoint.or(other.endpoint),
            address: self.address.or(other.address),
            serial: self.serial.or(other.serial),
            policy: self.policy.or(other.policy),
        }
    }

    /// Validate and apply defaults.
    ///
    /// Nothing is opened here.
    /// Problems are reported as [`Error::BadConfig`].
    pub fn resolve(self) -> Result<BridgeConfig, Error> {
        let serial = self.serial.resolve()?;
        let endpoint = self.endpoint.ok_or(ConfigError::MissingEndpoint)?;

        Ok(BridgeConfig {
            endpoint,
            address: self.address.unwrap_or_else(|| DEFAULT_ADDRESS.into()),
            serial,
            policy: self.policy.unwrap_or_default(),
        })
    }
}
