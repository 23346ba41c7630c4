//! Device settings files.
//!
//! One YAML document per board:
//!
//! ```yaml
//! args:
//!   board_id: 0
//!   serial_port: /dev/ttyUSB0
//!   name: obci_eeg1
//!   uid: obci_eeg1_uid
//!   data_type: [EEG, stim]
//!   channel_names:
//!     EEG: Fp1,Fp2,C3,C4,P7,P8,O1,O2
//!     stim: A5,A6,A7
//!   max_time: 3600
//!   delay: 0.0
//! commands:
//!   chan1: x1060110X
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use obci_sensors::{BoardKind, SessionConfig};
use obci_types::DataType;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

/// Stream content type used when a settings file does not name one.
pub const DEFAULT_STREAM_TYPE: &str = "EEG_AUX";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Missing 'args' section")]
    MissingArgs,

    #[error("Missing required keys in 'args': {}", .0.join(", "))]
    MissingKeys(Vec<&'static str>),

    #[error("'serial_port' must be a non-empty string")]
    SerialPort,

    #[error("Unsupported board_id {0} (supported: -1 synthetic, 0 Cyton, 2 Cyton+Daisy)")]
    UnsupportedBoard(i32),

    #[error("Unknown data type '{0}' (expected EEG or stim)")]
    UnknownDataType(String),

    #[error("{0}")]
    Invalid(String),
}

/// Validated settings for one device and its outbound stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub session: SessionConfig,
    pub name: String,
    pub uid: String,
    pub stream_type: String,
    /// Run limit in seconds
    pub max_time: f64,
    /// Seconds subtracted from every timestamp
    pub delay: f64,
}

impl DeviceConfig {
    pub fn board(&self) -> BoardKind {
        self.session.board
    }

    pub fn serial_port(&self) -> &str {
        &self.session.serial_port
    }

    /// Published stream name, `{name}_{serial_port}`.
    pub fn stream_name(&self) -> String {
        format!("{}_{}", self.name, self.session.serial_port)
    }

    /// Published source id, `{uid}_{serial_port}`.
    pub fn source_id(&self) -> String {
        format!("{}_{}", self.uid, self.session.serial_port)
    }

    /// `max_time` as a duration; values too large to represent saturate.
    pub fn run_limit(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_time).unwrap_or(Duration::MAX)
    }
}

/// A scalar or a list; scalars are split on commas.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_items(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => s.split(',').map(|item| item.trim().to_string()).collect(),
            OneOrMany::Many(items) => items.into_iter().map(|item| item.trim().to_string()).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawArgs {
    board_id: Option<i32>,
    name: Option<String>,
    data_type: Option<OneOrMany>,
    channel_names: Option<HashMap<String, OneOrMany>>,
    uid: Option<String>,
    max_time: Option<f64>,
    serial_port: Option<serde_yaml::Value>,
    delay: Option<f64>,
    stream_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    args: Option<RawArgs>,
    commands: Option<serde_yaml::Mapping>,
}

/// Read and validate one device settings file.
pub fn load_device_config(path: impl AsRef<Path>) -> Result<DeviceConfig, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_device_config(&contents)?;
    info!(
        "Loaded {} settings for '{}' from {}",
        config.board(),
        config.stream_name(),
        path.display()
    );
    Ok(config)
}

/// Validate a device settings document.
pub fn parse_device_config(yaml: &str) -> Result<DeviceConfig, ConfigError> {
    let doc: RawDocument = serde_yaml::from_str(yaml)?;
    let args = doc.args.ok_or(ConfigError::MissingArgs)?;

    let mut missing = Vec::new();
    let board_id = required(args.board_id, "board_id", &mut missing);
    let name = required(args.name, "name", &mut missing);
    let data_type = required(args.data_type, "data_type", &mut missing);
    let channel_names = required(args.channel_names, "channel_names", &mut missing);
    let uid = required(args.uid, "uid", &mut missing);
    let max_time = required(args.max_time, "max_time", &mut missing);
    let serial_port = required(args.serial_port, "serial_port", &mut missing);
    let (
        Some(board_id),
        Some(name),
        Some(data_type),
        Some(channel_names),
        Some(uid),
        Some(max_time),
        Some(serial_port),
    ) = (board_id, name, data_type, channel_names, uid, max_time, serial_port)
    else {
        return Err(ConfigError::MissingKeys(missing));
    };

    let serial_port = match serial_port {
        serde_yaml::Value::String(port) if !port.trim().is_empty() => port.trim().to_string(),
        _ => return Err(ConfigError::SerialPort),
    };

    let board = BoardKind::from_board_id(board_id).ok_or(ConfigError::UnsupportedBoard(board_id))?;
    let data_types = parse_data_types(data_type)?;
    let channel_names = parse_channel_names(board, &data_types, channel_names)?;

    if name.trim().is_empty() || uid.trim().is_empty() {
        return Err(ConfigError::Invalid("'name' and 'uid' must not be empty".into()));
    }
    if !(max_time.is_finite() && max_time > 0.0) {
        return Err(ConfigError::Invalid(format!("'max_time' must be positive, got {}", max_time)));
    }
    if Duration::try_from_secs_f64(max_time).is_err() {
        return Err(ConfigError::Invalid(format!("'max_time' of {} seconds is out of range", max_time)));
    }
    let delay = args.delay.unwrap_or(0.0);
    if !(delay.is_finite() && delay >= 0.0) {
        return Err(ConfigError::Invalid(format!("'delay' must not be negative, got {}", delay)));
    }

    let commands = match doc.commands {
        Some(mapping) => parse_commands(mapping)?,
        None => {
            debug!("No commands given, using {} defaults", board.exg_channels());
            board.default_commands()
        }
    };

    Ok(DeviceConfig {
        session: SessionConfig {
            board,
            serial_port,
            data_types,
            channel_names,
            commands,
        },
        name: name.trim().to_string(),
        uid: uid.trim().to_string(),
        stream_type: args
            .stream_type
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_STREAM_TYPE.to_string()),
        max_time,
        delay,
    })
}

fn required<T>(value: Option<T>, key: &'static str, missing: &mut Vec<&'static str>) -> Option<T> {
    if value.is_none() {
        missing.push(key);
    }
    value
}

fn parse_data_types(raw: OneOrMany) -> Result<Vec<DataType>, ConfigError> {
    let mut data_types = Vec::new();
    for item in raw.into_items() {
        let data_type = DataType::parse(&item).ok_or(ConfigError::UnknownDataType(item))?;
        if data_types.contains(&data_type) {
            return Err(ConfigError::Invalid(format!("data type '{}' listed twice", data_type)));
        }
        data_types.push(data_type);
    }
    if data_types.is_empty() {
        return Err(ConfigError::Invalid("'data_type' must list at least one data type".into()));
    }
    Ok(data_types)
}

fn parse_channel_names(
    board: BoardKind,
    data_types: &[DataType],
    raw: HashMap<String, OneOrMany>,
) -> Result<HashMap<DataType, Vec<String>>, ConfigError> {
    let mut names = HashMap::new();
    for (key, labels) in raw {
        match DataType::parse(key.trim()) {
            Some(data_type) if data_types.contains(&data_type) => {
                names.insert(data_type, labels.into_items());
            }
            _ => debug!("Ignoring channel names for unrequested data type '{}'", key),
        }
    }

    for &data_type in data_types {
        let labels = names.get(&data_type).ok_or_else(|| {
            ConfigError::Invalid(format!("'channel_names' has no entry for {}", data_type))
        })?;
        let expected = board.channel_count(data_type);
        if labels.len() != expected {
            return Err(ConfigError::Invalid(format!(
                "{} has {} {} channels, 'channel_names' lists {}",
                board,
                expected,
                data_type,
                labels.len()
            )));
        }
        if labels.iter().any(|l| l.is_empty()) {
            return Err(ConfigError::Invalid(format!("empty channel label for {}", data_type)));
        }
    }
    Ok(names)
}

fn parse_commands(mapping: serde_yaml::Mapping) -> Result<Vec<(String, String)>, ConfigError> {
    let mut commands = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let label = scalar_string(&key)
            .ok_or_else(|| ConfigError::Invalid(format!("command label {:?} is not a string", key)))?;
        let command = scalar_string(&value)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ConfigError::Invalid(format!("command '{}' is empty", label)))?;
        commands.push((label, command.trim().to_string()));
    }
    Ok(commands)
}

fn scalar_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Two devices may not share a serial port or publish under the same identity.
pub fn check_distinct(first: &DeviceConfig, second: &DeviceConfig) -> Result<(), ConfigError> {
    if first.serial_port() == second.serial_port() {
        return Err(ConfigError::Invalid(format!(
            "both devices use serial port '{}'",
            first.serial_port()
        )));
    }
    if first.stream_name() == second.stream_name() || first.source_id() == second.source_id() {
        return Err(ConfigError::Invalid(format!(
            "both devices publish as '{}'",
            first.stream_name()
        )));
    }
    Ok(())
}
