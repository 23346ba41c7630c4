//! Common types and traits for acquisition sessions

use std::collections::HashMap;
use std::time::Duration;

use obci_types::{ChannelDesc, DataType, SampleBatch, SessionDescriptor};
use thiserror::Error;

use crate::board::BoardKind;
use crate::cyton::driver::CytonSession;
use crate::synthetic::driver::SyntheticSession;

/// Everything a session needs to know to open one board.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub board: BoardKind,
    /// Serial device path, e.g. `/dev/ttyUSB0` or `COM3`
    pub serial_port: String,
    /// Data types to forward, in output channel order
    pub data_types: Vec<DataType>,
    /// Channel labels for each requested data type
    pub channel_names: HashMap<DataType, Vec<String>>,
    /// `(label, command)` pairs sent to the board before streaming starts
    pub commands: Vec<(String, String)>,
}

impl SessionConfig {
    /// A config forwarding every ExG channel with generic labels.
    pub fn new(board: BoardKind, serial_port: impl Into<String>) -> Self {
        let labels = (1..=board.exg_channels()).map(|i| format!("ch{}", i)).collect();
        Self {
            board,
            serial_port: serial_port.into(),
            data_types: vec![DataType::Eeg],
            channel_names: HashMap::from([(DataType::Eeg, labels)]),
            commands: board.default_commands(),
        }
    }

    /// Outbound channel layout for this config.
    pub fn descriptor(&self) -> SessionDescriptor {
        let mut channels = Vec::new();
        for &data_type in &self.data_types {
            let count = self.board.channel_count(data_type);
            let names = self.channel_names.get(&data_type);
            for i in 0..count {
                let label = names
                    .and_then(|n| n.get(i))
                    .cloned()
                    .unwrap_or_else(|| format!("{}{}", data_type, i + 1));
                channels.push(ChannelDesc { label, data_type });
            }
        }
        SessionDescriptor {
            sample_rate: self.board.sampling_rate(),
            channels,
        }
    }

    pub fn wants(&self, data_type: DataType) -> bool {
        self.data_types.contains(&data_type)
    }
}

/// Status of an acquisition session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    /// Not open, or closed again
    Closed,
    /// Open and delivering samples
    Streaming,
    /// Open failed or the device went away
    Failed(String),
}

/// Errors that can occur against one board
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The serial port could not be opened
    #[error("Could not open serial port '{port}': {reason}")]
    PortOpen { port: String, reason: String },
    /// The board did not answer in time
    #[error("Board on '{port}' did not respond within {timeout:?}")]
    Timeout { port: String, timeout: Duration },
    /// The board stopped answering while streaming
    #[error("Board on '{port}' disconnected: {reason}")]
    Disconnected { port: String, reason: String },
    /// The session is not open
    #[error("Session is not open")]
    NotOpen,
    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        DeviceError::Io(err.to_string())
    }
}

/// Lifecycle every board session implements.
///
/// Sessions are created closed. `open` connects and starts streaming, `poll` hands out
/// whatever arrived since the previous call, `close` releases the device.
pub trait AcquisitionSession: Send {
    /// Connect to the device and start streaming.
    fn open(&mut self) -> Result<(), DeviceError>;

    /// Return the batches that arrived since the previous poll.
    ///
    /// Never blocks beyond a short bounded wait. An empty vector means no new data;
    /// an error means the device is gone.
    fn poll(&mut self) -> Result<Vec<SampleBatch>, DeviceError>;

    /// Stop streaming and release the device. Calling it again is a no-op.
    fn close(&mut self) -> Result<(), DeviceError>;

    /// Get current session status
    fn status(&self) -> SessionStatus;

    /// Sampling rate and channel layout of the produced batches.
    fn describe(&self) -> SessionDescriptor;
}

/// Build the session matching the configured board.
pub fn create_session(config: SessionConfig) -> Box<dyn AcquisitionSession> {
    match config.board {
        BoardKind::Synthetic => Box::new(SyntheticSession::new(config)),
        BoardKind::Cyton | BoardKind::CytonDaisy => Box::new(CytonSession::new(config)),
    }
}
