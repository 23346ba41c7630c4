//! Supported board kinds and their fixed channel layouts.

use std::fmt;

use obci_types::DataType;

/// Default per-channel settings commands (power on, gain 24, normal input, bias, SRB2).
/// Sending these restores the board defaults without a full soft reset.
pub const DEFAULT_CHANNEL_COMMANDS: [&str; 16] = [
    // channels 1-8, Cyton
    "x1060110X", "x2060110X", "x3060110X", "x4060110X",
    "x5060110X", "x6060110X", "x7060110X", "x8060110X",
    // channels 9-16, Daisy
    "xQ060110X", "xW060110X", "xE060110X", "xR060110X",
    "xT060110X", "xY060110X", "xU060110X", "xI060110X",
];

/// Boards the bridge can open, identified by their BrainFlow board ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoardKind {
    /// Software-generated data, no hardware required
    Synthetic,
    /// OpenBCI Cyton, 8 ExG channels over the USB dongle
    Cyton,
    /// OpenBCI Cyton with Daisy module, 16 ExG channels over the USB dongle
    CytonDaisy,
}

impl BoardKind {
    /// Map a BrainFlow board id onto a supported board.
    pub fn from_board_id(id: i32) -> Option<Self> {
        match id {
            -1 => Some(Self::Synthetic),
            0 => Some(Self::Cyton),
            2 => Some(Self::CytonDaisy),
            _ => None,
        }
    }

    pub fn board_id(&self) -> i32 {
        match self {
            Self::Synthetic => -1,
            Self::Cyton => 0,
            Self::CytonDaisy => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Synthetic => "Synthetic Board",
            Self::Cyton => "OpenBCI Cyton",
            Self::CytonDaisy => "OpenBCI Cyton+Daisy",
        }
    }

    /// Number of ExG channels.
    pub fn exg_channels(&self) -> usize {
        match self {
            Self::Synthetic | Self::Cyton => 8,
            Self::CytonDaisy => 16,
        }
    }

    /// Number of analog input channels.
    pub fn analog_channels(&self) -> usize {
        3
    }

    /// Nominal sampling rate in Hz. The Daisy halves the effective rate since board
    /// and daisy packets alternate.
    pub fn sampling_rate(&self) -> f64 {
        match self {
            Self::Synthetic | Self::Cyton => 250.0,
            Self::CytonDaisy => 125.0,
        }
    }

    pub fn channel_count(&self, data_type: DataType) -> usize {
        match data_type {
            DataType::Eeg => self.exg_channels(),
            DataType::Stim => self.analog_channels(),
        }
    }

    pub fn is_daisy(&self) -> bool {
        matches!(self, Self::CytonDaisy)
    }

    /// `(label, command)` pairs restoring the default settings of every ExG channel.
    pub fn default_commands(&self) -> Vec<(String, String)> {
        DEFAULT_CHANNEL_COMMANDS
            .iter()
            .take(self.exg_channels())
            .enumerate()
            .map(|(i, cmd)| (format!("chan{}", i + 1), (*cmd).to_string()))
            .collect()
    }
}

impl fmt::Display for BoardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (board_id {})", self.name(), self.board_id())
    }
}
