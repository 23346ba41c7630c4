use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of data carried by a group of board channels.
///
/// The names match the `data_type` entries of the device settings files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// ExG electrode channels
    #[serde(rename = "EEG")]
    Eeg,
    /// Analog input channels, typically wired to a stimulus/trigger source
    #[serde(rename = "stim")]
    Stim,
}

impl DataType {
    /// Every data type a settings file may request, in canonical order.
    pub const ALL: [DataType; 2] = [DataType::Eeg, DataType::Stim];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Eeg => "EEG",
            DataType::Stim => "stim",
        }
    }

    /// Parse the settings-file spelling of a data type.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single outbound channel: its label and the data type it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDesc {
    pub label: String,
    pub data_type: DataType,
}

/// What an acquisition session produces once it is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Nominal sampling rate in Hz.
    pub sample_rate: f64,
    /// Selected channels in the order they appear in every frame.
    pub channels: Vec<ChannelDesc>,
}

impl SessionDescriptor {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.label.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BatchError {
    #[error("frame has {got} values, batch expects {expected}")]
    FrameSize { expected: usize, got: usize },
}

/// A rectangular block of readings produced by one poll of one device.
///
/// Samples are interleaved by channel: frame `i` occupies
/// `samples[i * channel_count..(i + 1) * channel_count]`. Each frame carries one
/// timestamp in seconds on the process-local clock (see [`crate::local_clock`]).
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    /// Device-relative index of the first frame in this batch.
    pub first_index: u64,
    pub channel_count: usize,
    pub samples: Vec<f64>,
    pub timestamps: Vec<f64>,
}

impl SampleBatch {
    pub fn new(first_index: u64, channel_count: usize) -> Self {
        Self {
            first_index,
            channel_count,
            samples: Vec::new(),
            timestamps: Vec::new(),
        }
    }

    pub fn with_capacity(first_index: u64, channel_count: usize, frames: usize) -> Self {
        Self {
            first_index,
            channel_count,
            samples: Vec::with_capacity(frames * channel_count),
            timestamps: Vec::with_capacity(frames),
        }
    }

    /// Append one frame. The frame must hold exactly `channel_count` values.
    pub fn push_frame(&mut self, frame: &[f64], timestamp: f64) -> Result<(), BatchError> {
        if frame.len() != self.channel_count {
            return Err(BatchError::FrameSize {
                expected: self.channel_count,
                got: frame.len(),
            });
        }
        self.samples.extend_from_slice(frame);
        self.timestamps.push(timestamp);
        Ok(())
    }

    /// Number of frames in the batch.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Index the frame after this batch will carry.
    pub fn next_index(&self) -> u64 {
        self.first_index + self.len() as u64
    }

    /// Iterate `(timestamp, values)` pairs in arrival order.
    pub fn frames(&self) -> impl Iterator<Item = (f64, &[f64])> {
        // chunks_exact panics on a zero chunk size; a zero-channel batch has no samples anyway
        self.timestamps
            .iter()
            .copied()
            .zip(self.samples.chunks_exact(self.channel_count.max(1)))
    }
}
