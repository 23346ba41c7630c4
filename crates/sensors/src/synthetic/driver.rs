use std::time::{Duration, Instant};

use log::{debug, info};
use obci_types::{local_clock, DataType, SampleBatch, SessionDescriptor};

use super::generator::EegGenerator;
use crate::types::{AcquisitionSession, DeviceError, SessionConfig, SessionStatus};

/// Most frames a single poll hands out; a late poll catches up over several calls.
const MAX_FRAMES_PER_POLL: u64 = 250;

/// A session that does not access any hardware.
///
/// Frames are produced according to elapsed wall time, so the data rate matches the
/// nominal sampling rate whatever the poll cadence.
pub struct SyntheticSession {
    config: SessionConfig,
    descriptor: SessionDescriptor,
    generator: Option<EegGenerator>,
    status: SessionStatus,
    // Wall-clock and local-clock origin of the stream
    started: Option<(Instant, f64)>,
    // Total frames generated since open
    produced: u64,
}

impl SyntheticSession {
    pub fn new(config: SessionConfig) -> Self {
        let descriptor = config.descriptor();
        Self {
            config,
            descriptor,
            generator: None,
            status: SessionStatus::Closed,
            started: None,
            produced: 0,
        }
    }

    /// Frames owed after `elapsed` of streaming.
    fn frames_due(&self, elapsed: Duration) -> u64 {
        let total = (elapsed.as_secs_f64() * self.descriptor.sample_rate).floor() as u64;
        total.saturating_sub(self.produced).min(MAX_FRAMES_PER_POLL)
    }

    /// Analog channels carry a 100 ms trigger pulse at the start of every second.
    fn stim_frame(&self, index: u64, out: &mut Vec<f64>) {
        let rate = self.descriptor.sample_rate as u64;
        let pulse = if rate > 0 && index % rate < rate / 10 { 1.0 } else { 0.0 };
        out.extend_from_slice(&[pulse, 0.0, 0.0]);
    }

    fn generate(&mut self, frames: u64, origin: f64) -> Option<SampleBatch> {
        if frames == 0 {
            return None;
        }
        let channel_count = self.descriptor.channel_count();
        let rate = self.descriptor.sample_rate;
        let mut batch = SampleBatch::with_capacity(self.produced, channel_count, frames as usize);
        let mut exg = Vec::new();
        let mut values = Vec::with_capacity(channel_count);

        for _ in 0..frames {
            let index = self.produced;
            if let Some(generator) = self.generator.as_mut() {
                generator.next_frame(&mut exg);
            }
            values.clear();
            for data_type in &self.config.data_types {
                match data_type {
                    DataType::Eeg => values.extend_from_slice(&exg),
                    DataType::Stim => self.stim_frame(index, &mut values),
                }
            }
            batch.push_frame(&values, origin + index as f64 / rate).ok()?;
            self.produced += 1;
        }
        Some(batch)
    }

    fn poll_at(&mut self, elapsed: Duration, origin: f64) -> Vec<SampleBatch> {
        let due = self.frames_due(elapsed);
        self.generate(due, origin).into_iter().collect()
    }
}

impl AcquisitionSession for SyntheticSession {
    fn open(&mut self) -> Result<(), DeviceError> {
        if self.status == SessionStatus::Streaming {
            return Ok(());
        }
        self.generator = Some(EegGenerator::new(
            self.descriptor.sample_rate,
            self.config.board.exg_channels(),
        ));
        self.started = Some((Instant::now(), local_clock()));
        self.produced = 0;
        self.status = SessionStatus::Streaming;
        info!(
            "Synthetic board '{}' streaming {} channels at {} Hz",
            self.config.serial_port,
            self.descriptor.channel_count(),
            self.descriptor.sample_rate
        );
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<SampleBatch>, DeviceError> {
        let Some((started, origin)) = self.started else {
            return Err(DeviceError::NotOpen);
        };
        Ok(self.poll_at(started.elapsed(), origin))
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.started.take().is_none() {
            debug!("Synthetic board '{}' already closed", self.config.serial_port);
            return Ok(());
        }
        self.generator = None;
        self.status = SessionStatus::Closed;
        info!(
            "Synthetic board '{}' closed after {} frames",
            self.config.serial_port, self.produced
        );
        Ok(())
    }

    fn status(&self) -> SessionStatus {
        self.status.clone()
    }

    fn describe(&self) -> SessionDescriptor {
        self.descriptor.clone()
    }
}
