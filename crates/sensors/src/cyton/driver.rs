use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use log::{debug, error, info, warn};
use obci_types::{local_clock, DataType, SampleBatch, SessionDescriptor};
use serialport::{ClearBuffer, SerialPort};

use super::link::{self, CMD_ANALOG_MODE, CMD_START_STREAM, CMD_STOP_STREAM};
use super::packet::{DecodedFrame, FrameAssembler, PacketDecoder};
use crate::types::{AcquisitionSession, DeviceError, SessionConfig, SessionStatus};

const BAUD_RATE: u32 = 115_200;
/// Upper bound on a single blocking serial read.
const READ_TIMEOUT: Duration = Duration::from_millis(5);
const READ_CHUNK: usize = 4096;

/// Session against a Cyton or Cyton+Daisy board on a serial dongle.
pub struct CytonSession {
    config: SessionConfig,
    descriptor: SessionDescriptor,
    port: Option<Box<dyn SerialPort>>,
    decoder: PacketDecoder,
    assembler: FrameAssembler,
    status: SessionStatus,
    // Total frames handed out since open
    frame_count: u64,
    read_buf: Vec<u8>,
}

impl CytonSession {
    pub fn new(config: SessionConfig) -> Self {
        let descriptor = config.descriptor();
        let daisy = config.board.is_daisy();
        Self {
            config,
            descriptor,
            port: None,
            decoder: PacketDecoder::new(),
            assembler: FrameAssembler::new(daisy),
            status: SessionStatus::Closed,
            frame_count: 0,
            read_buf: vec![0u8; READ_CHUNK],
        }
    }

    fn port_name(&self) -> &str {
        &self.config.serial_port
    }

    /// Reset the board, apply channel settings and start streaming.
    fn prepare(&mut self) -> Result<(), DeviceError> {
        let port_name = self.config.serial_port.clone();
        let port = self.port.as_mut().ok_or(DeviceError::NotOpen)?;

        // A board left streaming by a previous run floods the reset reply
        port.write_all(CMD_STOP_STREAM)?;
        std::thread::sleep(Duration::from_millis(50));
        port.clear(ClearBuffer::Input)
            .map_err(|e| DeviceError::Io(e.to_string()))?;

        let banner = link::soft_reset(port.as_mut(), &port_name)?;
        if self.config.board.is_daisy() && !banner.contains("Daisy") {
            warn!("Board on {} did not report a Daisy module", port_name);
        }

        if self.config.wants(DataType::Stim) {
            match link::send_command(port.as_mut(), &port_name, CMD_ANALOG_MODE, link::COMMAND_TIMEOUT) {
                Ok(reply) => info!("Analog mode on {}: {}", port_name, reply.trim_end_matches("$$$").trim()),
                Err(DeviceError::Timeout { .. }) => warn!("Board on {} did not confirm analog mode", port_name),
                Err(e) => return Err(e),
            }
        }

        info!("Configuring board on {} ({} commands)", port_name, self.config.commands.len());
        let replies = link::configure_channels(port.as_mut(), &port_name, &self.config.commands)?;
        let rejected = replies.iter().filter(|r| !r.success).count();
        if rejected > 0 {
            warn!("{} of {} channel commands were not confirmed on {}", rejected, replies.len(), port_name);
        }

        port.clear(ClearBuffer::Input)
            .map_err(|e| DeviceError::Io(e.to_string()))?;
        port.write_all(CMD_START_STREAM)?;
        port.flush()?;
        Ok(())
    }

    /// Select the configured data types from a decoded frame.
    fn project(&self, frame: &DecodedFrame, out: &mut Vec<f64>) {
        out.clear();
        for data_type in &self.config.data_types {
            match data_type {
                DataType::Eeg => out.extend_from_slice(&frame.exg),
                DataType::Stim => out.extend_from_slice(&frame.analog),
            }
        }
    }

    fn disconnected(&mut self, reason: String) -> DeviceError {
        error!("Board on {} disconnected: {}", self.port_name(), reason);
        self.status = SessionStatus::Failed(reason.clone());
        DeviceError::Disconnected {
            port: self.config.serial_port.clone(),
            reason,
        }
    }
}

impl AcquisitionSession for CytonSession {
    fn open(&mut self) -> Result<(), DeviceError> {
        if self.port.is_some() {
            return Ok(());
        }
        let port_name = self.config.serial_port.clone();
        info!("Opening {} on {}", self.config.board, port_name);

        let port = match serialport::new(port_name.as_str(), BAUD_RATE).timeout(READ_TIMEOUT).open() {
            Ok(port) => port,
            Err(e) => {
                let err = DeviceError::PortOpen {
                    port: port_name,
                    reason: e.to_string(),
                };
                error!("{}", err);
                self.status = SessionStatus::Failed(err.to_string());
                return Err(err);
            }
        };
        // Keep the handle before the handshake so close() can release it on failure
        self.port = Some(port);

        if let Err(e) = self.prepare() {
            error!("Board on {} failed to start: {}", self.port_name(), e);
            self.status = SessionStatus::Failed(e.to_string());
            return Err(e);
        }

        self.decoder = PacketDecoder::new();
        self.assembler = FrameAssembler::new(self.config.board.is_daisy());
        self.frame_count = 0;
        self.status = SessionStatus::Streaming;
        info!(
            "Board on {} streaming {} channels at {} Hz",
            self.port_name(),
            self.descriptor.channel_count(),
            self.descriptor.sample_rate
        );
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<SampleBatch>, DeviceError> {
        let Some(port) = self.port.as_mut() else {
            return Err(DeviceError::NotOpen);
        };

        let available = match port.bytes_to_read() {
            Ok(n) => n as usize,
            Err(e) => return Err(self.disconnected(e.to_string())),
        };
        if available == 0 {
            return Ok(Vec::new());
        }

        let want = available.min(self.read_buf.len());
        let read = match port.read(&mut self.read_buf[..want]) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => 0,
            Err(e) => return Err(self.disconnected(e.to_string())),
        };
        self.decoder.extend(&self.read_buf[..read]);

        let mut frames = Vec::new();
        while let Some(packet) = self.decoder.next_packet() {
            if let Some(frame) = self.assembler.push(packet) {
                frames.push(frame);
            }
        }
        if frames.is_empty() {
            return Ok(Vec::new());
        }

        // Frames read together arrived together; back-date them at the nominal rate
        let now = local_clock();
        let dt = 1.0 / self.descriptor.sample_rate;
        let n = frames.len();
        let mut batch = SampleBatch::with_capacity(self.frame_count, self.descriptor.channel_count(), n);
        let mut values = Vec::with_capacity(self.descriptor.channel_count());
        for (i, frame) in frames.iter().enumerate() {
            self.project(frame, &mut values);
            let timestamp = now - (n - 1 - i) as f64 * dt;
            if let Err(e) = batch.push_frame(&values, timestamp) {
                warn!("Dropping frame {} from {}: {}", frame.sample_number, self.port_name(), e);
            }
        }
        self.frame_count = batch.next_index();
        debug!("{}: {} frames", self.port_name(), batch.len());
        Ok(vec![batch])
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        let Some(mut port) = self.port.take() else {
            debug!("Session on {} already closed", self.port_name());
            return Ok(());
        };
        info!("Closing board on {}", self.port_name());
        if matches!(self.status, SessionStatus::Failed(_)) {
            // keep the failure visible; the handle is released either way
            return Ok(());
        }
        self.status = SessionStatus::Closed;
        port.write_all(CMD_STOP_STREAM)?;
        port.flush()?;
        info!(
            "Board on {} closed after {} frames ({} sequence gaps, {} bytes skipped)",
            self.config.serial_port,
            self.frame_count,
            self.assembler.gaps(),
            self.decoder.skipped()
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

impl Drop for CytonSession {
    fn drop(&mut self) {
        if self.port.is_some() {
            warn!("CytonSession on {} dropped without calling close() first.", self.config.serial_port);
            let _ = self.close();
        }
    }
}
