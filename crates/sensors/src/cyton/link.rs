//! Text-mode exchanges with the Cyton firmware (reset, channel settings).

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::types::DeviceError;

/// Every text reply from the firmware ends with this marker.
pub const REPLY_MARKER: &[u8] = b"$$$";

pub const CMD_SOFT_RESET: &[u8] = b"v";
pub const CMD_START_STREAM: &[u8] = b"b";
pub const CMD_STOP_STREAM: &[u8] = b"s";
/// Switch the aux words to analog reads (pins D11, D12, D13).
pub const CMD_ANALOG_MODE: &[u8] = b"/2";

/// How long the board gets to answer a soft reset.
pub const RESET_TIMEOUT: Duration = Duration::from_secs(3);
/// How long the board gets to acknowledge a settings command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Read until the reply marker shows up or `timeout` elapses.
///
/// Read timeouts from the port are expected and simply retried until the deadline.
pub fn read_reply<R: Read + ?Sized>(
    port: &mut R,
    port_name: &str,
    timeout: Duration,
) -> Result<String, DeviceError> {
    let deadline = Instant::now() + timeout;
    let mut reply = Vec::new();
    let mut chunk = [0u8; 256];

    while Instant::now() < deadline {
        match port.read(&mut chunk) {
            Ok(0) => std::thread::sleep(Duration::from_millis(1)),
            Ok(n) => {
                reply.extend_from_slice(&chunk[..n]);
                if reply.windows(REPLY_MARKER.len()).any(|w| w == REPLY_MARKER) {
                    return Ok(String::from_utf8_lossy(&reply).into_owned());
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e) => {
                return Err(DeviceError::Disconnected {
                    port: port_name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    Err(DeviceError::Timeout {
        port: port_name.to_string(),
        timeout,
    })
}

/// Send a command and wait for its text reply.
pub fn send_command<P: Read + Write + ?Sized>(
    port: &mut P,
    port_name: &str,
    command: &[u8],
    timeout: Duration,
) -> Result<String, DeviceError> {
    port.write_all(command)?;
    port.flush()?;
    read_reply(port, port_name, timeout)
}

/// Soft-reset the board and return the firmware banner.
pub fn soft_reset<P: Read + Write + ?Sized>(port: &mut P, port_name: &str) -> Result<String, DeviceError> {
    let banner = send_command(port, port_name, CMD_SOFT_RESET, RESET_TIMEOUT)?;
    let first_line = banner.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    info!("Board on {} answered reset: {}", port_name, first_line);
    Ok(banner)
}

/// Outcome of one settings command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub label: String,
    pub reply: String,
    pub success: bool,
}

/// Send every settings command in order and log the board's answer.
///
/// A rejected or unanswered command is reported but does not abort the sequence.
pub fn configure_channels<P: Read + Write + ?Sized>(
    port: &mut P,
    port_name: &str,
    commands: &[(String, String)],
) -> Result<Vec<CommandReply>, DeviceError> {
    let mut replies = Vec::with_capacity(commands.len());
    for (label, command) in commands {
        let reply = match send_command(port, port_name, command.as_bytes(), COMMAND_TIMEOUT) {
            Ok(reply) => reply,
            Err(DeviceError::Timeout { .. }) => String::new(),
            Err(e) => return Err(e),
        };
        let reply = reply.trim_end_matches("$$$").trim().to_string();
        let success = reply.contains("Success");
        if success {
            info!("Response from {}: {}", label, reply);
        } else if reply.is_empty() {
            warn!("No response from {} to command '{}'", label, command);
        } else {
            warn!("Response from {}: {}", label, reply);
        }
        debug!("{} <- {}", label, command);
        replies.push(CommandReply {
            label: label.clone(),
            reply,
            success,
        });
    }
    Ok(replies)
}
