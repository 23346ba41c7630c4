//! Cyton packet framing and decoding.
//!
//! Every packet on the wire is 33 bytes:
//!
//! | byte   | content                                         |
//! |--------|-------------------------------------------------|
//! | 0      | header `0xA0`                                   |
//! | 1      | sample number (wraps at 255)                    |
//! | 2..26  | 8 ExG channels, 24-bit big-endian two's complement |
//! | 26..32 | 3 aux words, 16-bit big-endian                  |
//! | 32     | end byte `0xC0..=0xC6`                          |
//!
//! With a Daisy attached the board sends odd sample numbers and the daisy even
//! ones; one board packet plus the following daisy packet form a 16-channel frame.

use log::{trace, warn};

pub const HEADER_BYTE: u8 = 0xA0;
pub const PACKET_LEN: usize = 33;
pub const EXG_PER_PACKET: usize = 8;
/// End byte marking aux words as analog reads.
pub const END_ANALOG: u8 = 0xC1;

/// Microvolts per ExG count at the default gain of 24 and 4.5 V reference.
pub const EXG_SCALE_UV: f64 = 4.5 / 24.0 / 8_388_607.0 * 1_000_000.0;

pub fn is_end_byte(b: u8) -> bool {
    (0xC0..=0xC6).contains(&b)
}

/// Sign-extend a 24-bit big-endian value.
pub fn i24_from_be(bytes: [u8; 3]) -> i32 {
    let raw = (i32::from(bytes[0]) << 16) | (i32::from(bytes[1]) << 8) | i32::from(bytes[2]);
    (raw << 8) >> 8
}

/// One decoded 33-byte packet, still in raw counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CytonPacket {
    pub sample_number: u8,
    pub exg: [i32; EXG_PER_PACKET],
    pub aux: [i16; 3],
    pub end_byte: u8,
}

impl CytonPacket {
    /// Decode a packet. `bytes` must start at a header byte and hold at least
    /// [`PACKET_LEN`] bytes.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < PACKET_LEN || bytes[0] != HEADER_BYTE || !is_end_byte(bytes[32]) {
            return None;
        }
        let mut exg = [0i32; EXG_PER_PACKET];
        for (i, value) in exg.iter_mut().enumerate() {
            let at = 2 + i * 3;
            *value = i24_from_be([bytes[at], bytes[at + 1], bytes[at + 2]]);
        }
        let mut aux = [0i16; 3];
        for (i, value) in aux.iter_mut().enumerate() {
            let at = 26 + i * 2;
            *value = i16::from_be_bytes([bytes[at], bytes[at + 1]]);
        }
        Some(Self {
            sample_number: bytes[1],
            exg,
            aux,
            end_byte: bytes[32],
        })
    }
}

/// Accumulates raw serial bytes and splits them into packets.
///
/// Garbage between packets (partial packets after a reconnect, text replies) is
/// skipped until the next header whose end byte lines up.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buffer: Vec<u8>,
    skipped: u64,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes discarded while resynchronizing so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn next_packet(&mut self) -> Option<CytonPacket> {
        loop {
            let Some(start) = self.buffer.iter().position(|&b| b == HEADER_BYTE) else {
                self.skipped += self.buffer.len() as u64;
                self.buffer.clear();
                return None;
            };
            if start > 0 {
                self.skipped += start as u64;
                self.buffer.drain(..start);
            }
            if self.buffer.len() < PACKET_LEN {
                return None;
            }
            match CytonPacket::parse(&self.buffer[..PACKET_LEN]) {
                Some(packet) => {
                    self.buffer.drain(..PACKET_LEN);
                    return Some(packet);
                }
                None => {
                    // false header, keep scanning from the next byte
                    self.skipped += 1;
                    self.buffer.drain(..1);
                }
            }
        }
    }
}

/// A complete frame in physical units.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub sample_number: u8,
    /// ExG values in microvolts, board channels first then daisy channels
    pub exg: Vec<f64>,
    /// Analog reads in raw counts
    pub analog: [f64; 3],
}

/// Turns packets into frames, pairing board and daisy packets when needed.
#[derive(Debug)]
pub struct FrameAssembler {
    daisy: bool,
    pending: Option<CytonPacket>,
    last_sample: Option<u8>,
    analog: [f64; 3],
    gaps: u64,
}

impl FrameAssembler {
    pub fn new(daisy: bool) -> Self {
        Self {
            daisy,
            pending: None,
            last_sample: None,
            analog: [0.0; 3],
            gaps: 0,
        }
    }

    /// Number of sample-number discontinuities seen.
    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    pub fn push(&mut self, packet: CytonPacket) -> Option<DecodedFrame> {
        // analog words are only meaningful in analog mode; hold the last reading otherwise
        if packet.end_byte == END_ANALOG {
            self.analog = packet.aux.map(f64::from);
        }

        if !self.daisy {
            self.track_sequence(packet.sample_number, 1);
            return Some(DecodedFrame {
                sample_number: packet.sample_number,
                exg: scale(&packet.exg).collect(),
                analog: self.analog,
            });
        }

        if packet.sample_number % 2 == 1 {
            if self.pending.is_some() {
                trace!("board packet without daisy partner, dropping previous");
            }
            self.pending = Some(packet);
            return None;
        }

        let board = self.pending.take()?;
        if board.sample_number.wrapping_add(1) != packet.sample_number {
            warn!(
                "Daisy packet {} does not follow board packet {}. Dropping pair.",
                packet.sample_number, board.sample_number
            );
            self.gaps += 1;
            return None;
        }
        self.track_sequence(board.sample_number, 2);
        Some(DecodedFrame {
            sample_number: board.sample_number,
            exg: scale(&board.exg).chain(scale(&packet.exg)).collect(),
            analog: self.analog,
        })
    }

    fn track_sequence(&mut self, sample_number: u8, step: u8) {
        if let Some(last) = self.last_sample {
            let expected = last.wrapping_add(step);
            if sample_number != expected {
                warn!("Sample number gap: expected {}, got {}", expected, sample_number);
                self.gaps += 1;
            }
        }
        self.last_sample = Some(sample_number);
    }
}

fn scale(counts: &[i32]) -> impl Iterator<Item = f64> + '_ {
    counts.iter().map(|&c| f64::from(c) * EXG_SCALE_UV)
}
