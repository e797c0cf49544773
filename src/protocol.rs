//! BMS frame codec
//!
//! The one supported wire format: JBD-style frames carried over BLE
//! notifications.
//!
//! ```text
//! request : DD A5 <cmd> 00 <chk_hi> <chk_lo> 77
//! response: DD <cmd> <status> <len> <payload..len> <chk_hi> <chk_lo> 77
//! ```
//!
//! The checksum is `0x10000 - sum(bytes[2 .. 4 + len])`, big-endian. Responses
//! may be split over several notifications; [`FrameAssembler`] stitches
//! them back together before [`decode`] validates and parses them.

use crate::error::FrameError;
use crate::model::Protection;

pub const START: u8 = 0xDD;
pub const STOP: u8 = 0x77;
pub const READ: u8 = 0xA5;

/// Header is start, command, status, length; footer is checksum and stop
const HEADER_LEN: usize = 4;
const FOOTER_LEN: usize = 3;

/// Fixed part of the general info payload before temperature readings
const GENERAL_FIXED_LEN: usize = 23;

/// Commands understood by the BMS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    GeneralInfo,
    CellVoltages,
}

impl Command {
    pub const fn code(self) -> u8 {
        match self {
            Self::GeneralInfo => 0x03,
            Self::CellVoltages => 0x04,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x03 => Some(Self::GeneralInfo),
            0x04 => Some(Self::CellVoltages),
            _ => None,
        }
    }

    /// Read request frame for this command
    pub fn request(self) -> [u8; 7] {
        let body = [self.code(), 0x00];
        let [hi, lo] = checksum(&body).to_be_bytes();
        [START, READ, body[0], body[1], hi, lo, STOP]
    }
}

/// `0x10000 - sum(bytes)` truncated to 16 bits
pub fn checksum(bytes: &[u8]) -> u16 {
    let sum = bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)));
    0u16.wrapping_sub(sum)
}

/// General info (command 0x03) payload
#[derive(Debug, Clone, PartialEq)]
pub struct GeneralInfo {
    /// Volts
    pub voltage: f64,
    /// Amps, positive while charging
    pub current: f64,
    /// Ah
    pub capacity_remaining: f64,
    /// Ah, zero when the BMS does not know
    pub capacity_nominal: f64,
    pub cycles: u16,
    pub production_date: u16,
    /// Bit i set while cell i is balancing (cells 16..31 in the high word)
    pub balance_bits: u32,
    pub protection: Protection,
    pub version: u8,
    /// Percent
    pub soc: u8,
    pub charge_fet: bool,
    pub discharge_fet: bool,
    pub cell_count: u8,
    /// °C
    pub temperatures: Vec<f64>,
}

impl GeneralInfo {
    pub const fn is_balancing(&self, cell: usize) -> bool {
        cell < 32 && self.balance_bits & (1 << cell) != 0
    }

    /// Balancing flags for the first `cells` cells
    pub fn balancing_flags(&self, cells: usize) -> Vec<bool> {
        (0..cells).map(|c| self.is_balancing(c)).collect()
    }

    /// Firmware version as `major.minor` from the packed nibbles
    pub fn version_string(&self) -> String {
        format!("{}.{}", self.version >> 4, self.version & 0x0F)
    }
}

/// Cell voltages (command 0x04) payload
#[derive(Debug, Clone, PartialEq)]
pub struct CellVoltages {
    /// Volts, one entry per cell
    pub voltages: Vec<f64>,
}

/// A validated, decoded response
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    GeneralInfo(GeneralInfo),
    CellVoltages(CellVoltages),
}

impl Frame {
    pub const fn command(&self) -> Command {
        match self {
            Self::GeneralInfo(_) => Command::GeneralInfo,
            Self::CellVoltages(_) => Command::CellVoltages,
        }
    }
}

/// Big-endian reader over a payload
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], FrameError> {
        let end = self.pos + N;
        let bytes: [u8; N] = self
            .buf
            .get(self.pos..end)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                FrameError::malformed(format!("payload truncated at byte {}", self.pos))
            })?;
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        Ok(u16::from_be_bytes(self.take()?))
    }

    fn i16(&mut self) -> Result<i16, FrameError> {
        Ok(i16::from_be_bytes(self.take()?))
    }
}

fn centi(raw: u16) -> f64 {
    f64::from(raw) / 100.0
}

/// Tenths of a kelvin to °C
fn decikelvin_to_celsius(raw: u16) -> f64 {
    f64::from(raw) / 10.0 - 273.1
}

fn parse_general(payload: &[u8]) -> Result<GeneralInfo, FrameError> {
    if payload.len() < GENERAL_FIXED_LEN {
        return Err(FrameError::malformed(format!(
            "general info payload is {} bytes, need {}",
            payload.len(),
            GENERAL_FIXED_LEN
        )));
    }
    let mut r = Reader::new(payload);
    let voltage = centi(r.u16()?);
    let current = f64::from(r.i16()?) / 100.0;
    let capacity_remaining = centi(r.u16()?);
    let capacity_nominal = centi(r.u16()?);
    let cycles = r.u16()?;
    let production_date = r.u16()?;
    let balance_low = r.u16()?;
    let balance_high = r.u16()?;
    let protection = Protection(r.u16()?);
    let version = r.u8()?;
    let soc = r.u8()?;
    let fet = r.u8()?;
    let cell_count = r.u8()?;
    let ntc_count = r.u8()?;

    let temperatures = (0..ntc_count)
        .map(|_| r.u16().map(decikelvin_to_celsius))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(GeneralInfo {
        voltage,
        current,
        capacity_remaining,
        capacity_nominal,
        cycles,
        production_date,
        balance_bits: u32::from(balance_low) | (u32::from(balance_high) << 16),
        protection,
        version,
        soc,
        charge_fet: fet & 0x01 != 0,
        discharge_fet: fet & 0x02 != 0,
        cell_count,
        temperatures,
    })
}

fn parse_cells(payload: &[u8]) -> Result<CellVoltages, FrameError> {
    if payload.len() % 2 != 0 {
        return Err(FrameError::malformed(format!(
            "cell payload has odd length {}",
            payload.len()
        )));
    }
    let voltages = payload
        .chunks_exact(2)
        .map(|c| f64::from(u16::from_be_bytes([c[0], c[1]])) / 1000.0)
        .collect();
    Ok(CellVoltages { voltages })
}

/// Validate and decode one complete response frame
pub fn decode(frame: &[u8]) -> Result<Frame, FrameError> {
    if frame.len() < HEADER_LEN + FOOTER_LEN {
        return Err(FrameError::malformed(format!(
            "frame is {} bytes, shorter than header and footer",
            frame.len()
        )));
    }
    if frame[0] != START {
        return Err(FrameError::malformed(format!(
            "bad start byte {:#04x}",
            frame[0]
        )));
    }
    let data_len = usize::from(frame[3]);
    let expected_len = data_len + HEADER_LEN + FOOTER_LEN;
    if frame.len() != expected_len {
        return Err(FrameError::malformed(format!(
            "length byte says {} bytes, frame has {}",
            expected_len,
            frame.len()
        )));
    }
    if frame[expected_len - 1] != STOP {
        return Err(FrameError::malformed(format!(
            "bad stop byte {:#04x}",
            frame[expected_len - 1]
        )));
    }

    let body_end = HEADER_LEN + data_len;
    let expected = checksum(&frame[2..body_end]);
    let actual = u16::from_be_bytes([frame[body_end], frame[body_end + 1]]);
    if expected != actual {
        return Err(FrameError::Checksum { expected, actual });
    }

    let (command, status) = (frame[1], frame[2]);
    if status != 0 {
        return Err(FrameError::Rejected { command, status });
    }

    let payload = &frame[HEADER_LEN..body_end];
    match Command::from_code(command) {
        Some(Command::GeneralInfo) => parse_general(payload).map(Frame::GeneralInfo),
        Some(Command::CellVoltages) => parse_cells(payload).map(Frame::CellVoltages),
        None => Err(FrameError::UnknownCommand(command)),
    }
}

/// Build a response frame; used by simulators and tests
pub fn encode_response(command: u8, status: u8, payload: &[u8]) -> Vec<u8> {
    let len = u8::try_from(payload.len()).unwrap_or(u8::MAX);
    let payload = &payload[..usize::from(len)];
    let mut out = Vec::with_capacity(payload.len() + HEADER_LEN + FOOTER_LEN);
    out.extend_from_slice(&[START, command, status, len]);
    out.extend_from_slice(payload);
    let chk = checksum(&out[2..]);
    out.extend_from_slice(&chk.to_be_bytes());
    out.push(STOP);
    out
}

/// Reassembles notification chunks into complete frames
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Take the next complete frame out of the buffer.
    ///
    /// Returns `None` while a frame is still incomplete. Garbage in front of
    /// a start byte is dropped and reported as one malformed frame, and so is
    /// a header whose length byte is contradicted by the bytes behind it.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        if self.buf.is_empty() {
            return None;
        }
        if self.buf[0] != START {
            let skip = self.next_start(0).unwrap_or(self.buf.len());
            return Some(Err(self.discard(skip, "stray bytes")));
        }
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let total = usize::from(self.buf[3]) + HEADER_LEN + FOOTER_LEN;
        if self.buf.len() >= total && self.buf[total - 1] == STOP {
            let frame: Vec<u8> = self.buf.drain(..total).collect();
            return Some(decode(&frame));
        }

        // Either the declared frame lacks its stop byte, or it is still
        // incomplete. A valid frame starting later means the header lied.
        if let Some(at) = self.embedded_frame() {
            return Some(Err(self.discard(at, "bytes behind a bad header")));
        }
        if self.buf.len() >= total {
            let skip = self.next_start(0).unwrap_or(self.buf.len());
            return Some(Err(self.discard(skip, "bytes of an unterminated frame")));
        }
        None
    }

    /// First start byte after `from`
    fn next_start(&self, from: usize) -> Option<usize> {
        self.buf
            .iter()
            .skip(from + 1)
            .position(|&b| b == START)
            .map(|i| i + from + 1)
    }

    /// Offset of a complete, checksum-valid frame after the first byte
    fn embedded_frame(&self) -> Option<usize> {
        let mut from = 0;
        while let Some(at) = self.next_start(from) {
            let rest = &self.buf[at..];
            if rest.len() >= HEADER_LEN && Command::from_code(rest[1]).is_some() {
                let total = usize::from(rest[3]) + HEADER_LEN + FOOTER_LEN;
                if rest.len() >= total && decode(&rest[..total]).is_ok() {
                    return Some(at);
                }
            }
            from = at;
        }
        None
    }

    fn discard(&mut self, count: usize, what: &str) -> FrameError {
        let dropped: Vec<u8> = self.buf.drain(..count).collect();
        FrameError::malformed(format!(
            "discarded {} {}: {}",
            dropped.len(),
            what,
            hex::encode(&dropped)
        ))
    }
}
