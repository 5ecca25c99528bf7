// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! YMODEM (CRC variant) over a byte-oriented serial port.
//!
//! Two sessions are provided: [`receive`] loads a file from the host into
//! flash, and [`Uploader`] sends a flash region back to the host. Both are
//! synchronous and run to completion; the per-session state lives in a
//! caller-owned [`TransferContext`], so only one transfer can be in flight
//! per context.
//!
//! A block on the wire is
//!
//! ```text
//! SOH|STX  seq  !seq  payload (128|1024)  crc16 (big endian)
//! ```
//!
//! Block 0 carries `name NUL size` and opens the session; an empty block 0
//! after the final EOT closes it.

#![cfg_attr(not(test), no_std)]

use core::fmt::Write;
use crc::{Crc, CRC_16_XMODEM};
use drv_flash_api::FlashError;

mod receive;
mod upload;

pub use receive::{receive, Received};
pub use upload::{TransferContext, UploadState, Uploader};

pub const SOH: u8 = 0x01;
pub const STX: u8 = 0x02;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;
/// Fill for the unused tail of the last data block.
pub const EOF_PAD: u8 = 0x1a;
/// Sent by the receiver to ask for CRC-mode blocks.
pub const CRC_REQUEST: u8 = b'C';

pub const BLOCK_SMALL: usize = 128;
pub const BLOCK_LARGE: usize = 1024;
/// Header, payload and CRC of the largest block.
pub const FRAME_MAX: usize = 3 + BLOCK_LARGE + 2;

pub const START_TIMEOUT_MS: u32 = 10_000;
pub const POLL_INTERVAL_MS: u32 = 1_000;
pub const BYTE_TIMEOUT_MS: u32 = 2_000;

/// Consecutive cancel bytes that end a session.
pub const CAN_COUNT: u8 = 3;
pub const MAX_RETRIES: u8 = 10;

pub const UPLOAD_FILE_NAME: &str = "upload.bin";
pub const NAME_MAX: usize = 64;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SerialError {
    Timeout = 1,
    Io,
}

/// Byte-level serial port.
pub trait Serial {
    /// Waits up to `timeout_ms` for one byte.
    fn read_byte(&mut self, timeout_ms: u32) -> Result<u8, SerialError>;

    fn write(&mut self, bytes: &[u8]) -> Result<(), SerialError>;

    /// Discards anything already received.
    fn flush_input(&mut self);
}

impl<S: Serial + ?Sized> Serial for &mut S {
    fn read_byte(&mut self, timeout_ms: u32) -> Result<u8, SerialError> {
        (**self).read_byte(timeout_ms)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        (**self).write(bytes)
    }

    fn flush_input(&mut self) {
        (**self).flush_input()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferError {
    /// Nobody answered within the start window.
    Timeout,
    /// The other side sent `CAN_COUNT` cancels.
    Cancelled,
    TooManyRetries,
    /// Out-of-sequence block, or an unparseable block 0.
    BadBlock,
    /// The file does not fit the destination.
    TooLarge,
    /// EOT arrived before the declared size was received.
    Incomplete,
    Flash(FlashError),
    Serial(SerialError),
}

impl From<FlashError> for TransferError {
    fn from(e: FlashError) -> Self {
        TransferError::Flash(e)
    }
}

/// Frames `payload` as block `seq`, returning the frame length.
///
/// `payload` must be exactly [`BLOCK_SMALL`] or [`BLOCK_LARGE`] bytes.
pub fn frame(seq: u8, payload: &[u8], out: &mut [u8; FRAME_MAX]) -> usize {
    let start = match payload.len() {
        BLOCK_SMALL => SOH,
        _ => STX,
    };
    let n = payload.len();
    out[0] = start;
    out[1] = seq;
    out[2] = !seq;
    out[3..3 + n].copy_from_slice(payload);
    let crc = CRC16.checksum(payload);
    out[3 + n..5 + n].copy_from_slice(&crc.to_be_bytes());
    5 + n
}

/// Builds the payload of block 0 for a file called `name` of `len` bytes.
/// An empty `name` gives the closing block.
pub fn header_block(
    name: &str,
    len: u32,
    out: &mut [u8; BLOCK_SMALL],
) -> Result<(), TransferError> {
    out.fill(0);
    if name.is_empty() {
        return Ok(());
    }
    let mut size = heapless::String::<12>::new();
    write!(size, "{len}").map_err(|_| TransferError::BadBlock)?;
    let n = name.len();
    if n + 1 + size.len() > BLOCK_SMALL {
        return Err(TransferError::BadBlock);
    }
    out[..n].copy_from_slice(name.as_bytes());
    out[n + 1..n + 1 + size.len()].copy_from_slice(size.as_bytes());
    Ok(())
}

/// What block 0 said.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FileInfo {
    File {
        name: heapless::Vec<u8, NAME_MAX>,
        len: u32,
    },
    /// Empty block 0: no more files.
    End,
}

pub fn parse_header_block(payload: &[u8]) -> Result<FileInfo, TransferError> {
    let nul = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or(TransferError::BadBlock)?;
    if nul == 0 {
        return Ok(FileInfo::End);
    }
    let name = heapless::Vec::from_slice(&payload[..nul])
        .map_err(|_| TransferError::BadBlock)?;
    // The size is decimal, ended by a space (before optional fields) or
    // NUL.
    let rest = &payload[nul + 1..];
    let end = rest
        .iter()
        .position(|&b| b == b' ' || b == 0)
        .unwrap_or(rest.len());
    let len = core::str::from_utf8(&rest[..end])
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or(TransferError::BadBlock)?;
    Ok(FileInfo::File { name, len })
}

/// Checks a received frame body (everything after the start byte) and
/// returns its sequence number.
fn check_frame(seq: u8, inv: u8, payload: &[u8], crc: [u8; 2]) -> Option<u8> {
    (seq == !inv && CRC16.checksum(payload) == u16::from_be_bytes(crc))
        .then_some(seq)
}

fn send(serial: &mut impl Serial, bytes: &[u8]) -> Result<(), TransferError> {
    serial.write(bytes).map_err(TransferError::Serial)
}

fn cancel(serial: &mut impl Serial) {
    // Best effort; the session is over either way.
    let _ = serial.write(&[CAN; CAN_COUNT as usize]);
}
