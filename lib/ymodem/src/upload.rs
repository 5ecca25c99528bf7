// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{
    cancel, frame, header_block, Serial, SerialError, TransferError, ACK,
    BLOCK_LARGE, BLOCK_SMALL, BYTE_TIMEOUT_MS, CAN, CAN_COUNT, CRC_REQUEST,
    EOF_PAD, EOT, FRAME_MAX, MAX_RETRIES, NAK, POLL_INTERVAL_MS,
    START_TIMEOUT_MS, UPLOAD_FILE_NAME,
};
use drv_flash_api::Flash;
use ringbuf::{ringbuf, ringbuf_entry};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    State(UploadState),
    Sent { seq: u8, offset: u32 },
    Retry { state: UploadState, retries: u8 },
    CancelByte { count: u8 },
    Done { len: u32 },
    Failed(TransferError),
}

ringbuf!(Trace, 32, Trace::None);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UploadState {
    /// No session, or the last one finished.
    None,
    WaitStartC,
    WaitInitAck,
    WaitTransC,
    WaitInterAck,
    WaitFinalAck,
    WaitEotC,
    WaitZeroAck,
}

/// State of one upload session.
///
/// The context holds the last frame sent so it can be repeated on NAK or
/// timeout without going back to flash.
pub struct TransferContext {
    state: UploadState,
    addr: u32,
    len: u32,
    /// Bytes acknowledged by the receiver.
    acked: u32,
    /// Payload bytes carried by the frame in flight.
    in_flight: u32,
    seq: u8,
    retries: u8,
    cans: u8,
    waited_ms: u32,
    frame: [u8; FRAME_MAX],
    frame_len: usize,
}

impl TransferContext {
    pub const fn new() -> Self {
        Self {
            state: UploadState::None,
            addr: 0,
            len: 0,
            acked: 0,
            in_flight: 0,
            seq: 0,
            retries: 0,
            cans: 0,
            waited_ms: 0,
            frame: [0; FRAME_MAX],
            frame_len: 0,
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Bytes the receiver has acknowledged so far.
    pub fn acked(&self) -> u32 {
        self.acked
    }
}

impl Default for TransferContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends `len` bytes of flash at `addr` to the host as `upload.bin`.
pub struct Uploader<'a, S: Serial, F: Flash> {
    serial: &'a mut S,
    flash: &'a mut F,
    ctx: &'a mut TransferContext,
}

impl<'a, S: Serial, F: Flash> Uploader<'a, S, F> {
    /// Starts a session, discarding whatever `ctx` held.
    pub fn new(
        serial: &'a mut S,
        flash: &'a mut F,
        ctx: &'a mut TransferContext,
        addr: u32,
        len: u32,
    ) -> Self {
        *ctx = TransferContext {
            state: UploadState::WaitStartC,
            addr,
            len,
            ..TransferContext::new()
        };
        Self { serial, flash, ctx }
    }

    pub fn state(&self) -> UploadState {
        self.ctx.state
    }

    /// Runs the session to completion, returning the number of bytes sent.
    pub fn run(mut self) -> Result<u32, TransferError> {
        loop {
            if let Some(n) = self.step()? {
                return Ok(n);
            }
        }
    }

    /// Waits for one byte from the receiver and reacts to it. Returns the
    /// file length once the session has closed.
    pub fn step(&mut self) -> Result<Option<u32>, TransferError> {
        let r = self.advance();
        match r {
            Ok(Some(len)) => ringbuf_entry!(Trace::Done { len }),
            Err(e) => {
                ringbuf_entry!(Trace::Failed(e));
                if e != TransferError::Cancelled {
                    cancel(&mut *self.serial);
                }
                self.ctx.state = UploadState::None;
            }
            Ok(None) => (),
        }
        r
    }

    fn advance(&mut self) -> Result<Option<u32>, TransferError> {
        use UploadState::*;

        let timeout = match self.ctx.state {
            None => return Ok(Some(self.ctx.acked)),
            WaitStartC => POLL_INTERVAL_MS,
            _ => BYTE_TIMEOUT_MS,
        };
        let byte = match self.serial.read_byte(timeout) {
            Ok(b) => Some(b),
            Err(SerialError::Timeout) => Option::None,
            Err(e) => return Err(TransferError::Serial(e)),
        };

        if byte == Some(CAN) {
            self.ctx.cans += 1;
            ringbuf_entry!(Trace::CancelByte {
                count: self.ctx.cans
            });
            if self.ctx.cans >= CAN_COUNT {
                return Err(TransferError::Cancelled);
            }
            return Ok(Option::None);
        }
        if byte.is_some() {
            self.ctx.cans = 0;
        }

        match (self.ctx.state, byte) {
            (WaitStartC, Some(CRC_REQUEST)) => {
                let mut b0 = [0; BLOCK_SMALL];
                header_block(UPLOAD_FILE_NAME, self.ctx.len, &mut b0)?;
                self.ctx.frame_len = frame(0, &b0, &mut self.ctx.frame);
                self.transmit()?;
                self.enter(WaitInitAck);
            }
            (WaitStartC, Option::None) => {
                self.ctx.waited_ms += POLL_INTERVAL_MS;
                if self.ctx.waited_ms >= START_TIMEOUT_MS {
                    return Err(TransferError::Timeout);
                }
            }
            (WaitInitAck, Some(ACK)) => {
                self.ctx.seq = 1;
                self.enter(WaitTransC);
            }
            (WaitTransC, Some(CRC_REQUEST | NAK)) => {
                self.send_next()?;
            }
            (WaitInterAck, Some(ACK)) => {
                self.ctx.acked += self.ctx.in_flight;
                self.ctx.seq = self.ctx.seq.wrapping_add(1);
                self.send_next()?;
            }
            (WaitFinalAck, Some(ACK)) => self.enter(WaitEotC),
            (WaitEotC, Some(CRC_REQUEST)) => {
                let closing = [0; BLOCK_SMALL];
                self.ctx.frame_len = frame(0, &closing, &mut self.ctx.frame);
                self.transmit()?;
                self.enter(WaitZeroAck);
            }
            (WaitZeroAck, Some(ACK)) => {
                self.enter(None);
                return Ok(Some(self.ctx.acked));
            }
            // A block or EOT we sent was lost or damaged.
            (
                WaitInitAck | WaitInterAck | WaitFinalAck | WaitZeroAck,
                Some(NAK | CRC_REQUEST) | Option::None,
            ) => {
                self.retry()?;
                self.transmit()?;
            }
            (WaitTransC | WaitEotC, Option::None) => self.retry()?,
            // Anything else is line noise.
            _ => (),
        }
        Ok(Option::None)
    }

    fn enter(&mut self, state: UploadState) {
        ringbuf_entry!(Trace::State(state));
        self.ctx.state = state;
        self.ctx.retries = 0;
    }

    fn retry(&mut self) -> Result<(), TransferError> {
        self.ctx.retries += 1;
        ringbuf_entry!(Trace::Retry {
            state: self.ctx.state,
            retries: self.ctx.retries,
        });
        if self.ctx.retries > MAX_RETRIES {
            return Err(TransferError::TooManyRetries);
        }
        Ok(())
    }

    fn transmit(&mut self) -> Result<(), TransferError> {
        let f = &self.ctx.frame[..self.ctx.frame_len];
        self.serial.write(f).map_err(TransferError::Serial)
    }

    /// Sends the block after the acknowledged data, or EOT when there is
    /// none left.
    fn send_next(&mut self) -> Result<(), TransferError> {
        let remaining = self.ctx.len - self.ctx.acked;
        if remaining == 0 {
            self.ctx.in_flight = 0;
            self.ctx.frame[0] = EOT;
            self.ctx.frame_len = 1;
            self.transmit()?;
            self.enter(UploadState::WaitFinalAck);
            return Ok(());
        }

        let size = if remaining > BLOCK_SMALL as u32 {
            BLOCK_LARGE
        } else {
            BLOCK_SMALL
        };
        let n = remaining.min(size as u32);
        let mut payload = [EOF_PAD; BLOCK_LARGE];
        self.flash.read(
            self.ctx.addr + self.ctx.acked,
            &mut payload[..n as usize],
        )?;
        self.ctx.frame_len =
            frame(self.ctx.seq, &payload[..size], &mut self.ctx.frame);
        self.ctx.in_flight = n;
        ringbuf_entry!(Trace::Sent {
            seq: self.ctx.seq,
            offset: self.ctx.acked,
        });
        self.transmit()?;
        self.enter(UploadState::WaitInterAck);
        Ok(())
    }
}
