// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{
    cancel, check_frame, parse_header_block, send, FileInfo, Serial,
    SerialError, TransferError, ACK, BLOCK_LARGE, BLOCK_SMALL,
    BYTE_TIMEOUT_MS, CAN, CAN_COUNT, CRC_REQUEST, EOT, MAX_RETRIES, NAK,
    NAME_MAX, POLL_INTERVAL_MS, SOH, START_TIMEOUT_MS, STX,
};
use drv_flash_api::{erase_range, Flash};
use ringbuf::{ringbuf, ringbuf_entry};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Poll,
    Opened { len: u32 },
    Block { seq: u8, offset: u32 },
    Duplicate { seq: u8 },
    Nak { expected: u8, errors: u8 },
    Eot,
    CancelByte { count: u8 },
    Closed,
    Done { len: u32 },
    Failed(TransferError),
}

ringbuf!(Trace, 32, Trace::None);

/// A file received into flash.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Received {
    pub name: heapless::Vec<u8, NAME_MAX>,
    /// Declared size; this many bytes were written at the destination.
    pub len: u32,
}

enum Packet {
    Block { seq: u8, len: usize },
    Eot,
    Cancel,
}

enum PacketError {
    Timeout,
    /// Unknown start byte, or a block that failed its checks.
    Bad,
    Serial(SerialError),
}

fn read(serial: &mut impl Serial, timeout_ms: u32) -> Result<u8, PacketError> {
    serial.read_byte(timeout_ms).map_err(|e| match e {
        SerialError::Timeout => PacketError::Timeout,
        e => PacketError::Serial(e),
    })
}

fn read_packet(
    serial: &mut impl Serial,
    buf: &mut [u8; BLOCK_LARGE],
    timeout_ms: u32,
) -> Result<Packet, PacketError> {
    let len = match read(serial, timeout_ms)? {
        SOH => BLOCK_SMALL,
        STX => BLOCK_LARGE,
        EOT => return Ok(Packet::Eot),
        CAN => return Ok(Packet::Cancel),
        _ => return Err(PacketError::Bad),
    };
    let seq = read(serial, BYTE_TIMEOUT_MS)?;
    let inv = read(serial, BYTE_TIMEOUT_MS)?;
    for b in &mut buf[..len] {
        *b = read(serial, BYTE_TIMEOUT_MS)?;
    }
    let crc = [
        read(serial, BYTE_TIMEOUT_MS)?,
        read(serial, BYTE_TIMEOUT_MS)?,
    ];
    check_frame(seq, inv, &buf[..len], crc)
        .map(|seq| Packet::Block { seq, len })
        .ok_or(PacketError::Bad)
}

/// Receives one file over `serial` into flash at `dest`.
///
/// The destination is erased (in whole sectors) once the size is known;
/// files larger than `capacity` are refused before anything is erased. On
/// any failure the sender is cancelled and whatever was written must be
/// treated as garbage.
pub fn receive(
    serial: &mut impl Serial,
    flash: &mut impl Flash,
    dest: u32,
    capacity: u32,
) -> Result<Received, TransferError> {
    let r = session(serial, flash, dest, capacity);
    match &r {
        Ok(rx) => ringbuf_entry!(Trace::Done { len: rx.len }),
        Err(e) => {
            ringbuf_entry!(Trace::Failed(*e));
            if *e != TransferError::Cancelled {
                cancel(serial);
            }
        }
    }
    r
}

fn session(
    serial: &mut impl Serial,
    flash: &mut impl Flash,
    dest: u32,
    capacity: u32,
) -> Result<Received, TransferError> {
    let mut buf = [0u8; BLOCK_LARGE];
    let (name, len) = open(serial, &mut buf)?;
    ringbuf_entry!(Trace::Opened { len });
    if len > capacity {
        return Err(TransferError::TooLarge);
    }
    erase_range(flash, dest, len)?;
    send(serial, &[ACK, CRC_REQUEST])?;

    let mut expected: u8 = 1;
    let mut offset: u32 = 0;
    let mut errors: u8 = 0;
    let mut cans: u8 = 0;
    let mut eot_seen = false;

    loop {
        let packet = match read_packet(serial, &mut buf, BYTE_TIMEOUT_MS) {
            Ok(p) => p,
            Err(PacketError::Serial(e)) => {
                return Err(TransferError::Serial(e));
            }
            Err(PacketError::Timeout | PacketError::Bad) => {
                cans = 0;
                errors += 1;
                ringbuf_entry!(Trace::Nak { expected, errors });
                if errors > MAX_RETRIES {
                    return Err(TransferError::TooManyRetries);
                }
                serial.flush_input();
                send(serial, &[NAK])?;
                continue;
            }
        };
        if !matches!(packet, Packet::Cancel) {
            cans = 0;
        }

        match packet {
            Packet::Block { seq, len: n } if seq == expected => {
                if offset >= len {
                    return Err(TransferError::TooLarge);
                }
                ringbuf_entry!(Trace::Block { seq, offset });
                let take = (n as u32).min(len - offset);
                flash.write(dest + offset, &buf[..take as usize])?;
                offset += take;
                expected = expected.wrapping_add(1);
                errors = 0;
                eot_seen = false;
                send(serial, &[ACK])?;
            }
            Packet::Block { seq, .. } if seq == expected.wrapping_sub(1) => {
                // Our ACK was lost; the data is already in flash.
                ringbuf_entry!(Trace::Duplicate { seq });
                if seq == 0 && offset == 0 {
                    send(serial, &[ACK, CRC_REQUEST])?;
                } else {
                    send(serial, &[ACK])?;
                }
            }
            Packet::Block { .. } => return Err(TransferError::BadBlock),
            Packet::Eot => {
                ringbuf_entry!(Trace::Eot);
                if eot_seen {
                    send(serial, &[ACK])?;
                    break;
                }
                eot_seen = true;
                send(serial, &[NAK])?;
            }
            Packet::Cancel => {
                cans += 1;
                ringbuf_entry!(Trace::CancelByte { count: cans });
                if cans >= CAN_COUNT {
                    return Err(TransferError::Cancelled);
                }
            }
        }
    }

    if offset < len {
        return Err(TransferError::Incomplete);
    }
    close(serial, &mut buf)?;
    Ok(Received { name, len })
}

/// Polls for block 0 and returns the file name and size from it.
fn open(
    serial: &mut impl Serial,
    buf: &mut [u8; BLOCK_LARGE],
) -> Result<(heapless::Vec<u8, NAME_MAX>, u32), TransferError> {
    let mut cans = 0;
    for _ in 0..START_TIMEOUT_MS / POLL_INTERVAL_MS {
        ringbuf_entry!(Trace::Poll);
        send(serial, &[CRC_REQUEST])?;
        match read_packet(serial, buf, POLL_INTERVAL_MS) {
            Ok(Packet::Block { seq: 0, len }) => {
                return match parse_header_block(&buf[..len])? {
                    FileInfo::File { name, len } => Ok((name, len)),
                    FileInfo::End => Err(TransferError::BadBlock),
                };
            }
            Ok(Packet::Cancel) => {
                cans += 1;
                if cans >= CAN_COUNT {
                    return Err(TransferError::Cancelled);
                }
                continue;
            }
            Err(PacketError::Serial(e)) => {
                return Err(TransferError::Serial(e));
            }
            _ => serial.flush_input(),
        }
        cans = 0;
    }
    Err(TransferError::Timeout)
}

/// Waits for the empty block 0 that ends the batch.
///
/// The file is complete by the time this runs, so a sender that never
/// closes the batch is tolerated.
fn close(
    serial: &mut impl Serial,
    buf: &mut [u8; BLOCK_LARGE],
) -> Result<(), TransferError> {
    for _ in 0..MAX_RETRIES {
        send(serial, &[CRC_REQUEST])?;
        match read_packet(serial, buf, BYTE_TIMEOUT_MS) {
            Ok(Packet::Block { seq: 0, .. }) => {
                ringbuf_entry!(Trace::Closed);
                return send(serial, &[ACK]);
            }
            // The sender missed the ACK for its EOT.
            Ok(Packet::Eot) => send(serial, &[ACK])?,
            Err(PacketError::Serial(e)) => {
                return Err(TransferError::Serial(e));
            }
            _ => serial.flush_input(),
        }
    }
    Ok(())
}
