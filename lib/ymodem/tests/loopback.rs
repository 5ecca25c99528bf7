// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The uploader and the receiver talking to each other over a pair of
//! in-memory pipes, one thread each.

use drv_flash_api::RamFlash;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;
use ymodem::*;

#[derive(Default)]
struct Pipe {
    q: Mutex<VecDeque<u8>>,
    cv: Condvar,
}

struct End<'a> {
    rx: &'a Pipe,
    tx: &'a Pipe,
    /// Damage the payload of every n-th full-size frame sent.
    damage_every: Option<usize>,
    large_frames: usize,
}

impl<'a> End<'a> {
    fn new(rx: &'a Pipe, tx: &'a Pipe) -> Self {
        Self {
            rx,
            tx,
            damage_every: None,
            large_frames: 0,
        }
    }
}

impl Serial for End<'_> {
    fn read_byte(&mut self, timeout_ms: u32) -> Result<u8, SerialError> {
        // Protocol timeouts are scaled down to keep the test quick.
        let wait = Duration::from_millis(u64::from(timeout_ms) / 10);
        let q = self.rx.q.lock().unwrap();
        let (mut q, _) = self
            .rx
            .cv
            .wait_timeout_while(q, wait, |q| q.is_empty())
            .unwrap();
        q.pop_front().ok_or(SerialError::Timeout)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        let mut bytes = bytes.to_vec();
        if bytes.len() == FRAME_MAX {
            self.large_frames += 1;
            if let Some(n) = self.damage_every {
                if self.large_frames % n == 0 {
                    bytes[100] ^= 0x40;
                }
            }
        }
        self.tx.q.lock().unwrap().extend(bytes);
        self.tx.cv.notify_all();
        Ok(())
    }

    fn flush_input(&mut self) {
        self.rx.q.lock().unwrap().clear();
    }
}

fn file(len: usize) -> Vec<u8> {
    let mut x = 0x2545_f491u32;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x as u8
        })
        .collect()
}

const SRC: u32 = 0x1000;
const DEST: u32 = 0x4000;

fn transfer(len: usize, damage_every: Option<usize>) {
    let data = file(len);
    let mut src_mem = vec![0xff; 0x10000];
    src_mem[SRC as usize..][..len].copy_from_slice(&data);
    let mut dst_mem = vec![0u8; 0x10000];

    let to_host = Pipe::default();
    let to_device = Pipe::default();

    let (sent, got) = std::thread::scope(|s| {
        let up = s.spawn(|| {
            let mut serial = End::new(&to_device, &to_host);
            serial.damage_every = damage_every;
            let mut flash = RamFlash::new(0, &mut src_mem);
            let mut ctx = TransferContext::new();
            Uploader::new(&mut serial, &mut flash, &mut ctx, SRC, len as u32)
                .run()
        });
        let down = s.spawn(|| {
            let mut serial = End::new(&to_host, &to_device);
            let mut flash = RamFlash::new(0, &mut dst_mem);
            receive(&mut serial, &mut flash, DEST, 0x8000)
        });
        (up.join().unwrap(), down.join().unwrap())
    });

    assert_eq!(sent, Ok(len as u32));
    let got = got.unwrap();
    assert_eq!(got.name.as_slice(), UPLOAD_FILE_NAME.as_bytes());
    assert_eq!(got.len as usize, len);
    assert_eq!(&dst_mem[DEST as usize..][..len], &data[..]);
}

#[test]
fn clean_line() {
    transfer(5000, None);
}

#[test]
fn empty_file() {
    transfer(0, None);
}

#[test]
fn exact_block_multiple() {
    transfer(3 * BLOCK_LARGE, None);
}

#[test]
fn damaged_blocks_are_resent() {
    transfer(9000, Some(3));
}
