// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trace ring buffers for the boot and upgrade pipeline.
//!
//! The boot stages have no console worth speaking of: the UART is either
//! not yet configured or is busy carrying an image transfer. Instead, each
//! module records typed events into a small static ring buffer that can be
//! read out with a debugger after the fact (or, on the host, by the unit
//! tests).
//!
//! A ring buffer is declared once per module:
//!
//! ```ignore
//! #[derive(Copy, Clone, Debug, PartialEq)]
//! enum Trace {
//!     None,
//!     Erase { addr: u32 },
//! }
//!
//! ringbuf!(Trace, 16, Trace::None);
//! ```
//!
//! and entries are added with [`ringbuf_entry!`]:
//!
//! ```ignore
//! ringbuf_entry!(Trace::Erase { addr });
//! ```
//!
//! An entry recorded from the same line with the same payload as the most
//! recent one does not consume a new slot; the `count` of that slot is
//! bumped instead. A polling loop therefore shows up as one entry with a
//! large count rather than flushing everything else out of the buffer.
//!
//! Payloads must be `Copy + PartialEq`. Enabling the `disabled` feature
//! keeps every declaration and call site compiling but records nothing.

#![cfg_attr(not(test), no_std)]

/// Re-exported so that macro expansions can always name the lock type.
pub use spin::Mutex;

/// Declares a ring buffer in the current module.
///
/// `ringbuf!(NAME, Type, N, init)` declares a static named `NAME` holding
/// `N` entries of `Type`, each initialized to `init`. Omitting the name
/// declares `__RINGBUF`, which is what the one-argument form of
/// [`ringbuf_entry!`] uses.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::Mutex<$crate::Ringbuf<$t, $n>> =
            $crate::Mutex::new($crate::Ringbuf {
                last: None,
                buffer: [$crate::RingbufEntry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: $init,
                }; $n],
            });
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
    ($t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
}

/// Records `payload` into a ring buffer declared with [`ringbuf!`].
///
/// `ringbuf_entry!(NAME, payload)` records into `NAME`; the single-argument
/// form records into the module's `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate the payload before taking the lock, so that a payload
        // expression that itself records an entry cannot deadlock.
        let p = $payload;
        $crate::Ringbuf::entry(&mut *$buf.lock(), line!() as u16, p);
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

/// One slot of a [`Ringbuf`].
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// A fixed-size ring of trace entries. Normally declared through
/// [`ringbuf!`] rather than built by hand.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub fn entry(&mut self, line: u16, payload: T) {
        // `None` is treated as an out-of-range index so the first entry lands
        // in slot 0 and never merges with the initializer entries.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(count) = ent.count.checked_add(1) {
                    ent.count = count;
                    return;
                }
            }
        }

        let next = last.wrapping_add(1);
        let ndx = if next >= N { 0 } else { next };

        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };
        self.last = Some(ndx);
    }

    /// The most recently recorded entry, if any.
    pub fn latest(&self) -> Option<&RingbufEntry<T>> {
        self.last.and_then(|i| self.buffer.get(i))
    }

    /// Iterates over recorded entries from oldest to newest, skipping slots
    /// that have never been written.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = match self.last {
            Some(last) => last + 1,
            None => N,
        };
        (0..N)
            .map(move |i| &self.buffer[(start + i) % N])
            .filter(|e| e.count != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq)]
    enum Trace {
        None,
        Poll,
        Byte(u8),
    }

    fn empty<const N: usize>() -> Ringbuf<Trace, N> {
        Ringbuf {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: Trace::None,
            }; N],
        }
    }

    #[test]
    fn repeated_entries_collapse() {
        let mut rb = empty::<4>();
        for _ in 0..10 {
            rb.entry(7, Trace::Poll);
        }
        rb.entry(8, Trace::Byte(1));

        let entries: Vec<_> = rb.iter().map(|e| (e.payload, e.count)).collect();
        assert_eq!(entries, [(Trace::Poll, 10), (Trace::Byte(1), 1)]);
    }

    #[test]
    fn same_payload_different_line_is_distinct() {
        let mut rb = empty::<4>();
        rb.entry(1, Trace::Poll);
        rb.entry(2, Trace::Poll);
        assert_eq!(rb.iter().count(), 2);
    }

    #[test]
    fn wraps_and_keeps_order() {
        let mut rb = empty::<3>();
        for b in 0..5 {
            rb.entry(1, Trace::Byte(b));
        }
        let payloads: Vec<_> = rb.iter().map(|e| e.payload).collect();
        assert_eq!(
            payloads,
            [Trace::Byte(2), Trace::Byte(3), Trace::Byte(4)]
        );
        assert_eq!(rb.latest().map(|e| e.payload), Some(Trace::Byte(4)));
        // slot 0 has been written twice
        assert_eq!(rb.buffer[0].generation, 2);
    }

    ringbuf!(TEST_RINGBUF, Trace, 8, Trace::None);

    #[test]
    fn macro_declared_buffer() {
        ringbuf_entry!(TEST_RINGBUF, Trace::Byte(0xaa));
        let rb = TEST_RINGBUF.lock();
        assert_eq!(rb.latest().map(|e| e.payload), Some(Trace::Byte(0xaa)));
    }
}
