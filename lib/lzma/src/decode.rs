// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::model::*;
use crate::rc::RangeDecoder;
use crate::{
    get_uncompress_len, mem_detect, Header, LzmaError, Props, ReadAt,
    Workspace, WriteAt,
};
use ringbuf::{ringbuf, ringbuf_entry};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Start { len: u32, dict: u32 },
    EndMarker,
    Done { produced: u32, consumed: u32 },
    Failed { produced: u32, err: LzmaError },
}

ringbuf!(Trace, 8, Trace::None);

/// The dictionary, used as a circular buffer. Output is pushed to the sink
/// each time the buffer wraps, and once more at the end.
struct OutWindow<'a, W: WriteAt + ?Sized> {
    buf: &'a mut [u8],
    pos: usize,
    pending: usize,
    total: u32,
    flushed: u32,
    sink: &'a mut W,
}

impl<W: WriteAt + ?Sized> OutWindow<'_, W> {
    fn put(&mut self, b: u8) -> Result<(), LzmaError> {
        self.buf[self.pos] = b;
        self.pos += 1;
        self.total += 1;
        if self.pos == self.buf.len() {
            self.flush()?;
            self.pos = 0;
            self.pending = 0;
        }
        Ok(())
    }

    /// Byte `dist` positions back; `dist` is at least 1 and has been checked
    /// against what the window holds.
    fn get(&self, dist: usize) -> u8 {
        if dist <= self.pos {
            self.buf[self.pos - dist]
        } else {
            self.buf[self.buf.len() + self.pos - dist]
        }
    }

    fn flush(&mut self) -> Result<(), LzmaError> {
        let chunk = &self.buf[self.pending..self.pos];
        if chunk.is_empty() {
            return Ok(());
        }
        let n = self.sink.write_at(self.flushed, chunk)?;
        if n != chunk.len() {
            return Err(LzmaError::Output);
        }
        self.flushed += n as u32;
        self.pending = self.pos;
        Ok(())
    }
}

struct Decoder<'a, R: ReadAt + ?Sized, W: WriteAt + ?Sized> {
    props: Props,
    dict_size: u32,
    len: u32,
    probs: &'a mut [u16],
    rc: RangeDecoder<'a, R>,
    out: OutWindow<'a, W>,
}

impl<R: ReadAt + ?Sized, W: WriteAt + ?Sized> Decoder<'_, R, W> {
    fn decode_len(
        &mut self,
        base: usize,
        pos_state: usize,
    ) -> Result<usize, LzmaError> {
        let p = &mut self.probs[base..base + LEN_CODER_SIZE];
        let len = if self.rc.bit(&mut p[LEN_CHOICE])? == 0 {
            self.rc.bit_tree(&mut p[LEN_LOW + (pos_state << 3)..], 3)?
        } else if self.rc.bit(&mut p[LEN_CHOICE2])? == 0 {
            LEN_LOW_SYMBOLS as u32
                + self.rc.bit_tree(&mut p[LEN_MID + (pos_state << 3)..], 3)?
        } else {
            (LEN_LOW_SYMBOLS + LEN_MID_SYMBOLS) as u32
                + self.rc.bit_tree(&mut p[LEN_HIGH..], 8)?
        };
        Ok(len as usize + MATCH_MIN_LEN)
    }

    fn decode_literal(
        &mut self,
        state: usize,
        rep0: usize,
    ) -> Result<(), LzmaError> {
        let prev = if self.out.total > 0 { self.out.get(1) } else { 0 };
        let base = literal_coder(self.props, self.out.total, prev);
        let p = &mut self.probs[base..base + LITERAL_CODER_SIZE];

        let mut sym: usize = 1;
        if state >= LIT_STATES {
            let mut match_byte = self.out.get(rep0 + 1);
            while sym < 0x100 {
                let match_bit = usize::from(match_byte >> 7);
                match_byte <<= 1;
                let bit =
                    self.rc.bit(&mut p[((1 + match_bit) << 8) + sym])? as usize;
                sym = (sym << 1) | bit;
                if match_bit != bit {
                    break;
                }
            }
        }
        while sym < 0x100 {
            sym = (sym << 1) | self.rc.bit(&mut p[sym])? as usize;
        }
        self.out.put((sym - 0x100) as u8)
    }

    /// Decodes a match distance, zero-based. `u32::MAX` is the end marker.
    fn decode_distance(&mut self, len: usize) -> Result<u32, LzmaError> {
        let slot_base = POS_SLOT + (len_to_pos_state(len) << 6);
        let slot = self.rc.bit_tree(&mut self.probs[slot_base..], 6)?;
        if slot < 4 {
            return Ok(slot);
        }
        let direct = (slot >> 1) - 1;
        let mut dist = (2 | (slot & 1)) << direct;
        if slot < END_POS_MODEL_INDEX {
            let base = DIST_SPECIAL + (dist - slot) as usize - 1;
            dist += self
                .rc
                .reverse_bit_tree(&mut self.probs[base..], direct)?;
        } else {
            dist = dist.wrapping_add(
                self.rc.direct_bits(direct - ALIGN_BITS)? << ALIGN_BITS,
            );
            dist = dist.wrapping_add(
                self.rc
                    .reverse_bit_tree(&mut self.probs[ALIGN..], ALIGN_BITS)?,
            );
        }
        Ok(dist)
    }

    fn run(&mut self) -> Result<(), LzmaError> {
        let pb_mask = (1u32 << self.props.pb()) - 1;
        let mut state = 0usize;
        let mut reps = [0usize; 4];

        loop {
            let done = self.out.total == self.len;
            if done && self.rc.is_finished_ok() {
                return Ok(());
            }
            let pos_state = (self.out.total & pb_mask) as usize;
            let state_pos = (state << POS_BITS_MAX) + pos_state;

            if self.rc.bit(&mut self.probs[IS_MATCH + state_pos])? == 0 {
                if done {
                    return Err(LzmaError::Corrupt);
                }
                self.decode_literal(state, reps[0])?;
                state = after_literal(state);
                continue;
            }

            let len;
            if self.rc.bit(&mut self.probs[IS_REP + state])? != 0 {
                if done || self.out.total == 0 {
                    return Err(LzmaError::Corrupt);
                }
                if self.rc.bit(&mut self.probs[IS_REP_G0 + state])? == 0 {
                    if self.rc.bit(&mut self.probs[IS_REP0_LONG + state_pos])?
                        == 0
                    {
                        state = after_short_rep(state);
                        let b = self.out.get(reps[0] + 1);
                        self.out.put(b)?;
                        continue;
                    }
                } else {
                    let dist;
                    if self.rc.bit(&mut self.probs[IS_REP_G1 + state])? == 0 {
                        dist = reps[1];
                    } else {
                        if self.rc.bit(&mut self.probs[IS_REP_G2 + state])?
                            == 0
                        {
                            dist = reps[2];
                        } else {
                            dist = reps[3];
                            reps[3] = reps[2];
                        }
                        reps[2] = reps[1];
                    }
                    reps[1] = reps[0];
                    reps[0] = dist;
                }
                len = self.decode_len(REP_LEN_CODER, pos_state)?;
                state = after_rep(state);
            } else {
                reps[3] = reps[2];
                reps[2] = reps[1];
                reps[1] = reps[0];
                len = self.decode_len(LEN_CODER, pos_state)?;
                state = after_match(state);
                let dist = self.decode_distance(len)?;
                if dist == u32::MAX {
                    ringbuf_entry!(Trace::EndMarker);
                    if !self.rc.is_finished_ok() {
                        return Err(LzmaError::Corrupt);
                    }
                    if !done {
                        return Err(LzmaError::SizeMismatch);
                    }
                    return Ok(());
                }
                if done
                    || dist >= self.dict_size
                    || dist >= self.out.total
                    || dist as usize >= self.out.buf.len()
                {
                    return Err(LzmaError::Corrupt);
                }
                reps[0] = dist as usize;
            }

            if ((self.len - self.out.total) as usize) < len {
                return Err(LzmaError::Corrupt);
            }
            for _ in 0..len {
                let b = self.out.get(reps[0] + 1);
                self.out.put(b)?;
            }
        }
    }
}

/// Decompresses the stream described by `header`.
///
/// `input` offsets count from the first byte after the header. Output is
/// written to `output` starting at offset 0. On success the number of bytes
/// produced is returned; it always equals [`get_uncompress_len`]. On
/// failure some prefix of the output may already have been written and must
/// not be trusted.
pub fn decompress(
    header: &[u8],
    ws: Workspace<'_>,
    input: &mut (impl ReadAt + ?Sized),
    output: &mut (impl WriteAt + ?Sized),
) -> Result<u32, LzmaError> {
    let h = Header::parse(header)?;
    let len = get_uncompress_len(header)?;
    let need = mem_detect(header)?;
    let Workspace { probs, dict } = ws;
    if probs.len() < need.probs || dict.len() < need.dict {
        return Err(LzmaError::Workspace);
    }
    ringbuf_entry!(Trace::Start {
        len,
        dict: need.dict as u32,
    });

    let probs = &mut probs[..need.probs];
    probs.fill(PROB_INIT);
    let mut d = Decoder {
        props: h.props,
        dict_size: h.effective_dict_size(),
        len,
        probs,
        rc: RangeDecoder::new(input)?,
        out: OutWindow {
            buf: &mut dict[..need.dict],
            pos: 0,
            pending: 0,
            total: 0,
            flushed: 0,
            sink: output,
        },
    };

    let r = d.run().and_then(|()| d.out.flush());
    match r {
        Ok(()) => {
            ringbuf_entry!(Trace::Done {
                produced: d.out.total,
                consumed: d.rc.consumed(),
            });
            Ok(d.out.total)
        }
        Err(err) => {
            ringbuf_entry!(Trace::Failed {
                produced: d.out.total,
                err,
            });
            Err(err)
        }
    }
}
