// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small greedy LZMA encoder.
//!
//! This is what the packager uses to build compressed upgrade sections. It
//! favors being simple and deterministic over ratio: one hash chain over
//! three-byte prefixes, no optimal parsing, and only `rep0` among the repeat
//! distances.

use crate::model::*;
use crate::rc::RangeEncoder;
use crate::{Header, Props};

/// Window the encoder searches, and the dictionary size it records.
pub const ENCODER_DICT_SIZE: u32 = 1 << WINDOW_BITS;

const WINDOW_BITS: u32 = 14;
const WINDOW: usize = 1 << WINDOW_BITS;
const HASH_BITS: u32 = 13;
const MAX_CHAIN: usize = 32;

struct MatchFinder<'a> {
    data: &'a [u8],
    /// Most recent position + 1 per hash bucket; zero is empty.
    head: [u32; 1 << HASH_BITS],
    /// Previous position + 1 with the same hash, indexed by position.
    prev: [u32; WINDOW],
}

impl<'a> MatchFinder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            head: [0; 1 << HASH_BITS],
            prev: [0; WINDOW],
        }
    }

    fn hash(&self, pos: usize) -> usize {
        let d = self.data;
        let v = u32::from(d[pos]) << 16
            | u32::from(d[pos + 1]) << 8
            | u32::from(d[pos + 2]);
        (v.wrapping_mul(2654435761) >> (32 - HASH_BITS)) as usize
    }

    fn insert(&mut self, pos: usize) {
        if pos + 3 <= self.data.len() {
            let h = self.hash(pos);
            self.prev[pos & (WINDOW - 1)] = self.head[h];
            self.head[h] = pos as u32 + 1;
        }
    }

    fn match_len(&self, a: usize, b: usize, max: usize) -> usize {
        self.data[a..]
            .iter()
            .zip(&self.data[b..])
            .take(max)
            .take_while(|(x, y)| x == y)
            .count()
    }

    /// Longest earlier match for `pos`, as `(len, distance)`.
    fn longest(&self, pos: usize, max: usize) -> (usize, usize) {
        let mut best = (0, 0);
        if pos + 3 > self.data.len() {
            return best;
        }
        let mut cand = self.head[self.hash(pos)] as usize;
        for _ in 0..MAX_CHAIN {
            if cand == 0 {
                break;
            }
            let c = cand - 1;
            let dist = pos - c;
            if dist > WINDOW {
                break;
            }
            let len = self.match_len(c, pos, max);
            if len > best.0 {
                best = (len, dist);
            }
            if len == max {
                break;
            }
            let next = self.prev[c & (WINDOW - 1)] as usize;
            // Older entries have been overwritten once this stops
            // decreasing.
            if next == 0 || next - 1 >= c {
                break;
            }
            cand = next;
        }
        best
    }
}

struct Encoder<F> {
    rc: RangeEncoder<F>,
    probs: [u16; PROBS_MAX],
    props: Props,
    state: usize,
}

impl<E, F: FnMut(&[u8]) -> Result<(), E>> Encoder<F> {
    fn len(
        &mut self,
        base: usize,
        pos_state: usize,
        len: usize,
    ) -> Result<(), E> {
        let p = &mut self.probs[base..base + LEN_CODER_SIZE];
        let l = (len - MATCH_MIN_LEN) as u32;
        if l < LEN_LOW_SYMBOLS as u32 {
            self.rc.bit(&mut p[LEN_CHOICE], 0)?;
            self.rc.bit_tree(&mut p[LEN_LOW + (pos_state << 3)..], 3, l)
        } else if l < (LEN_LOW_SYMBOLS + LEN_MID_SYMBOLS) as u32 {
            self.rc.bit(&mut p[LEN_CHOICE], 1)?;
            self.rc.bit(&mut p[LEN_CHOICE2], 0)?;
            self.rc.bit_tree(
                &mut p[LEN_MID + (pos_state << 3)..],
                3,
                l - LEN_LOW_SYMBOLS as u32,
            )
        } else {
            self.rc.bit(&mut p[LEN_CHOICE], 1)?;
            self.rc.bit(&mut p[LEN_CHOICE2], 1)?;
            self.rc.bit_tree(
                &mut p[LEN_HIGH..],
                8,
                l - (LEN_LOW_SYMBOLS + LEN_MID_SYMBOLS) as u32,
            )
        }
    }

    fn literal(
        &mut self,
        pos: usize,
        prev: u8,
        byte: u8,
        match_byte: Option<u8>,
    ) -> Result<(), E> {
        let pos_state = pos & ((1usize << self.props.pb()) - 1);
        let state_pos = (self.state << POS_BITS_MAX) + pos_state;
        self.rc.bit(&mut self.probs[IS_MATCH + state_pos], 0)?;

        let base = literal_coder(self.props, pos as u32, prev);
        let p = &mut self.probs[base..base + LITERAL_CODER_SIZE];
        let mut sym = 1usize;
        let mut matched = match_byte;
        for i in (0..8).rev() {
            let bit = u32::from(byte >> i) & 1;
            match matched {
                Some(mb) => {
                    let mbit = (u32::from(mb) >> i) & 1;
                    let idx = ((1 + mbit as usize) << 8) + sym;
                    self.rc.bit(&mut p[idx], bit)?;
                    if mbit != bit {
                        matched = None;
                    }
                }
                None => self.rc.bit(&mut p[sym], bit)?,
            }
            sym = (sym << 1) | bit as usize;
        }
        self.state = after_literal(self.state);
        Ok(())
    }

    fn rep0(&mut self, pos_state: usize, len: usize) -> Result<(), E> {
        let s = self.state;
        let state_pos = (s << POS_BITS_MAX) + pos_state;
        self.rc.bit(&mut self.probs[IS_MATCH + state_pos], 1)?;
        self.rc.bit(&mut self.probs[IS_REP + s], 1)?;
        self.rc.bit(&mut self.probs[IS_REP_G0 + s], 0)?;
        self.rc.bit(&mut self.probs[IS_REP0_LONG + state_pos], 1)?;
        self.len(REP_LEN_CODER, pos_state, len)?;
        self.state = after_rep(s);
        Ok(())
    }

    /// Encodes a new match; `dist` is zero-based.
    fn matched(
        &mut self,
        pos_state: usize,
        len: usize,
        dist: u32,
    ) -> Result<(), E> {
        let s = self.state;
        let state_pos = (s << POS_BITS_MAX) + pos_state;
        self.rc.bit(&mut self.probs[IS_MATCH + state_pos], 1)?;
        self.rc.bit(&mut self.probs[IS_REP + s], 0)?;
        self.len(LEN_CODER, pos_state, len)?;
        self.state = after_match(s);

        let slot = if dist < 4 {
            dist
        } else {
            let n = 31 - dist.leading_zeros();
            (n << 1) | ((dist >> (n - 1)) & 1)
        };
        let slot_base = POS_SLOT + (len_to_pos_state(len) << 6);
        self.rc.bit_tree(&mut self.probs[slot_base..], 6, slot)?;
        if slot >= 4 {
            let footer = (slot >> 1) - 1;
            let base = (2 | (slot & 1)) << footer;
            let reduced = dist - base;
            if slot < END_POS_MODEL_INDEX {
                let at = DIST_SPECIAL + (base - slot) as usize - 1;
                self.rc.reverse_bit_tree(
                    &mut self.probs[at..],
                    footer,
                    reduced,
                )?;
            } else {
                self.rc
                    .direct_bits(reduced >> ALIGN_BITS, footer - ALIGN_BITS)?;
                self.rc.reverse_bit_tree(
                    &mut self.probs[ALIGN..],
                    ALIGN_BITS,
                    reduced & ((1 << ALIGN_BITS) - 1),
                )?;
            }
        }
        Ok(())
    }
}

/// Compresses `input`, handing the header and then the stream to `out` in
/// pieces.
///
/// The header records the exact input length, so the stream carries no end
/// marker.
pub fn compress<E>(
    input: &[u8],
    props: Props,
    mut out: impl FnMut(&[u8]) -> Result<(), E>,
) -> Result<(), E> {
    let header = Header {
        props,
        dict_size: ENCODER_DICT_SIZE,
        uncompressed_size: input.len() as u64,
    };
    out(&header.to_bytes())?;

    let mut mf = MatchFinder::new(input);
    let mut enc = Encoder {
        rc: RangeEncoder::new(out),
        probs: [PROB_INIT; PROBS_MAX],
        props,
        state: 0,
    };
    let pb_mask = (1usize << props.pb()) - 1;
    let mut rep0 = 0usize;
    let mut pos = 0;

    while pos < input.len() {
        let max = MATCH_MAX_LEN.min(input.len() - pos);
        let pos_state = pos & pb_mask;
        let (best_len, best_dist) = mf.longest(pos, max);
        let rep_len = if pos > rep0 {
            mf.match_len(pos - rep0 - 1, pos, max)
        } else {
            0
        };

        let len = if rep_len >= MATCH_MIN_LEN && rep_len + 1 >= best_len {
            enc.rep0(pos_state, rep_len)?;
            rep_len
        } else if best_len >= 3 {
            rep0 = best_dist - 1;
            enc.matched(pos_state, best_len, rep0 as u32)?;
            best_len
        } else {
            let prev = if pos > 0 { input[pos - 1] } else { 0 };
            let match_byte = (enc.state >= LIT_STATES)
                .then(|| input[pos - rep0 - 1]);
            enc.literal(pos, prev, input[pos], match_byte)?;
            1
        };

        for i in pos..pos + len {
            mf.insert(i);
        }
        pos += len;
    }
    enc.rc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(data: &[u8]) -> Vec<u8> {
        let mut out = vec![];
        compress(data, Props::DEFAULT, |b| {
            out.extend_from_slice(b);
            Ok::<_, ()>(())
        })
        .unwrap();
        out
    }

    fn unpacked(file: &[u8]) -> Vec<u8> {
        let need = crate::mem_detect(file).unwrap();
        let mut probs = vec![0u16; need.probs];
        let mut dict = vec![0u8; need.dict];
        let len = crate::get_uncompress_len(file).unwrap();
        let mut out = vec![0u8; len as usize];
        crate::decompress(
            file,
            crate::Workspace {
                probs: &mut probs,
                dict: &mut dict,
            },
            &mut &file[crate::HEADER_LEN..],
            &mut out[..],
        )
        .unwrap();
        out
    }

    #[test]
    fn literals_are_flagged_as_literals() {
        assert_eq!(unpacked(&packed(&[1])), [1]);
        let text = b"hello hello hello hello!";
        assert_eq!(unpacked(&packed(text)), text);
    }

    #[test]
    fn header_records_length_and_window() {
        let file = packed(&[7; 1000]);
        let h = Header::parse(&file).unwrap();
        assert_eq!(h.uncompressed_size, 1000);
        assert_eq!(h.dict_size, ENCODER_DICT_SIZE);
        assert_eq!(h.props, Props::DEFAULT);
        // a run this long is mostly one rep0
        assert!(file.len() < 40);
    }

    #[test]
    fn sink_errors_propagate() {
        let mut calls = 0;
        let r = compress(&[1, 2, 3], Props::DEFAULT, |_| {
            calls += 1;
            if calls > 1 {
                Err("full")
            } else {
                Ok(())
            }
        });
        assert_eq!(r, Err("full"));
    }

    #[test]
    fn match_finder_prefers_longest() {
        let data = b"abcdXabcdefYabcdefg";
        let mut mf = MatchFinder::new(data);
        for i in 0..12 {
            mf.insert(i);
        }
        assert_eq!(mf.longest(12, data.len() - 12), (6, 7));
    }
}
