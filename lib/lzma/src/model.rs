// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Probability table layout and the coder state machine shared by the
//! encoder and decoder.
//!
//! All adaptive probabilities live in one flat `[u16]`. The offsets below
//! carve it up; the literal coders take the tail, `0x300` slots per literal
//! context.

use crate::Props;

pub const NUM_STATES: usize = 12;
pub const POS_BITS_MAX: usize = 4;
pub const LEN_TO_POS_STATES: usize = 4;
pub const END_POS_MODEL_INDEX: u32 = 14;
pub const FULL_DISTANCES: usize = 1 << (END_POS_MODEL_INDEX >> 1);
pub const ALIGN_BITS: u32 = 4;
pub const MATCH_MIN_LEN: usize = 2;
pub const MATCH_MAX_LEN: usize = MATCH_MIN_LEN + 16 + 256 - 1;
/// States at or above this one follow a match or rep.
pub const LIT_STATES: usize = 7;

pub const PROB_INIT: u16 = 1 << 10;

pub const IS_MATCH: usize = 0;
pub const IS_REP: usize = IS_MATCH + (NUM_STATES << POS_BITS_MAX);
pub const IS_REP_G0: usize = IS_REP + NUM_STATES;
pub const IS_REP_G1: usize = IS_REP_G0 + NUM_STATES;
pub const IS_REP_G2: usize = IS_REP_G1 + NUM_STATES;
pub const IS_REP0_LONG: usize = IS_REP_G2 + NUM_STATES;
pub const POS_SLOT: usize = IS_REP0_LONG + (NUM_STATES << POS_BITS_MAX);
pub const DIST_SPECIAL: usize = POS_SLOT + (LEN_TO_POS_STATES << 6);
pub const ALIGN: usize =
    DIST_SPECIAL + FULL_DISTANCES - END_POS_MODEL_INDEX as usize;
pub const LEN_CODER: usize = ALIGN + (1 << ALIGN_BITS);
pub const REP_LEN_CODER: usize = LEN_CODER + LEN_CODER_SIZE;
pub const LITERAL: usize = REP_LEN_CODER + LEN_CODER_SIZE;

pub const LITERAL_CODER_SIZE: usize = 0x300;

// Length coder: two choice bits, then 3-bit trees for short lengths per
// position state, then one 8-bit tree for the rest.
pub const LEN_CHOICE: usize = 0;
pub const LEN_CHOICE2: usize = 1;
pub const LEN_LOW: usize = 2;
pub const LEN_MID: usize = LEN_LOW + (1 << POS_BITS_MAX << 3);
pub const LEN_HIGH: usize = LEN_MID + (1 << POS_BITS_MAX << 3);
pub const LEN_CODER_SIZE: usize = LEN_HIGH + 256;
pub const LEN_LOW_SYMBOLS: usize = 8;
pub const LEN_MID_SYMBOLS: usize = 8;

/// Largest table any accepted [`Props`] can need.
pub const PROBS_MAX: usize = LITERAL + (LITERAL_CODER_SIZE << 4);

pub fn probs_len(props: Props) -> usize {
    LITERAL + (LITERAL_CODER_SIZE << (props.lc() + props.lp()))
}

pub fn after_literal(state: usize) -> usize {
    match state {
        0..=3 => 0,
        4..=9 => state - 3,
        _ => state - 6,
    }
}

pub fn after_match(state: usize) -> usize {
    if state < LIT_STATES {
        7
    } else {
        10
    }
}

pub fn after_rep(state: usize) -> usize {
    if state < LIT_STATES {
        8
    } else {
        11
    }
}

pub fn after_short_rep(state: usize) -> usize {
    if state < LIT_STATES {
        9
    } else {
        11
    }
}

/// Offset of the literal coder for a byte at `pos` following `prev`.
pub fn literal_coder(props: Props, pos: u32, prev: u8) -> usize {
    let lp_mask = (1u32 << props.lp()) - 1;
    let ctx = ((pos & lp_mask) << props.lc())
        + (u32::from(prev) >> (8 - props.lc()));
    LITERAL + LITERAL_CODER_SIZE * ctx as usize
}

/// Which of the four distance-slot trees a match length uses.
pub fn len_to_pos_state(len: usize) -> usize {
    (len - MATCH_MIN_LEN).min(LEN_TO_POS_STATES - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_size() {
        assert_eq!(LITERAL, 1846);
        assert_eq!(probs_len(Props::DEFAULT), 1846 + 0x300 * 8);
        assert_eq!(MATCH_MAX_LEN, 273);
    }

    #[test]
    fn literal_context_uses_high_bits_of_previous_byte() {
        let p = Props::DEFAULT;
        assert_eq!(literal_coder(p, 0, 0x00), LITERAL);
        assert_eq!(literal_coder(p, 7, 0xe0), LITERAL + 7 * 0x300);
        let p = Props::new(0, 2, 0).unwrap();
        assert_eq!(literal_coder(p, 6, 0xff), LITERAL + 2 * 0x300);
    }
}
