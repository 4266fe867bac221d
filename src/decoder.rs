use crate::{
    get_dist_state,
    lz::LzDecoder,
    range_dec::RangeDecoder,
    LengthCoder, LiteralCoder, LiteralSubCoder, LzmaCoder, Read, Result, ALIGN_BITS,
    DIST_MODEL_END, DIST_MODEL_START, LOW_SYMBOLS, MATCH_LEN_MIN, MID_SYMBOLS,
};

/// LZMA symbol decoder: drives the range decoder over the probability
/// models and feeds literals and match copies into the dictionary.
#[derive(Debug)]
pub(crate) struct LzmaDecoder {
    coder: LzmaCoder,
    literal_decoder: LiteralDecoder,
    match_len_decoder: LengthCoder,
    rep_len_decoder: LengthCoder,
}

impl LzmaDecoder {
    pub(crate) fn new(lc: u32, lp: u32, pb: u32) -> Self {
        let mut literal_decoder = LiteralDecoder::new(lc, lp);
        literal_decoder.reset();
        let mut match_len_decoder = LengthCoder::new();
        match_len_decoder.reset();
        let mut rep_len_decoder = LengthCoder::new();
        rep_len_decoder.reset();
        Self {
            coder: LzmaCoder::new(pb as _),
            literal_decoder,
            match_len_decoder,
            rep_len_decoder,
        }
    }

    /// Resets the probability models, the state machine and the recent
    /// distances while keeping the configured properties.
    pub(crate) fn reset(&mut self) {
        self.coder.reset();
        self.literal_decoder.reset();
        self.match_len_decoder.reset();
        self.rep_len_decoder.reset();
    }

    /// An LZMA1 end marker decodes as the all-ones distance.
    pub(crate) fn end_marker_detected(&self) -> bool {
        self.coder.reps[0] == -1
    }

    /// Decodes symbols until the dictionary's output limit is reached.
    pub(crate) fn decode<R: Read>(
        &mut self,
        lz: &mut LzDecoder,
        rc: &mut RangeDecoder<R>,
    ) -> Result<()> {
        lz.repeat_pending()?;
        while lz.has_space() {
            let pos_state = lz.get_pos() as u32 & self.coder.pos_mask;
            let index = self.coder.state.get() as usize;
            if rc.decode_bit(&mut self.coder.is_match[index][pos_state as usize])? == 0 {
                self.literal_decoder.decode(&mut self.coder, lz, rc)?;
            } else {
                let index = self.coder.state.get() as usize;
                let len = if rc.decode_bit(&mut self.coder.is_rep[index])? == 0 {
                    self.decode_match(pos_state, rc)?
                } else {
                    self.decode_rep_match(pos_state, rc)?
                };
                lz.repeat(self.coder.reps[0] as usize, len as usize)?;
            }
        }
        rc.normalize()?;
        Ok(())
    }

    fn decode_match<R: Read>(&mut self, pos_state: u32, rc: &mut RangeDecoder<R>) -> Result<u32> {
        self.coder.state.update_match();
        self.coder.reps[3] = self.coder.reps[2];
        self.coder.reps[2] = self.coder.reps[1];
        self.coder.reps[1] = self.coder.reps[0];

        let len = self.match_len_decoder.decode(pos_state as usize, rc)?;
        let dist_slot =
            rc.decode_bit_tree(&mut self.coder.dist_slots[get_dist_state(len) as usize])?;

        if dist_slot < DIST_MODEL_START as i32 {
            self.coder.reps[0] = dist_slot;
        } else {
            let limit = (dist_slot >> 1) - 1;
            let mut rep0 = (2 | (dist_slot & 1)) << limit;
            if dist_slot < DIST_MODEL_END as i32 {
                let probs = self
                    .coder
                    .get_dist_special((dist_slot - DIST_MODEL_START as i32) as usize);
                rep0 |= rc.decode_reverse_bit_tree(probs)?;
            } else {
                rep0 |= rc.decode_direct_bits((limit - ALIGN_BITS as i32) as u32)? << ALIGN_BITS;
                rep0 |= rc.decode_reverse_bit_tree(self.coder.dist_align())?;
            }
            self.coder.reps[0] = rep0;
        }
        Ok(len)
    }

    fn decode_rep_match<R: Read>(
        &mut self,
        pos_state: u32,
        rc: &mut RangeDecoder<R>,
    ) -> Result<u32> {
        let index = self.coder.state.get() as usize;
        if rc.decode_bit(&mut self.coder.is_rep0[index])? == 0 {
            let index = self.coder.state.get() as usize;
            if rc.decode_bit(&mut self.coder.is_rep0_long[index][pos_state as usize])? == 0 {
                self.coder.state.update_short_rep();
                return Ok(1);
            }
        } else {
            let tmp;
            let index = self.coder.state.get() as usize;
            if rc.decode_bit(&mut self.coder.is_rep1[index])? == 0 {
                tmp = self.coder.reps[1];
            } else {
                if rc.decode_bit(&mut self.coder.is_rep2[index])? == 0 {
                    tmp = self.coder.reps[2];
                } else {
                    tmp = self.coder.reps[3];
                    self.coder.reps[3] = self.coder.reps[2];
                }
                self.coder.reps[2] = self.coder.reps[1];
            }
            self.coder.reps[1] = self.coder.reps[0];
            self.coder.reps[0] = tmp;
        }

        self.coder.state.update_long_rep();
        self.rep_len_decoder.decode(pos_state as usize, rc)
    }
}

impl LengthCoder {
    fn decode<R: Read>(&mut self, pos_state: usize, rc: &mut RangeDecoder<R>) -> Result<u32> {
        if rc.decode_bit(&mut self.choice[0])? == 0 {
            let sym = rc.decode_bit_tree(&mut self.low[pos_state])? as usize;
            return Ok((sym + MATCH_LEN_MIN) as u32);
        }
        if rc.decode_bit(&mut self.choice[1])? == 0 {
            let sym = rc.decode_bit_tree(&mut self.mid[pos_state])? as usize;
            return Ok((sym + MATCH_LEN_MIN + LOW_SYMBOLS) as u32);
        }
        let sym = rc.decode_bit_tree(&mut self.high)? as usize;
        Ok((sym + MATCH_LEN_MIN + LOW_SYMBOLS + MID_SYMBOLS) as u32)
    }
}

#[derive(Debug)]
struct LiteralDecoder {
    coder: LiteralCoder,
    sub_decoders: Vec<LiteralSubDecoder>,
}

impl LiteralDecoder {
    fn new(lc: u32, lp: u32) -> Self {
        let coder = LiteralCoder::new(lc, lp);
        let sub_decoders = vec![LiteralSubDecoder::new(); 1 << (lc + lp)];
        Self { coder, sub_decoders }
    }

    fn reset(&mut self) {
        for sub in self.sub_decoders.iter_mut() {
            sub.coder.reset();
        }
    }

    fn decode<R: Read>(
        &mut self,
        coder: &mut LzmaCoder,
        lz: &mut LzDecoder,
        rc: &mut RangeDecoder<R>,
    ) -> Result<()> {
        let i = self
            .coder
            .get_sub_coder_index(lz.get_byte(0) as u32, lz.get_pos() as u32);
        self.sub_decoders[i as usize].decode(coder, lz, rc)
    }
}

#[derive(Debug, Clone)]
struct LiteralSubDecoder {
    coder: LiteralSubCoder,
}

impl LiteralSubDecoder {
    fn new() -> Self {
        Self {
            coder: LiteralSubCoder::new(),
        }
    }

    fn decode<R: Read>(
        &mut self,
        coder: &mut LzmaCoder,
        lz: &mut LzDecoder,
        rc: &mut RangeDecoder<R>,
    ) -> Result<()> {
        let mut symbol: u32 = 1;
        if coder.state.is_literal() {
            loop {
                let bit = rc.decode_bit(&mut self.coder.probs[symbol as usize])? as u32;
                symbol = (symbol << 1) | bit;
                if symbol >= 0x100 {
                    break;
                }
            }
        } else {
            // The previous symbol was a match: decode against the byte the
            // most recent distance points at, bit by bit, until the decoded
            // prefix diverges from it.
            let mut match_byte = lz.get_byte(coder.reps[0] as usize) as u32;
            let mut offset = 0x100u32;
            loop {
                match_byte <<= 1;
                let match_bit = match_byte & offset;
                let bit =
                    rc.decode_bit(&mut self.coder.probs[(offset + match_bit + symbol) as usize])?
                        as u32;
                symbol = (symbol << 1) | bit;
                offset &= 0u32.wrapping_sub(bit) ^ !match_bit;
                if symbol >= 0x100 {
                    break;
                }
            }
        }

        lz.put_byte(symbol as u8);
        coder.state.update_literal();
        Ok(())
    }
}
