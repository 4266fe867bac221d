use super::BcjFilter;

impl BcjFilter {
    pub(crate) fn new_ppc(start_pos: usize, encoder: bool) -> Self {
        Self {
            is_encoder: encoder,
            pos: start_pos,
            prev_mask: 0,
            filter: Self::ppc_code,
        }
    }

    fn ppc_code(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len();
        if len < 4 {
            return 0;
        }
        let end = len - 4;
        let mut i = 0;
        while i <= end {
            // Big-endian BL: primary opcode 18, AA = 0, LK = 1.
            if (buf[i] & 0xFC) == 0x48 && (buf[i + 3] & 3) == 1 {
                let src = (((buf[i] & 3) as i32) << 24)
                    | ((buf[i + 1] as i32) << 16)
                    | ((buf[i + 2] as i32) << 8)
                    | ((buf[i + 3] & 0xFC) as i32);

                let p = (self.pos + i) as i32;
                let dest = if self.is_encoder { src + p } else { src - p };

                buf[i] = (0x48 | ((dest >> 24) & 3)) as u8;
                buf[i + 1] = (dest >> 16) as u8;
                buf[i + 2] = (dest >> 8) as u8;
                buf[i + 3] = ((buf[i + 3] & 3) as i32 | (dest & 0xFC)) as u8;
            }
            i += 4;
        }

        self.pos += i;
        i
    }
}
