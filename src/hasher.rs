//! Chatango's in-house block digest, used by the server lookup table.
//!
//! The algorithm is an MD5-family digest: 64-byte blocks, four 32-bit state
//! words, four rounds of sixteen add-and-rotate steps, little-endian length
//! padding and little-endian output. It is *not* MD5: the second step's
//! rotation fills its right half with an arithmetic shift of the signed
//! intermediate, so outputs diverge from MD5 whenever that intermediate has
//! its top bit set. The servers depend on the divergence, so it must be
//! reproduced bit for bit.
//!
//! This is a lookup hash, not a security primitive.

const BLOCK_SIZE: usize = 64;

const INIT_STATE: [u32; 4] = [0x6745_2301, 0xefcd_ab89, 0x98ba_dcfe, 0x1032_5476];

#[rustfmt::skip]
const K: [u32; 64] = [
    0xd76a_a478, 0xe8c7_b756, 0x2420_70db, 0xc1bd_ceee,
    0xf57c_0faf, 0x4787_c62a, 0xa830_4613, 0xfd46_9501,
    0x6980_98d8, 0x8b44_f7af, 0xffff_5bb1, 0x895c_d7be,
    0x6b90_1122, 0xfd98_7193, 0xa679_438e, 0x49b4_0821,
    0xf61e_2562, 0xc040_b340, 0x265e_5a51, 0xe9b6_c7aa,
    0xd62f_105d, 0x0244_1453, 0xd8a1_e681, 0xe7d3_fbc8,
    0x21e1_cde6, 0xc337_07d6, 0xf4d5_0d87, 0x455a_14ed,
    0xa9e3_e905, 0xfcef_a3f8, 0x676f_02d9, 0x8d2a_4c8a,
    0xfffa_3942, 0x8771_f681, 0x6d9d_6122, 0xfde5_380c,
    0xa4be_ea44, 0x4bde_cfa9, 0xf6bb_4b60, 0xbebf_bc70,
    0x289b_7ec6, 0xeaa1_27fa, 0xd4ef_3085, 0x0488_1d05,
    0xd9d4_d039, 0xe6db_99e5, 0x1fa2_7cf8, 0xc4ac_5665,
    0xf429_2244, 0x432a_ff97, 0xab94_23a7, 0xfc93_a039,
    0x655b_59c3, 0x8f0c_cc92, 0xffef_f47d, 0x8584_5dd1,
    0x6fa8_7e4f, 0xfe2c_e6e0, 0xa301_4314, 0x4e08_11a1,
    0xf753_7e82, 0xbd3a_f235, 0x2ad7_d2bb, 0xeb86_d391,
];

#[rustfmt::skip]
const S: [u32; 64] = [
    7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22,
    5,  9, 14, 20, 5,  9, 14, 20, 5,  9, 14, 20, 5,  9, 14, 20,
    4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23,
    6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21,
];

/// Streaming state for the digest.
pub struct Hasher {
    state: [u32; 4],
    buffer: [u8; BLOCK_SIZE],
    buffer_len: usize,
    message_len: u64,
}

impl Default for Hasher {
    fn default() -> Self {
        Hasher::new()
    }
}

impl Hasher {
    pub fn new() -> Hasher {
        Hasher {
            state: INIT_STATE,
            buffer: [0; BLOCK_SIZE],
            buffer_len: 0,
            message_len: 0,
        }
    }

    /// Feed bytes into the digest.
    pub fn update(&mut self, input: &[u8]) -> &mut Hasher {
        self.message_len += input.len() as u64;
        let mut rest = input;
        if self.buffer_len > 0 {
            let take = rest.len().min(BLOCK_SIZE - self.buffer_len);
            self.buffer[self.buffer_len..self.buffer_len + take].copy_from_slice(&rest[..take]);
            self.buffer_len += take;
            rest = &rest[take..];
            if self.buffer_len == BLOCK_SIZE {
                let block = self.buffer;
                compress(&mut self.state, &block);
                self.buffer_len = 0;
            }
        }
        while rest.len() >= BLOCK_SIZE {
            compress(&mut self.state, &rest[..BLOCK_SIZE]);
            rest = &rest[BLOCK_SIZE..];
        }
        self.buffer[..rest.len()].copy_from_slice(rest);
        self.buffer_len += rest.len();
        self
    }

    /// Pad, run the final block and emit the state as little-endian bytes.
    pub fn finalize(mut self) -> [u8; 16] {
        let bit_len = self.message_len.wrapping_mul(8);
        self.update(&[0x80]);
        while self.buffer_len != BLOCK_SIZE - 8 {
            self.update(&[0]);
        }
        self.update(&bit_len.to_le_bytes());

        let mut out = [0u8; 16];
        for (i, word) in self.state.iter().enumerate() {
            out[4 * i..4 * i + 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }
}

fn compress(state: &mut [u32; 4], block: &[u8]) {
    let mut m = [0u32; 16];
    for (i, word) in m.iter_mut().enumerate() {
        *word = u32::from_le_bytes([
            block[4 * i],
            block[4 * i + 1],
            block[4 * i + 2],
            block[4 * i + 3],
        ]);
    }

    let [mut a, mut b, mut c, mut d] = *state;
    for i in 0..64 {
        let (f, g) = match i / 16 {
            0 => (d ^ (b & (c ^ d)), i),
            1 => (c ^ (d & (b ^ c)), (5 * i + 1) % 16),
            2 => (b ^ c ^ d, (3 * i + 5) % 16),
            _ => (c ^ (b | !d), (7 * i) % 16),
        };
        let t = a
            .wrapping_add(f)
            .wrapping_add(m[g])
            .wrapping_add(K[i]);
        // Step 2's rotation sign-extends the right half instead of shifting
        // in zeros. Everything downstream depends on this exact bit pattern.
        let rotated = if i == 1 {
            (t << S[i]) | ((t as i32) >> (32 - S[i])) as u32
        } else {
            t.rotate_left(S[i])
        };
        let next = b.wrapping_add(rotated);
        a = d;
        d = c;
        c = b;
        b = next;
    }

    state[0] = state[0].wrapping_add(a);
    state[1] = state[1].wrapping_add(b);
    state[2] = state[2].wrapping_add(c);
    state[3] = state[3].wrapping_add(d);
}

/// Digest an arbitrary string into the 32-hex form used by the shard table.
pub fn chatango_digest(input: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(input.as_bytes());
    let mut out = String::with_capacity(32);
    for byte in hasher.finalize() {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(input: &str) -> String {
        chatango_digest(input)
    }

    #[test]
    fn pinned_vectors() {
        assert_eq!(digest("pythonrpg"), "eaca4ae562b09f56375d052478a334dd");
        assert_eq!(digest("chatango"), "046e5e1694ec846015844cc28539b8f4");
        assert_eq!(digest("some-room-name"), "b2a5cde7e35b4aa6ef429d0533524d13");
        assert_eq!(digest("examplegroup"), "08f8a4e040b191dcd7441a4681a140fd");
        assert_eq!(digest(""), "c0ca8ed89274a9ae0a127fac98667d83");
    }

    #[test]
    fn diverges_from_md5_when_the_signed_intermediate_goes_negative() {
        // md5("test") is 098f6bcd4621d373cade4e832627b4f6
        assert_eq!(digest("test"), "392235e102c244b49edd9796d2efb59c");
        // md5("a") is 0cc175b9c0f1b6a831c399e269772661
        assert_eq!(digest("a"), "0ed90a7319327c6922305c22b91193cc");
    }

    #[test]
    fn padding_boundaries() {
        assert_eq!(
            digest(&"x".repeat(55)),
            "04364420e25c512fd958a70738aa8f72"
        );
        assert_eq!(
            digest(&"y".repeat(56)),
            "2a2e407c5b5fd609a35e842d73949283"
        );
        assert_eq!(
            digest(&"z".repeat(64)),
            "2938fb356ff44690f859a5ae352d0c8b"
        );
        assert_eq!(
            digest(&"w".repeat(65)),
            "a53b698a94758938e4005dea246fe05e"
        );
        assert_eq!(
            digest(&"m".repeat(128)),
            "1d206e70eff71844d7a05fb8693fdc9f"
        );
    }

    #[test]
    fn streaming_matches_one_shot() {
        let mut hasher = Hasher::new();
        hasher.update(b"python").update(b"rpg");
        let mut split = String::new();
        for byte in hasher.finalize() {
            split.push_str(&format!("{:02x}", byte));
        }
        assert_eq!(split, digest("pythonrpg"));
    }
}
