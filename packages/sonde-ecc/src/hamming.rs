//! hamming.rs — Hamming(8,4) nibble protection as used by the DFM frame.
//!
//! Payload bits arrive column-major in an 8×L grid (L = 7 for the config
//! group, 13 for the data groups); reading row-major yields the 8-bit
//! codewords. The code is systematic: bits 0..3 carry data, 4..7 parity.

/// Parity-check matrix rows.
pub const H: [[u8; 8]; 4] = [
    [0, 1, 1, 1, 1, 0, 0, 0],
    [1, 0, 1, 1, 0, 1, 0, 0],
    [1, 1, 0, 1, 0, 0, 1, 0],
    [1, 1, 1, 0, 0, 0, 0, 1],
];

/// Columns of H: the eight single-bit-error syndromes.
pub const HE: [u8; 8] = [0x7, 0xB, 0xD, 0xE, 0x8, 0x4, 0x2, 0x1];

const B: usize = 8; // codeword bits
const S: usize = 4; // data bits

/// Big-endian bit pack (DFM fields are MSB first).
pub fn bits_to_val(bits: &[u8]) -> u32 {
    let mut val = 0u32;
    for (j, &b) in bits.iter().enumerate() {
        val |= ((b & 1) as u32) << (bits.len() - 1 - j);
    }
    val
}

/// De-interleave `8·l` bits written column-major into row-major codewords.
pub fn deinterleave(bits: &[u8], l: usize, block: &mut [u8]) {
    for j in 0..B {
        for i in 0..l {
            block[B * i + j] = bits[l * j + i] & 1;
        }
    }
}

/// Check one codeword; corrects a single bit in place.
///
/// Returns 0 for a clean word, `pos+1` for a corrected bit, -1 for a
/// syndrome outside the single-error table (detected, uncorrectable).
pub fn check(code: &mut [u8]) -> i32 {
    let mut syndrome = [0u8; 4];
    for i in 0..4 {
        for j in 0..B {
            syndrome[i] ^= H[i][j] & code[j];
        }
    }
    let synval = bits_to_val(&syndrome);
    if synval == 0 {
        return 0;
    }
    for (j, &he) in HE.iter().enumerate() {
        if synval == he as u32 {
            code[j] ^= 1;
            return j as i32 + 1;
        }
    }
    -1
}

/// Decode `l` codewords into `4·l` data bits.
///
/// With `ecc` enabled the per-word results are OR-combined the way the
/// caller consumes them: 0 all clean, > 0 something was corrected,
/// < 0 at least one word was uncorrectable.
pub fn decode(ham: &mut [u8], l: usize, sym: &mut [u8], ecc: bool) -> i32 {
    let mut ret = 0i32;
    for i in 0..l {
        if ecc {
            ret |= check(&mut ham[B * i..B * i + B]);
        }
        for j in 0..S {
            sym[S * i + j] = ham[B * i + j];
        }
    }
    ret
}

/// Build the parity bits for 4 data bits (test aid and frame synthesis).
pub fn encode_nibble(data: [u8; 4]) -> [u8; 8] {
    let [d0, d1, d2, d3] = data.map(|b| b & 1);
    [
        d0,
        d1,
        d2,
        d3,
        d1 ^ d2 ^ d3,
        d0 ^ d2 ^ d3,
        d0 ^ d1 ^ d3,
        d0 ^ d1 ^ d2,
    ]
}
