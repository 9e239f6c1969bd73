//! viterbi.rs — rate-1/2, K=7 convolutional decoder (LMS6 uplink coding).
//!
//! Generators 0x4F (x^6+x^3+x^2+x+1) and 0x6D (x^6+x^5+x^3+x^2+1), free
//! distance 10. The trellis has 64 states; level t < K-1 only has the
//! reachable prefix states live. Two metrics are provided: hard (Hamming
//! distance on bit pairs) and soft (Euclidean distance to the ±1 mapping).
//!
//! The decoder returns the maximum-likelihood *raw* bit sequence; the
//! algebraic [`deconv`] recovers the input bits from raw pairs and flags the
//! first position where no input bit explains the pair.

pub const CONSTRAINT: usize = 7;
const NSTATES: usize = 1 << (CONSTRAINT - 1); // 64
const NWINDOWS: usize = 1 << CONSTRAINT; // 128

pub const POLY_A: u8 = 0x4F;
pub const POLY_B: u8 = 0x6D;

#[derive(Debug, Clone, Copy, Default)]
struct Node {
    b_in: u8,
    code_in: u8,
    prev: u8,
    w: i32,
    sw: f32,
}

#[derive(Debug, Clone)]
pub struct Viterbi {
    /// Output pair (cA<<1 | cB) for each 7-bit input window, newest bit LSB.
    code: [u8; NWINDOWS],
}

impl Default for Viterbi {
    fn default() -> Self {
        Self::new()
    }
}

fn parity(x: u8) -> u8 {
    (x.count_ones() & 1) as u8
}

fn hard_dist(c: u8, rc: &[u8]) -> i32 {
    ((((c >> 1) ^ rc[0]) & 1) + ((c ^ rc[1]) & 1)) as i32
}

fn soft_dist(c: u8, rc: &[f32]) -> f32 {
    let bit0 = (((c >> 1) & 1) * 2) as f32 - 1.0;
    let bit1 = ((c & 1) * 2) as f32 - 1.0;
    ((bit0 - rc[0]) * (bit0 - rc[0]) + (bit1 - rc[1]) * (bit1 - rc[1])).sqrt()
}

impl Viterbi {
    pub fn new() -> Self {
        let mut code = [0u8; NWINDOWS];
        for (bits, c) in code.iter_mut().enumerate() {
            let ca = parity(bits as u8 & POLY_A);
            let cb = parity(bits as u8 & POLY_B);
            *c = (ca << 1) | cb;
        }
        Viterbi { code }
    }

    /// Encode input bits (0/1 per byte) into raw bit pairs, zero-state start.
    pub fn encode(&self, bits: &[u8]) -> Vec<u8> {
        let mut raw = Vec::with_capacity(bits.len() * 2);
        let mut window = 0usize;
        for &b in bits {
            window = ((window << 1) | (b & 1) as usize) & (NWINDOWS - 1);
            let c = self.code[window];
            raw.push((c >> 1) & 1);
            raw.push(c & 1);
        }
        raw
    }

    fn boundary(&self, trellis: &mut [[Node; NSTATES]]) {
        // levels 1..K-1: only 2^t states are reachable from state 0
        let mut m = NSTATES;
        let mut t = CONSTRAINT - 1;
        while t > 0 {
            for j in 0..m {
                trellis[t][j].prev = (j / 2) as u8;
            }
            t -= 1;
            m /= 2;
        }
    }

    /// Hard decode: returns the ML raw bit sequence (length 2·(len/2)).
    pub fn decode_hard(&self, raw: &[u8]) -> Vec<u8> {
        let tmax = raw.len() / 2;
        if tmax < CONSTRAINT {
            return raw.to_vec();
        }
        let mut trellis = vec![[Node::default(); NSTATES]; tmax + 1];
        self.boundary(&mut trellis);

        let mut m = 2;
        for t in 1..CONSTRAINT {
            for j in 0..m {
                let c = self.code[j];
                let prev = trellis[t][j].prev as usize;
                let w = trellis[t - 1][prev].w + hard_dist(c, &raw[2 * (t - 1)..]);
                let node = &mut trellis[t][j];
                node.b_in = (j % 2) as u8;
                node.code_in = c;
                node.w = w;
            }
            m *= 2;
        }

        let mut d = [Node::default(); NWINDOWS];
        for t in (CONSTRAINT - 1)..tmax {
            let rc = &raw[2 * t..];
            for j in 0..NSTATES {
                for b in 0..2usize {
                    let ns = j * 2 + b;
                    d[ns] = Node {
                        b_in: b as u8,
                        code_in: self.code[ns],
                        prev: j as u8,
                        w: trellis[t][j].w + hard_dist(self.code[ns], rc),
                        sw: 0.0,
                    };
                }
            }
            for j in 0..NSTATES {
                let idx = if d[j].w <= d[j + NSTATES].w { j } else { j + NSTATES };
                trellis[t + 1][j] = d[idx];
            }
        }

        let mut j_min = 0;
        let mut w_min = i32::MAX;
        for j in 0..NSTATES {
            if trellis[tmax][j].w < w_min {
                w_min = trellis[tmax][j].w;
                j_min = j;
            }
        }

        let mut out = vec![0u8; 2 * tmax];
        let mut j = j_min;
        let mut t = tmax;
        while t > 0 {
            let c = trellis[t][j].code_in;
            out[2 * t - 2] = (c >> 1) & 1;
            out[2 * t - 1] = c & 1;
            j = trellis[t][j].prev as usize;
            t -= 1;
        }
        out
    }

    /// Soft decode on clipped/normalized soft bits in [-1, 1].
    /// Returns (input bits, ML raw bit sequence).
    pub fn decode_soft(&self, soft: &[f32]) -> (Vec<u8>, Vec<u8>) {
        let tmax = soft.len() / 2;
        if tmax < CONSTRAINT {
            let hard: Vec<u8> = soft.iter().map(|&s| (s >= 0.0) as u8).collect();
            return (Vec::new(), hard);
        }
        let mut trellis = vec![[Node::default(); NSTATES]; tmax + 1];
        self.boundary(&mut trellis);

        let mut m = 2;
        for t in 1..CONSTRAINT {
            for j in 0..m {
                let c = self.code[j];
                let prev = trellis[t][j].prev as usize;
                let sw = trellis[t - 1][prev].sw + soft_dist(c, &soft[2 * (t - 1)..]);
                let node = &mut trellis[t][j];
                node.b_in = (j % 2) as u8;
                node.code_in = c;
                node.sw = sw;
            }
            m *= 2;
        }

        let mut d = [Node::default(); NWINDOWS];
        for t in (CONSTRAINT - 1)..tmax {
            let rc = &soft[2 * t..];
            for j in 0..NSTATES {
                for b in 0..2usize {
                    let ns = j * 2 + b;
                    d[ns] = Node {
                        b_in: b as u8,
                        code_in: self.code[ns],
                        prev: j as u8,
                        w: 0,
                        sw: trellis[t][j].sw + soft_dist(self.code[ns], rc),
                    };
                }
            }
            for j in 0..NSTATES {
                let idx = if d[j].sw <= d[j + NSTATES].sw { j } else { j + NSTATES };
                trellis[t + 1][j] = d[idx];
            }
        }

        let mut j_min = 0;
        let mut sw_min = f32::INFINITY;
        for j in 0..NSTATES {
            if trellis[tmax][j].sw < sw_min {
                sw_min = trellis[tmax][j].sw;
                j_min = j;
            }
        }

        let mut raw = vec![0u8; 2 * tmax];
        let mut bits = vec![0u8; tmax];
        let mut j = j_min;
        let mut t = tmax;
        while t > 0 {
            bits[t - 1] = trellis[t][j].b_in;
            let c = trellis[t][j].code_in;
            raw[2 * t - 2] = (c >> 1) & 1;
            raw[2 * t - 1] = c & 1;
            j = trellis[t][j].prev as usize;
            t -= 1;
        }
        (bits, raw)
    }
}

/// Algebraic deconvolution of raw bit pairs into input bits.
///
/// Values 0/1 are bits; on the first pair no input bit can explain, the
/// output position is marked 8 or 9 (sign of the closer branch) and the
/// position is returned. Returns 0 when every pair was consistent.
pub fn deconv(raw: &[u8], bits: &mut Vec<u8>) -> usize {
    let m = CONSTRAINT - 1;
    bits.clear();
    bits.resize(m, 0);

    let pa: [u8; 7] = [1, 0, 0, 1, 1, 1, 1]; // 0x4F, MSB first
    let pb: [u8; 7] = [1, 1, 0, 1, 1, 0, 1]; // 0x6D

    let mut errors = 0usize;
    let mut n = 0usize;
    while 2 * (m + n) < raw.len() {
        let p = &raw[2 * (m + n)..];
        let mut bit_a = 0u8;
        let mut bit_b = 0u8;
        for j in 0..m {
            bit_a ^= (bits[n + j] & 1) & pa[j];
            bit_b ^= (bits[n + j] & 1) & pb[j];
        }
        let da = bit_a ^ (p[0] & 1);
        let db = bit_b ^ (p[1] & 1);
        if da == pa[m] && db == pb[m] {
            bits.push(1);
        } else if da == 0 && db == 0 {
            bits.push(0);
        } else {
            // inconsistent pair: mark and stop
            if da != pa[m] && db == pb[m] {
                bits.push(9);
            } else {
                bits.push(8);
            }
            errors = n;
            break;
        }
        n += 1;
    }
    errors
}
