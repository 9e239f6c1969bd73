//! bch.rs — binary BCH(63,51), t=2, over GF(2^6).
//!
//! Generator g(X) = (X^6+X+1)(X^6+X^4+X^2+X+1) = X^12+X^10+X^8+X^5+X^4+X^3+1.
//! Two errors can also be located directly from the syndromes:
//!
//!   Lambda(x) = 1 + S1·x + ((S3 + S1^3)/S1)·x^2
//!
//! The decoder computes both this closed form and the Euclidean locator and
//! treats any disagreement (or a power-syndrome mismatch S2 != S1^2,
//! S4 != S2^2) as an uncorrectable block — with three or more bit errors
//! deg(Lambda) is still 2, so agreement is the only handle on miscorrection.

use crate::gf::Gf;
use crate::rs::{poly_deg, poly_divmod, poly_eval, poly_lfsr, Poly, RsError, ZERO_POLY};

pub const BCH63_N: usize = 63;
pub const BCH63_K: usize = 51;
pub const BCH63_R: usize = 12;
const T: usize = 2;

#[derive(Debug, Clone)]
pub struct Bch63 {
    gf: Gf,
    g: Poly,
}

impl Default for Bch63 {
    fn default() -> Self {
        Self::new()
    }
}

impl Bch63 {
    pub fn new() -> Self {
        let mut g = ZERO_POLY;
        for i in [0usize, 3, 4, 5, 8, 10, 12] {
            g[i] = 1;
        }
        Bch63 {
            gf: Gf::gf64_bch(),
            g,
        }
    }

    /// Systematic encode of a 63-entry bit array (one bit per byte,
    /// coefficient order): parity lands in `cw[0..12]`.
    pub fn encode(&self, cw: &mut [u8; BCH63_N]) {
        let mut m = ZERO_POLY;
        for i in BCH63_R..BCH63_N {
            m[i] = cw[i] & 1;
        }
        let (_, parity) = poly_divmod(&self.gf, &m, &self.g);
        cw[..BCH63_R].copy_from_slice(&parity[..BCH63_R]);
    }

    /// Decode in place; returns the number of flipped bits.
    pub fn decode(&self, cw: &mut [u8; BCH63_N]) -> Result<usize, RsError> {
        let mut cwp = ZERO_POLY;
        for (i, &b) in cw.iter().enumerate() {
            cwp[i] = b & 1;
        }

        // S_i = cw(alpha^(1+i)), i = 0..2t
        let mut s = ZERO_POLY;
        let mut nonzero = false;
        for (i, si) in s.iter_mut().enumerate().take(2 * T) {
            *si = poly_eval(&self.gf, &cwp, self.gf.exp_alpha(1 + i));
            if *si != 0 {
                nonzero = true;
            }
        }
        if !nonzero {
            return Ok(0);
        }

        let (lambda, omega) = poly_lfsr(&self.gf, T as i32, 2 * T, &s);
        let _ = omega; // binary code: error values are 1, Forney not needed
        let gamma = lambda[0];
        if gamma == 0 {
            return Err(RsError::DegenerateLocator);
        }
        let gamma_inv = self.gf.inv(gamma);
        let mut lambda_n = ZERO_POLY;
        for (c, &l) in lambda_n.iter_mut().zip(lambda.iter()) {
            *c = self.gf.mul(l, gamma_inv);
        }

        // power-syndrome consistency for a binary code
        if s[1] != self.gf.mul(s[0], s[0]) || s[3] != self.gf.mul(s[1], s[1]) {
            return Err(RsError::DegenerateLocator);
        }

        // closed form must reproduce the Euclidean locator
        let mut l = ZERO_POLY;
        l[0] = 1;
        l[1] = s[0];
        let mut l2 = self.gf.mul(s[0], s[0]);
        l2 = self.gf.mul(l2, s[0]);
        l2 ^= s[2];
        l2 = self.gf.mul(l2, self.gf.inv(s[0]));
        l[2] = l2;
        if l[1] != lambda_n[1] || l[2] != lambda_n[2] {
            return Err(RsError::DegenerateLocator);
        }

        let deg_lambda = poly_deg(&lambda_n);
        let mut n = 0usize;
        let mut err_pos = [0usize; 2 * T];
        for i in 1..self.gf.ord {
            let x = i as u8;
            if poly_eval(&self.gf, &lambda_n, x) == 0 {
                err_pos[n] = self.gf.log_alpha(self.gf.inv(x)) as usize;
                n += 1;
            }
            if n as i32 >= deg_lambda {
                break;
            }
        }

        if (n as i32) < deg_lambda {
            return Err(RsError::TooManyErrors);
        }
        for &pos in err_pos.iter().take(n) {
            cw[pos] ^= 1;
        }
        Ok(n)
    }

    /// Closed-form locator alone, for cross-checking.
    pub fn closed_form_lambda(&self, cw: &[u8; BCH63_N]) -> Option<[u8; 3]> {
        let mut cwp = ZERO_POLY;
        for (i, &b) in cw.iter().enumerate() {
            cwp[i] = b & 1;
        }
        let s1 = poly_eval(&self.gf, &cwp, self.gf.exp_alpha(1));
        let s3 = poly_eval(&self.gf, &cwp, self.gf.exp_alpha(3));
        if s1 == 0 {
            return None;
        }
        let mut l2 = self.gf.mul(self.gf.mul(s1, s1), s1);
        l2 ^= s3;
        l2 = self.gf.mul(l2, self.gf.inv(s1));
        Some([1, s1, l2])
    }
}
