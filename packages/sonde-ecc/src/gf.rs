//! gf.rs — GF(2^m) arithmetic via exp/log tables.
//!
//! Tables are generated once from the field polynomial and a primitive
//! element; everything downstream (`rs`, `bch`) multiplies through them.

use thiserror::Error;

/// Highest polynomial degree the codeword buffers carry (N-1 for N=255).
pub const MAX_DEG: usize = 254;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GfError {
    #[error("element {0:#x} is not primitive in GF({1})")]
    NotPrimitive(u8, usize),
}

/// One binary extension field, defined by its reduction polynomial.
#[derive(Debug, Clone)]
pub struct Gf {
    /// Reduction polynomial, e.g. 0x11D for X^8+X^4+X^3+X^2+1.
    pub f: u32,
    /// Field order 2^m.
    pub ord: usize,
    /// Primitive element the tables are built on.
    pub alpha: u8,
    exp: [u8; 256],
    log: [u8; 256],
}

fn deg(p: u32) -> i32 {
    if p == 0 {
        return -1; // deg(0) = -inf
    }
    31 - p.leading_zeros() as i32
}

/// Carry-less multiply with reduction, used only to build the tables.
fn mul_slow(f: u32, a: u8, b: u8) -> u8 {
    let mut aa = a as u32;
    let mut b = b as u32;
    let mut ab = if b & 1 != 0 { a } else { 0 };
    let m = deg(b);
    for _ in 0..m {
        aa <<= 1;
        if deg(aa) == deg(f) {
            aa ^= f;
        }
        b >>= 1;
        if b & 1 != 0 {
            ab ^= aa as u8;
        }
    }
    ab
}

impl Gf {
    /// GF(2^8) mod X^8+X^4+X^3+X^2+1, alpha = X (Vaisala RS).
    pub fn gf256_vaisala() -> Self {
        Gf::new(0x11D, 256, 0x02).expect("0x02 is primitive mod 0x11D")
    }

    /// GF(2^8) mod X^8+X^7+X^2+X+1, alpha = X (CCSDS RS).
    pub fn gf256_ccsds() -> Self {
        Gf::new(0x187, 256, 0x02).expect("0x02 is primitive mod 0x187")
    }

    /// GF(2^6) mod X^6+X+1, alpha = X (Meisei BCH).
    pub fn gf64_bch() -> Self {
        Gf::new(0x43, 64, 0x02).expect("0x02 is primitive mod 0x43")
    }

    pub fn new(f: u32, ord: usize, alpha: u8) -> Result<Self, GfError> {
        let mut exp = [0u8; 256];
        let mut log = [0u8; 256];
        let mut seen = [false; 256];

        let mut b = 0x01u8;
        for (i, e) in exp.iter_mut().enumerate().take(ord) {
            *e = b;
            if i < ord - 1 {
                if seen[b as usize] {
                    return Err(GfError::NotPrimitive(alpha, ord));
                }
                seen[b as usize] = true;
                log[b as usize] = i as u8;
            }
            b = mul_slow(f, alpha, b);
        }
        // alpha^(ord-1) must wrap to 1
        if exp[ord - 1] != 1 {
            return Err(GfError::NotPrimitive(alpha, ord));
        }

        Ok(Gf {
            f,
            ord,
            alpha,
            exp,
            log,
        })
    }

    #[inline]
    pub fn mul(&self, p: u8, q: u8) -> u8 {
        if p == 0 || q == 0 {
            return 0;
        }
        let x = self.log[p as usize] as usize + self.log[q as usize] as usize;
        self.exp[x % (self.ord - 1)]
    }

    #[inline]
    pub fn inv(&self, p: u8) -> u8 {
        if p == 0 {
            return 0; // div-by-zero guarded by callers
        }
        self.exp[self.ord - 1 - self.log[p as usize] as usize]
    }

    /// alpha^n (n reduced mod ord-1).
    #[inline]
    pub fn exp_alpha(&self, n: usize) -> u8 {
        self.exp[n % (self.ord - 1)]
    }

    /// log_alpha(x); x must be nonzero.
    #[inline]
    pub fn log_alpha(&self, x: u8) -> u8 {
        self.log[x as usize]
    }

    /// x^e for field element x.
    pub fn pow(&self, x: u8, e: usize) -> u8 {
        if x == 0 {
            return if e == 0 { 1 } else { 0 };
        }
        self.exp_alpha(self.log[x as usize] as usize * e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_spot_values_0x11d() {
        // a^n mod X^8+X^4+X^3+X^2+1 for alpha = X
        let gf = Gf::gf256_vaisala();
        assert_eq!(gf.exp_alpha(0), 0x01);
        assert_eq!(gf.exp_alpha(1), 0x02);
        assert_eq!(gf.exp_alpha(8), 0x1D);
        assert_eq!(gf.exp_alpha(25), 0x03);
        assert_eq!(gf.exp_alpha(254), 0x8E);
        assert_eq!(gf.log_alpha(0x1D), 8);
    }

    #[test]
    fn mul_and_inv_are_consistent() {
        for gf in [Gf::gf256_vaisala(), Gf::gf256_ccsds()] {
            for p in 1..=255u8 {
                assert_eq!(gf.mul(p, gf.inv(p)), 1, "p={p:#x} f={:#x}", gf.f);
                assert_eq!(gf.mul(p, 1), p);
                assert_eq!(gf.mul(p, 0), 0);
            }
        }
    }

    #[test]
    fn gf64_wraps_at_63() {
        let gf = Gf::gf64_bch();
        assert_eq!(gf.exp_alpha(63), 0x01);
        assert_eq!(gf.exp_alpha(6), 0x03); // X^6 = X + 1 mod 0x43
    }

    #[test]
    fn non_primitive_element_rejected() {
        assert_eq!(
            Gf::new(0x11D, 256, 0x01).unwrap_err(),
            GfError::NotPrimitive(0x01, 256)
        );
    }
}
