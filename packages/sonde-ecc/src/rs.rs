//! rs.rs — Reed–Solomon encode/decode over GF(2^8).
//!
//! Decoding is the extended-Euclidean (Sugiyama) variant: syndromes, LFSR
//! key equation solve, Chien search, Forney error values. Erasure-and-error
//! decoding premultiplies the erasure locator into the syndrome polynomial.
//!
//! Two parameterizations are in service:
//! - Vaisala RS41/RS92: RS(255,231), t=12, b=0, p=1, field 0x11D
//! - LMS6 (CCSDS):      RS(255,223), t=16, b=112, p=11, field 0x187

use crate::gf::{Gf, MAX_DEG};
use thiserror::Error;

pub type Poly = [u8; MAX_DEG + 1];

pub const ZERO_POLY: Poly = [0u8; MAX_DEG + 1];

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RsError {
    /// Chien search found fewer roots than deg(Lambda).
    #[error("more errors than the code can correct")]
    TooManyErrors,
    /// Lambda(0) = 0: the key equation produced a degenerate locator.
    #[error("degenerate error locator")]
    DegenerateLocator,
    /// deg(Omega) out of range for the erasure count.
    #[error("error evaluator degree out of range")]
    EvaluatorDegree,
    #[error("erasure count exceeds parity capacity")]
    TooManyErasures,
}

impl RsError {
    /// Legacy numeric code, kept for frame-status reporting.
    pub fn code(self) -> i32 {
        match self {
            RsError::TooManyErrors => -1,
            RsError::DegenerateLocator => -2,
            RsError::EvaluatorDegree => -3,
            RsError::TooManyErasures => -4,
        }
    }
}

// ── Polynomial arithmetic over the field ──────────────────────────────────────

pub(crate) fn poly_deg(p: &Poly) -> i32 {
    let mut n = MAX_DEG as i32;
    while n > 0 && p[n as usize] == 0 {
        n -= 1;
    }
    if p[n as usize] == 0 {
        n -= 1; // deg(0) = -1
    }
    n
}

pub(crate) fn poly_eval(gf: &Gf, poly: &Poly, x: u8) -> u8 {
    let mut y = poly[0];
    if x != 0 {
        let logx = gf.log_alpha(x) as usize;
        for n in 1..gf.ord - 1 {
            let xn = gf.exp_alpha(n * logx);
            y ^= gf.mul(poly[n], xn);
        }
    }
    y
}

pub(crate) fn poly_add(a: &Poly, b: &Poly) -> Poly {
    let mut c = ZERO_POLY;
    for i in 0..=MAX_DEG {
        c[i] = a[i] ^ b[i];
    }
    c
}

pub(crate) fn poly_mul(gf: &Gf, a: &Poly, b: &Poly) -> Poly {
    let mut c = ZERO_POLY;
    let da = poly_deg(a);
    let db = poly_deg(b);
    if da < 0 || db < 0 {
        return c;
    }
    for i in 0..=da as usize {
        for j in 0..=db as usize {
            if i + j <= MAX_DEG {
                c[i + j] ^= gf.mul(a[i], b[j]);
            }
        }
    }
    c
}

/// p(x) = q(x)·d(x) + r(x), deg(r) < deg(q). q must be nonzero.
pub(crate) fn poly_divmod(gf: &Gf, p: &Poly, q: &Poly) -> (Poly, Poly) {
    let mut d = ZERO_POLY;
    let mut r = ZERO_POLY;

    let mut deg_p = poly_deg(p);
    let deg_q = poly_deg(q);
    debug_assert!(deg_q >= 0, "division by the zero polynomial");
    if deg_q < 0 {
        return (d, r);
    }

    if deg_q == 0 {
        let c = gf.inv(q[0]);
        for i in 0..=deg_p.max(0) as usize {
            d[i] = gf.mul(p[i], c);
        }
        return (d, r);
    }
    if deg_p < 0 {
        return (d, r);
    }
    if deg_p < deg_q {
        r[..=deg_p as usize].copy_from_slice(&p[..=deg_p as usize]);
        return (d, r);
    }

    r.copy_from_slice(p);
    let q_lead_inv = gf.inv(q[deg_q as usize]);
    let mut c = gf.mul(r[deg_p as usize], q_lead_inv);
    while deg_p >= deg_q {
        d[(deg_p - deg_q) as usize] = c;
        for i in 0..=deg_q as usize {
            r[deg_p as usize - i] ^= gf.mul(q[deg_q as usize - i], c);
        }
        while deg_p > 0 && r[deg_p as usize] == 0 {
            deg_p -= 1;
        }
        if r[deg_p as usize] == 0 {
            deg_p -= 1;
        }
        if deg_p >= 0 {
            c = gf.mul(r[deg_p as usize], q_lead_inv);
        }
    }
    (d, r)
}

/// Extended-Euclidean LFSR solve of S(x)·Lambda(x) = Omega(x) mod x^2t,
/// stopping when the remainder degree drops below `deg` (= t + e/2).
pub(crate) fn poly_lfsr(gf: &Gf, deg: i32, x2t: usize, s: &Poly) -> (Poly, Poly) {
    let mut r0 = *s;
    let mut r1 = ZERO_POLY;
    r1[x2t] = 1;
    let mut s0 = ZERO_POLY;
    s0[0] = 1;
    let mut s1 = ZERO_POLY;

    while poly_deg(&r1) >= deg {
        let (quo, r2) = poly_divmod(gf, &r0, &r1);
        r0 = r1;
        r1 = r2;
        let s2 = poly_add(&s0, &poly_mul(gf, &quo, &s1));
        s0 = s1;
        s1 = s2;
    }

    (s1, r1) // (Lambda, Omega)
}

/// Formal derivative; in characteristic 2 only odd-power terms survive.
pub(crate) fn poly_deriv(a: &Poly) -> Poly {
    let mut da = ZERO_POLY;
    let deg = poly_deg(a);
    let mut i = 1i32;
    while i <= deg {
        if i % 2 == 1 {
            da[(i - 1) as usize] = a[i as usize];
        }
        i += 1;
    }
    da
}

// ── Reed–Solomon codec ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReedSolomon {
    gf: Gf,
    pub n: usize,
    pub t: usize,
    /// Parity count R = 2t.
    pub r: usize,
    pub k: usize,
    b: u8,
    p: u8,
    ip: u8,
    g: Poly,
}

impl ReedSolomon {
    /// RS(255,231), t=12, b=0, p=1 — Vaisala RS41/RS92.
    pub fn vaisala() -> Self {
        Self::build(Gf::gf256_vaisala(), 255, 12, 0, 1)
    }

    /// RS(255,223), t=16, b=112, p=11 — CCSDS, used by LMS6.
    pub fn ccsds() -> Self {
        Self::build(Gf::gf256_ccsds(), 255, 16, 112, 11)
    }

    fn build(gf: Gf, n: usize, t: usize, b: u8, p: u8) -> Self {
        let r = 2 * t;
        let k = n - r;

        // p·ip = 1 mod (ord-1); beta = alpha^p is the root generator
        let mut ip = 1u8;
        for i in 1..gf.ord - 1 {
            if (p as usize * i) % (gf.ord - 1) == 1 {
                ip = i as u8;
                break;
            }
        }

        // g(X) = prod_{i=0}^{2t-1} (X - (alpha^p)^(b+i))
        let mut g = ZERO_POLY;
        g[0] = 1;
        let mut xalp = ZERO_POLY;
        xalp[1] = 1;
        for i in 0..r {
            xalp[0] = gf.exp_alpha(p as usize * (b as usize + i));
            g = poly_mul(&gf, &g, &xalp);
        }

        ReedSolomon {
            gf,
            n,
            t,
            r,
            k,
            b,
            p,
            ip,
            g,
        }
    }

    /// Syndromes S_i = cw((alpha^p)^(b+i)); true if any is nonzero.
    fn syndromes(&self, cw: &Poly) -> (Poly, bool) {
        let mut s = ZERO_POLY;
        let mut nonzero = false;
        for i in 0..self.r {
            let a_i = self.gf.exp_alpha(self.p as usize * (self.b as usize + i));
            s[i] = poly_eval(&self.gf, cw, a_i);
            if s[i] != 0 {
                nonzero = true;
            }
        }
        (s, nonzero)
    }

    /// Erasure locator sigma(X) = prod (1 - alpha^(p·j) X).
    fn era_sigma(&self, era_pos: &[u8]) -> Poly {
        let mut sig = ZERO_POLY;
        sig[0] = 1;
        let mut xa = ZERO_POLY;
        xa[0] = 1;
        for &j in era_pos {
            xa[1] = self.gf.exp_alpha(self.p as usize * j as usize);
            sig = poly_mul(&self.gf, &sig, &xa);
        }
        sig
    }

    /// Forney value Y = X^(b-1) · Omega(X^-1) / Lambda'(X^-1), x = X^-1.
    fn forney(&self, x: u8, omega: &Poly, lambda: &Poly) -> u8 {
        let dlam = poly_deriv(lambda);
        let w = poly_eval(&self.gf, omega, x);
        let z = poly_eval(&self.gf, &dlam, x);
        if z == 0 {
            return 0;
        }
        let mut y = self.gf.mul(w, self.gf.inv(z));
        if self.b == 0 {
            y = self.gf.mul(self.gf.inv(x), y);
        } else if self.b > 1 {
            let xb1 = self
                .gf
                .exp_alpha((self.b as usize - 1) * self.gf.log_alpha(x) as usize);
            y = self.gf.mul(xb1, y);
        }
        y
    }

    /// Systematic encode: parity of x^R·m(x) mod g(x) into `cw[0..R]`.
    /// The message occupies `cw[R..N]` (coefficient order, low index = low power).
    pub fn encode(&self, cw: &mut [u8]) {
        let mut m = ZERO_POLY;
        m[self.r..self.n].copy_from_slice(&cw[self.r..self.n]);
        let (_, parity) = poly_divmod(&self.gf, &m, &self.g);
        cw[..self.r].copy_from_slice(&parity[..self.r]);
    }

    /// Error-only decode; corrections are applied in place.
    /// Returns the number of corrected positions.
    pub fn decode(&self, cw: &mut [u8]) -> Result<usize, RsError> {
        self.decode_with_erasures(cw, &[])
    }

    /// Erasure-and-error decode: 2·errors + erasures ≤ 2t.
    pub fn decode_with_erasures(&self, cw: &mut [u8], era_pos: &[u8]) -> Result<usize, RsError> {
        let nera = era_pos.len();
        if nera > self.r {
            return Err(RsError::TooManyErasures);
        }

        let mut cwp = ZERO_POLY;
        cwp[..self.n].copy_from_slice(&cw[..self.n]);

        let (mut s, nonzero) = self.syndromes(&cwp);
        if !nonzero {
            return Ok(0);
        }

        let mut sigma = ZERO_POLY;
        sigma[0] = 1;
        if nera > 0 {
            sigma = self.era_sigma(era_pos);
            s = poly_mul(&self.gf, &sigma, &s);
            for i in self.r..=MAX_DEG {
                s[i] = 0; // sigma·S mod x^2t
            }
        }

        let (lambda, omega) = poly_lfsr(&self.gf, (self.t + nera / 2) as i32, self.r, &s);

        let deg_lambda = poly_deg(&lambda);
        let deg_omega = poly_deg(&omega);
        if deg_omega >= deg_lambda + nera as i32 {
            return Err(RsError::EvaluatorDegree);
        }
        let gamma = lambda[0];
        if gamma == 0 {
            return Err(RsError::DegenerateLocator);
        }
        let gamma_inv = self.gf.inv(gamma);
        let mut lambda_n = lambda;
        let mut omega_n = omega;
        for c in lambda_n.iter_mut() {
            *c = self.gf.mul(*c, gamma_inv);
        }
        for c in omega_n.iter_mut() {
            *c = self.gf.mul(*c, gamma_inv);
        }
        let sig_lam = poly_mul(&self.gf, &sigma, &lambda_n);
        let deg_sig_lam = poly_deg(&sig_lam);

        // Chien search over alpha^1..alpha^(ord-1); Lambda(0) = 1 excludes x=0.
        let mut nerr = 0usize;
        let mut err_pos = [0usize; MAX_DEG + 1];
        let mut err_val = [0u8; MAX_DEG + 1];
        for i in 1..self.gf.ord {
            let x = i as u8;
            if poly_eval(&self.gf, &sig_lam, x) == 0 {
                let x1 = self.gf.inv(x);
                err_pos[nerr] = (self.gf.log_alpha(x1) as usize * self.ip as usize)
                    % (self.gf.ord - 1);
                err_val[nerr] = self.forney(x, &omega_n, &sig_lam);
                nerr += 1;
            }
            if nerr as i32 >= deg_sig_lam {
                break;
            }
        }

        if (nerr as i32) < deg_sig_lam {
            return Err(RsError::TooManyErrors);
        }
        for j in 0..nerr {
            cw[err_pos[j]] ^= err_val[j];
        }
        Ok(nerr)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_codeword(rs: &ReedSolomon, rng: &mut StdRng) -> Vec<u8> {
        let mut cw = vec![0u8; rs.n];
        for b in cw[rs.r..].iter_mut() {
            *b = rng.gen();
        }
        rs.encode(&mut cw);
        cw
    }

    #[test]
    fn generator_polynomials() {
        let rs = ReedSolomon::vaisala();
        assert_eq!(poly_deg(&rs.g), 24);
        assert_eq!(rs.g[24], 1);

        let rs = ReedSolomon::ccsds();
        assert_eq!(poly_deg(&rs.g), 32);
        // the CCSDS generator is palindromic
        for i in 0..=32 {
            assert_eq!(rs.g[i], rs.g[32 - i], "g[{i}]");
        }
        assert_eq!(rs.g[16], rs.gf.exp_alpha(24));
    }

    #[test]
    fn encode_yields_zero_syndromes() {
        let mut rng = StdRng::seed_from_u64(7);
        for rs in [ReedSolomon::vaisala(), ReedSolomon::ccsds()] {
            let mut cw = random_codeword(&rs, &mut rng);
            assert_eq!(rs.decode(&mut cw), Ok(0));
        }
    }

    #[test]
    fn corrects_up_to_t_errors_and_reports_the_weight() {
        let mut rng = StdRng::seed_from_u64(42);
        for rs in [ReedSolomon::vaisala(), ReedSolomon::ccsds()] {
            for weight in 1..=rs.t {
                let clean = random_codeword(&rs, &mut rng);
                let mut cw = clean.clone();
                let mut hit = std::collections::BTreeSet::new();
                while hit.len() < weight {
                    hit.insert(rng.gen_range(0..rs.n));
                }
                for &pos in &hit {
                    cw[pos] ^= rng.gen_range(1..=255u8);
                }
                assert_eq!(rs.decode(&mut cw), Ok(weight), "weight {weight}");
                assert_eq!(cw, clean);
            }
        }
    }

    #[test]
    fn erasures_extend_the_correction_radius() {
        let mut rng = StdRng::seed_from_u64(1234);
        let rs = ReedSolomon::vaisala();
        // e erasures + f errors with e + 2f <= 2t
        for (nera, nerr) in [(4usize, 10usize), (10, 7), (20, 2), (24, 0)] {
            let clean = random_codeword(&rs, &mut rng);
            let mut cw = clean.clone();
            let mut hit = std::collections::BTreeSet::new();
            while hit.len() < nera + nerr {
                hit.insert(rng.gen_range(0..rs.n));
            }
            let hit: Vec<usize> = hit.into_iter().collect();
            for &pos in &hit {
                cw[pos] ^= rng.gen_range(1..=255u8);
            }
            let era: Vec<u8> = hit[..nera].iter().map(|&p| p as u8).collect();
            let n = rs.decode_with_erasures(&mut cw, &era).unwrap();
            assert_eq!(n, nera + nerr);
            assert_eq!(cw, clean);
        }
    }

    #[test]
    fn erasure_overflow_is_rejected() {
        let rs = ReedSolomon::vaisala();
        let mut cw = vec![0u8; rs.n];
        let era: Vec<u8> = (0..25).collect();
        assert_eq!(
            rs.decode_with_erasures(&mut cw, &era),
            Err(RsError::TooManyErasures)
        );
    }

    #[test]
    fn interleaved_pair_layout_round_trip() {
        // RS41-style: two codewords from odd/even message bytes
        let mut rng = StdRng::seed_from_u64(99);
        let rs = ReedSolomon::vaisala();
        let mut frame = vec![0u8; 518];
        for b in frame.iter_mut() {
            *b = rng.gen();
        }
        let (mut cw1, mut cw2) = (vec![0u8; 255], vec![0u8; 255]);
        for i in 0..rs.k {
            cw1[rs.r + i] = frame[56 + 2 * i];
            cw2[rs.r + i] = frame[56 + 2 * i + 1];
        }
        rs.encode(&mut cw1);
        rs.encode(&mut cw2);
        cw1[100] ^= 0x5A;
        cw2[7] ^= 0x01;
        cw2[200] ^= 0xFF;
        assert_eq!(rs.decode(&mut cw1), Ok(1));
        assert_eq!(rs.decode(&mut cw2), Ok(2));
        for i in 0..rs.k {
            assert_eq!(cw1[rs.r + i], frame[56 + 2 * i]);
            assert_eq!(cw2[rs.r + i], frame[56 + 2 * i + 1]);
        }
    }
}
