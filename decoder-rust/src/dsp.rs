//! dsp.rs — symbol synchronizer: sample ring, matched filter, correlator,
//! integrate-and-dump bit slicer.
//!
//! The synchronizer owns every buffer (sample ring, running mean/variance
//! rings, DFT scratch); downstream readers observe positions through
//! `sample_out = sample_in - delay`. Two correlator backends exist:
//!
//! - FFT: the reference is stored time-reversed and transformed once; each
//!   peak search transforms the current window, multiplies, and inverse
//!   transforms. Peaks on the block boundary are rejected.
//! - time domain: a normalized correlation is computed per fed sample into a
//!   correlation ring; the held maximum is only rescanned when it expires or
//!   a local descent confirms it.

use crate::wav::{SampleSource, SourceError};

// ── Small complex type for the DFT scratch ────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Cplx {
    pub re: f32,
    pub im: f32,
}

impl Cplx {
    pub fn new(re: f32, im: f32) -> Self {
        Cplx { re, im }
    }

    pub fn conj(self) -> Self {
        Cplx::new(self.re, -self.im)
    }
}

impl std::ops::Add for Cplx {
    type Output = Cplx;
    fn add(self, o: Cplx) -> Cplx {
        Cplx::new(self.re + o.re, self.im + o.im)
    }
}

impl std::ops::Sub for Cplx {
    type Output = Cplx;
    fn sub(self, o: Cplx) -> Cplx {
        Cplx::new(self.re - o.re, self.im - o.im)
    }
}

impl std::ops::Mul for Cplx {
    type Output = Cplx;
    fn mul(self, o: Cplx) -> Cplx {
        Cplx::new(
            self.re * o.re - self.im * o.im,
            self.re * o.im + self.im * o.re,
        )
    }
}

// ── Matched filter shaping ────────────────────────────────────────────────────

/// Pulse shaping applied to the ±1 header pattern at symbol transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseShape {
    /// Flat with slightly damped edge samples.
    Edge,
    /// Triangular taper clipped outside |x| > 0.6.
    Clipped,
    /// Gaussian, alpha = exp(0.8).
    Gauss,
    /// Raised linear 1-|x|.
    Linear,
}

/// Build the unit-norm matched filter for a raw header bit pattern.
/// `x` runs -1..1 across each symbol; only transition flanks are shaped.
pub fn matched_filter(header: &[u8], spb: f32, shape: PulseShape) -> Vec<f32> {
    let hlen = header.len();
    let l = (hlen as f32 * spb + 0.5) as usize;
    let alpha = (0.8f64).exp();
    let sqalp = (alpha / std::f64::consts::PI).sqrt();

    let mut m = vec![0.0f64; l];
    for (i, mi) in m.iter_mut().enumerate() {
        let pos = (i as f32 / spb) as usize;
        let pos = pos.min(hlen - 1);
        let x = ((i as f32 - pos as f32 * spb) * 2.0 / spb - 1.0) as f64;
        let mut a = sqalp;

        let flank = (pos + 1 < hlen && header[pos] != header[pos + 1] && x > 0.0)
            || (pos > 0 && header[pos - 1] != header[pos] && x < 0.0);
        if flank {
            a = match shape {
                PulseShape::Clipped => {
                    if x.abs() > 0.6 {
                        sqalp * (1.0 - x.abs()) / 0.6
                    } else {
                        sqalp
                    }
                }
                PulseShape::Gauss => sqalp * (-alpha * x * x).exp(),
                PulseShape::Linear => 1.0 - x.abs(),
                PulseShape::Edge => {
                    let frac = i as f32 - pos as f32 * spb;
                    if frac < 2.0 || frac > spb - 2.0 {
                        0.8 * sqalp
                    } else {
                        sqalp
                    }
                }
            };
        }

        let b = ((header[pos] & 1) as f64 - 0.5) * 2.0;
        *mi = b * a;
    }

    let norm: f64 = m.iter().map(|&x| x * x).sum::<f64>().sqrt();
    m.iter().map(|&x| (x / norm) as f32).collect()
}

// ── Symbol synchronizer ───────────────────────────────────────────────────────

enum Correlator {
    Fft {
        n_dft: usize,
        log2n: usize,
        /// Stage twiddles exp(-i·pi/2^s).
        ew: Vec<Cplx>,
        /// DFT of the time-reversed reference.
        fm: Vec<Cplx>,
        /// Scratch, reused across peak searches.
        x: Vec<Cplx>,
        z: Vec<Cplx>,
    },
    Time {
        corrbuf: Vec<f32>,
        mfilt_n: usize,
        max_v: f32,
        max_pos: u64,
    },
}

pub struct SymbolSync<S: SampleSource> {
    src: S,
    pub spb: f32,
    header: Vec<u8>,
    /// Header length in samples.
    pub l: usize,
    /// Ring size.
    m: usize,
    delay: usize,
    sample_in: u64,
    sample_out: u64,
    /// Samples already in the ring that bit reads must consume first.
    buffered: i64,
    bufs: Vec<f32>,
    xs: Vec<f32>,
    qs: Vec<f32>,
    xsum: f64,
    qsum: f64,
    nvar: usize,
    dc_ofs: f32,
    dc: f32,
    mfilt: Vec<f32>,
    corr: Correlator,
    // integrate-and-dump state
    bitgrenze: f64,
    scount: u64,
}

fn parse_header_bits(header: &str) -> Vec<u8> {
    header.bytes().map(|c| c & 1).collect()
}

impl<S: SampleSource> SymbolSync<S> {
    /// FFT-backed synchronizer. Returns the peak-search block length K.
    pub fn fft(src: S, header: &str, spb: f32, shape: PulseShape) -> (Self, usize) {
        let bits = parse_header_bits(header);
        let mfilt = matched_filter(&bits, spb, shape);
        let l = mfilt.len();

        let mut p2 = 1usize;
        while p2 < 3 * l {
            p2 <<= 1;
        }
        while p2 < 0x2000 {
            p2 <<= 1;
        }
        let n_dft = p2;
        let m = p2;
        let log2n = n_dft.trailing_zeros() as usize;

        let delay = l / 16;
        let k = m - l - delay;
        let nvar = l;

        let mut ew = vec![Cplx::default(); log2n];
        for (n, w) in ew.iter_mut().enumerate() {
            let phi = -std::f64::consts::PI / (1u64 << n) as f64;
            *w = Cplx::new(phi.cos() as f32, phi.sin() as f32);
        }

        let mut sync = SymbolSync {
            src,
            spb,
            header: bits,
            l,
            m,
            delay,
            sample_in: 0,
            sample_out: 0,
            buffered: 0,
            bufs: vec![0.0; m],
            xs: vec![0.0; m],
            qs: vec![0.0; m],
            xsum: 0.0,
            qsum: 0.0,
            nvar,
            dc_ofs: 0.0,
            dc: 0.0,
            mfilt,
            corr: Correlator::Fft {
                n_dft,
                log2n,
                ew,
                fm: vec![Cplx::default(); n_dft],
                x: vec![Cplx::default(); n_dft],
                z: vec![Cplx::default(); n_dft],
            },
            bitgrenze: 0.0,
            scount: 0,
        };

        // reference spectrum: time-reversed filter, zero-padded
        let mut mrev = vec![0.0f32; n_dft];
        for i in 0..l {
            mrev[l - 1 - i] = sync.mfilt[i];
        }
        let mut fm = vec![Cplx::default(); n_dft];
        for (i, &v) in mrev.iter().enumerate() {
            fm[i] = Cplx::new(v, 0.0);
        }
        sync.dft_raw(&mut fm);
        if let Correlator::Fft { fm: slot, .. } = &mut sync.corr {
            *slot = fm;
        }

        (sync, k)
    }

    /// Time-domain synchronizer (per-sample correlation ring).
    pub fn time(src: S, header: &str, spb: f32, shape: PulseShape) -> (Self, usize) {
        let bits = parse_header_bits(header);
        let mfilt = matched_filter(&bits, spb, shape);
        let n = mfilt.len();
        let m = 2 * n;
        let delay = n / 4;
        let nvar = (32.0 * spb) as usize;

        let sync = SymbolSync {
            src,
            spb,
            header: bits,
            l: n,
            m,
            delay,
            sample_in: 0,
            sample_out: 0,
            buffered: 0,
            bufs: vec![0.0; m],
            xs: vec![0.0; m],
            qs: vec![0.0; m],
            xsum: 0.0,
            qsum: 0.0,
            nvar,
            dc_ofs: 0.0,
            dc: 0.0,
            mfilt,
            corr: Correlator::Time {
                corrbuf: vec![0.0; m],
                mfilt_n: n,
                max_v: -1.0,
                max_pos: 0,
            },
            bitgrenze: 0.0,
            scount: 0,
        };

        (sync, n)
    }

    pub fn sample_out(&self) -> u64 {
        self.sample_out
    }

    #[inline]
    fn at(&self, idx: i64) -> f32 {
        self.bufs[idx.rem_euclid(self.m as i64) as usize]
    }

    /// Pull one sample into the ring; false at EOF.
    pub fn feed(&mut self, inv: bool) -> Result<bool, SourceError> {
        let Some(mut s) = self.src.next_sample()? else {
            return Ok(false);
        };
        if inv {
            s = -s;
        }
        s -= self.dc_ofs;

        let slot = (self.sample_in % self.m as u64) as usize;
        self.bufs[slot] = s;

        let xneu = s as f64;
        let xalt = self.at(self.sample_in as i64 - self.nvar as i64) as f64;
        self.xsum += xneu - xalt;
        self.qsum += (xneu - xalt) * (xneu + xalt);
        self.xs[slot] = self.xsum as f32;
        self.qs[slot] = self.qsum as f32;

        if let Correlator::Time {
            corrbuf, mfilt_n, ..
        } = &mut self.corr
        {
            let n = *mfilt_n;
            let mut corr = 0.0f32;
            let mut norm = 0.0f32;
            for i in 1..n - 1 {
                let x = self.bufs
                    [(self.sample_in as i64 - (n as i64 - 1) + i as i64).rem_euclid(self.m as i64)
                        as usize];
                corr += self.mfilt[i] * x;
                norm += x * x;
            }
            corrbuf[slot] = if norm > 0.0 { corr / norm.sqrt() } else { 0.0 };
        }

        self.sample_out = self.sample_in.saturating_sub(self.delay as u64);
        self.sample_in += 1;
        Ok(true)
    }

    /// Mean over the last Nvar samples, at `ofs` relative to `sample_out`.
    pub fn buf_mu(&self, ofs: i64) -> f32 {
        let idx = (self.sample_out as i64 + ofs).rem_euclid(self.m as i64) as usize;
        self.xs[idx] / self.nvar as f32
    }

    /// Variance over the last Nvar samples.
    pub fn buf_var(&self, ofs: i64) -> f32 {
        let idx = (self.sample_out as i64 + ofs).rem_euclid(self.m as i64) as usize;
        let mu = self.xs[idx] / self.nvar as f32;
        self.qs[idx] / self.nvar as f32 - mu * mu
    }

    fn dft_raw(&self, z: &mut [Cplx]) {
        let (n, log2n, ew) = match &self.corr {
            Correlator::Fft { n_dft, log2n, ew, .. } => (*n_dft, *log2n, ew),
            Correlator::Time { .. } => return,
        };

        let mut j = 1usize;
        for i in 1..n {
            if i < j {
                z.swap(j - 1, i - 1);
            }
            let mut k = n / 2;
            while k < j {
                j -= k;
                k /= 2;
            }
            j += k;
        }

        for s in 0..log2n {
            let l2 = 1usize << s;
            let l = l2 << 1;
            let mut w1 = Cplx::new(1.0, 0.0);
            let w2 = ew[s];
            for j in 1..=l2 {
                let mut i = j;
                while i <= n {
                    let k = i + l2;
                    let t = z[k - 1] * w1;
                    z[k - 1] = z[i - 1] - t;
                    z[i - 1] = z[i - 1] + t;
                    i += l;
                }
                w1 = w1 * w2;
            }
        }
    }

    /// FFT peak search over the last K+L samples.
    ///
    /// Returns `(value, position)` of the strongest interior correlation
    /// maximum; block-boundary hits return `None`. The value keeps its sign
    /// so callers can detect inverted polarity.
    pub fn corr_dft(&mut self, k: usize) -> Result<Option<(f32, u64)>, SourceError> {
        let l = self.l;
        let pos = self.sample_out;

        let (n_dft, kl) = match &self.corr {
            Correlator::Fft { n_dft, .. } => (*n_dft, k + l),
            Correlator::Time { .. } => return Ok(None),
        };
        if kl > n_dft || pos < l as u64 {
            return Ok(None);
        }

        let (mut x, mut z) = match &mut self.corr {
            Correlator::Fft { x, z, .. } => (std::mem::take(x), std::mem::take(z)),
            Correlator::Time { .. } => unreachable!(),
        };

        // window copy, zero-padded
        for (i, xi) in x.iter_mut().enumerate() {
            *xi = if i < kl {
                Cplx::new(self.at(pos as i64 - (kl as i64 - 1) + i as i64), 0.0)
            } else {
                Cplx::default()
            };
        }

        self.dc = self.buf_mu(0);

        self.dft_raw(&mut x);

        if let Correlator::Fft { fm, .. } = &self.corr {
            for i in 0..n_dft {
                z[i] = x[i] * fm[i];
            }
        }
        // inverse via conjugate-forward; the correlation of two real signals
        // leaves the imaginary part zero
        for zi in z.iter_mut() {
            *zi = zi.conj();
        }
        self.dft_raw(&mut z);

        let mut mx = 0.0f32;
        let mut mx2 = 0.0f32;
        let mut mp: i64 = -1;
        for (i, zi) in z.iter().enumerate().take(kl).skip(l - 1) {
            let re = zi.re;
            if re * re > mx2 {
                mx = re;
                mx2 = re * re;
                mp = i as i64;
            }
        }

        if let Correlator::Fft { x: sx, z: sz, .. } = &mut self.corr {
            *sx = x;
            *sz = z;
        }

        if mp <= (l - 1) as i64 || mp == (kl - 1) as i64 {
            return Ok(None); // boundary artifact
        }

        let mpos = pos - (kl as u64 - 1) + mp as u64;
        let qnorm = self.qs[(mpos % self.m as u64) as usize].max(0.0).sqrt();
        if qnorm > 0.0 {
            mx /= qnorm * n_dft as f32;
        }

        self.buffered = (self.sample_out - mpos) as i64;

        Ok(Some((mx, mpos)))
    }

    /// Time-domain held-maximum search over the last `len` header bits.
    ///
    /// The held maximum is rescanned when the window has slid past it, or
    /// when a local descent at the leading edge confirms a fresh peak.
    /// Boundary samples never qualify.
    pub fn max_corr(&mut self, len: usize) -> Option<(f32, u64)> {
        if self.sample_in < self.delay as u64 {
            return None;
        }
        let spb = self.spb;
        let m = self.m;
        let sample_out = self.sample_out;

        let Correlator::Time {
            corrbuf,
            max_v,
            max_pos,
            ..
        } = &mut self.corr
        else {
            return None;
        };

        let mut slen = (len as f32 * spb) as usize;
        if slen > m {
            slen = m;
        }
        if sample_out < slen as u64 {
            return None;
        }

        let s_neu = corrbuf[(sample_out % m as u64) as usize];
        let s_vor = corrbuf[((sample_out as i64 - 1).rem_euclid(m as i64)) as usize];

        let expired = sample_out.saturating_sub(*max_pos) >= (slen - 4) as u64;
        let confirmed = sample_out.saturating_sub(*max_pos) < slen as u64
            && *max_v <= s_vor
            && s_vor >= s_neu;

        if expired || confirmed {
            let mut best = -1.0f32;
            let mut best_pos = sample_out.saturating_sub(slen as u64 - 1);
            for p in 1..slen {
                let base = sample_out as i64 - slen as i64 + p as i64;
                let s0 = corrbuf[(base - 1).rem_euclid(m as i64) as usize];
                let s = corrbuf[base.rem_euclid(m as i64) as usize];
                let s1 = corrbuf[(base + 1).rem_euclid(m as i64) as usize];
                if s > best && s >= s0 && s >= s1 {
                    best = s;
                    best_pos = base as u64;
                }
            }
            *max_v = best;
            *max_pos = best_pos;
        }

        Some((*max_v, *max_pos))
    }

    fn pull(&mut self, inv: bool) -> Result<bool, SourceError> {
        if self.buffered > 0 {
            self.buffered -= 1;
            Ok(true)
        } else {
            self.feed(inv)
        }
    }

    #[inline]
    fn slice_at(&self, ofs: i32, spike: bool) -> f32 {
        let idx = self.sample_out as i64 - self.buffered + ofs as i64;
        let sample = self.at(idx);
        if spike {
            let avg = 0.5 * (self.at(idx - 1) + self.at(idx + 1));
            if (sample - avg).abs() > 0.5 {
                return avg + 0.27 * (sample - avg);
            }
        }
        sample
    }

    /// Integrate-and-dump hard bit. `symlen` 2 is a Manchester pair whose
    /// first half enters the sum negated. `None` at EOF.
    pub fn read_bit(
        &mut self,
        symlen: u32,
        inv: bool,
        ofs: i32,
        reset: bool,
        spike: bool,
    ) -> Result<Option<u8>, SourceError> {
        if reset {
            self.scount = 0;
            self.bitgrenze = 0.0;
        }

        let mut sum = 0.0f64;

        if symlen == 2 {
            self.bitgrenze += self.spb as f64;
            loop {
                if !self.pull(inv)? {
                    return Ok(None);
                }
                sum -= self.slice_at(ofs, spike) as f64;
                self.scount += 1;
                if self.scount as f64 >= self.bitgrenze {
                    break;
                }
            }
        }

        self.bitgrenze += self.spb as f64;
        loop {
            if !self.pull(inv)? {
                return Ok(None);
            }
            sum += self.slice_at(ofs, spike) as f64;
            self.scount += 1;
            if self.scount as f64 >= self.bitgrenze {
                break;
            }
        }

        Ok(Some(if sum >= 0.0 { 1 } else { 0 }))
    }

    /// Soft bit: interior-window mean, clipped against the header level and
    /// rescaled to ±1. Returns `(hard, soft)`.
    pub fn read_soft_bit(
        &mut self,
        symlen: u32,
        level: f32,
        inv: bool,
        ofs: i32,
        reset: bool,
    ) -> Result<Option<(u8, f32)>, SourceError> {
        if reset {
            self.scount = 0;
            self.bitgrenze = 0.0;
        }

        let mut sum = 0.0f64;
        let mut n = 0u32;
        let spb = self.spb as f64;

        if symlen == 2 {
            self.bitgrenze += spb;
            loop {
                if !self.pull(inv)? {
                    return Ok(None);
                }
                let s = self.slice_at(ofs, false) as f64;
                let sc = self.scount as f64;
                if sc > self.bitgrenze - spb && sc < self.bitgrenze - 2.0 {
                    sum -= s;
                    n += 1;
                }
                self.scount += 1;
                if self.scount as f64 >= self.bitgrenze {
                    break;
                }
            }
        }

        self.bitgrenze += spb;
        loop {
            if !self.pull(inv)? {
                return Ok(None);
            }
            let s = self.slice_at(ofs, false) as f64;
            let sc = self.scount as f64;
            if sc > self.bitgrenze - spb && sc < self.bitgrenze - 2.0 {
                sum += s;
                n += 1;
            }
            self.scount += 1;
            if self.scount as f64 >= self.bitgrenze {
                break;
            }
        }

        let bit = if sum >= 0.0 { 1 } else { 0 };
        let mut sb = (sum / n.max(1) as f64) as f32;

        if sb > 2.5 * level {
            sb = 0.8 * level;
        }
        if sb > level {
            sb = level;
        }
        if sb < -2.5 * level {
            sb = -0.8 * level;
        }
        if sb < -level {
            sb = -level;
        }
        sb /= level;

        Ok(Some((bit, sb)))
    }

    /// Average symbol amplitude across the header ending at `pos`.
    pub fn header_level(&self, pos: u64, inv: bool) -> f32 {
        let hlen = self.header.len();
        let mut sum = 0.0f64;
        let mut n = 0usize;
        let mut bitn = 0usize;
        while bitn < hlen && n < self.l {
            let sgn = (self.header[bitn] as i32 * 2 - 1) as f64;
            let mut s = self.at(pos as i64 - self.l as i64 + n as i64) as f64;
            if inv {
                s = -s;
            }
            sum += s * sgn;
            n += 1;
            bitn = (n as f32 / self.spb) as usize;
        }
        (sum / n as f64) as f32
    }

    /// Re-slice the header symbols at a candidate peak and count bit errors
    /// against the stored pattern. `opt_dc` folds the window mean into the
    /// DC offset on a near-match.
    pub fn head_cmp(&mut self, symlen: u32, mvp: u64, inv: bool, opt_dc: bool) -> usize {
        let hlen = self.header.len();
        let base = mvp as i64 + 1 - (hlen as f32 * self.spb) as i64;

        let mut raw = vec![0u8; hlen];
        let mut rcount = 0u64;
        let mut grenze = 0.0f64;
        let step = if symlen == 2 { 2 } else { 1 };

        let mut pos = 0usize;
        while pos < hlen {
            let mut sum = 0.0f64;
            grenze += self.spb as f64;
            loop {
                sum += self.at(base + rcount as i64) as f64;
                rcount += 1;
                if rcount as f64 >= grenze {
                    break;
                }
            }
            if symlen == 2 {
                grenze += self.spb as f64;
                loop {
                    sum -= self.at(base + rcount as i64) as f64;
                    rcount += 1;
                    if rcount as f64 >= grenze {
                        break;
                    }
                }
                if sum >= 0.0 {
                    raw[pos] = 1;
                    raw[pos + 1] = 0;
                } else {
                    raw[pos] = 0;
                    raw[pos + 1] = 1;
                }
            } else {
                raw[pos] = (sum >= 0.0) as u8;
            }
            pos += step;
        }

        let sign = inv as u8;
        let errs = raw
            .iter()
            .zip(self.header.iter())
            .filter(|&(&r, &h)| (r ^ sign) != h)
            .count();

        if opt_dc && errs < 3 {
            self.dc_ofs += self.dc;
        }

        errs
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
