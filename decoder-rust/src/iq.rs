//! iq.rs — FM discriminator front-end for IQ input.
//!
//! Converts an interleaved float32 I/Q stream into the real-valued FM
//! baseband the demodulator expects: arg(conj(z[n-1])·z[n]) per sample,
//! optionally low-passed, plus a running spectral-offset estimate obtained
//! by summing phase increments over one header length.

use std::io::Read;

use crate::wav::{IqSource, SampleSource, SourceError};
use tracing::info;

pub struct FmDemod<R: Read> {
    src: IqSource<R>,
    prev: (f32, f32),
    /// One-pole low-pass coefficient in (0, 1]; 1.0 disables the filter.
    lp_a: f32,
    lp_y: f32,
    /// Phase increments summed over the last `ofs_len` samples.
    ofs_acc: f64,
    ofs_win: Vec<f32>,
    ofs_idx: usize,
    sample_rate: u32,
    reported: bool,
}

impl<R: Read> FmDemod<R> {
    /// `ofs_len` is one header length in samples; `lowpass` < 1.0 enables
    /// the single-pole smoother.
    pub fn new(src: IqSource<R>, ofs_len: usize, lowpass: f32) -> Self {
        let sample_rate = src.sample_rate;
        FmDemod {
            src,
            prev: (0.0, 0.0),
            lp_a: lowpass.clamp(0.01, 1.0),
            lp_y: 0.0,
            ofs_acc: 0.0,
            ofs_win: vec![0.0; ofs_len.max(1)],
            ofs_idx: 0,
            sample_rate,
            reported: false,
        }
    }

    /// Current tuning offset estimate in Hz.
    pub fn freq_offset(&self) -> f64 {
        let n = self.ofs_win.len() as f64;
        self.ofs_acc / n * self.sample_rate as f64 / (2.0 * std::f64::consts::PI)
    }
}

impl<R: Read> SampleSource for FmDemod<R> {
    fn next_sample(&mut self) -> Result<Option<f32>, SourceError> {
        let Some((i, q)) = self.src.next_pair()? else {
            return Ok(None);
        };

        // conj(z0)·z1
        let (i0, q0) = self.prev;
        let re = i0 * i + q0 * q;
        let im = i0 * q - q0 * i;
        self.prev = (i, q);

        let dphi = im.atan2(re);

        // sliding-window sum of phase increments
        self.ofs_acc += (dphi - self.ofs_win[self.ofs_idx]) as f64;
        self.ofs_win[self.ofs_idx] = dphi;
        self.ofs_idx = (self.ofs_idx + 1) % self.ofs_win.len();
        if self.ofs_idx == 0 && !self.reported {
            info!(offset_hz = self.freq_offset(), "iq tuning offset");
            self.reported = true;
        }

        // normalize to roughly [-1, 1] and smooth
        let s = dphi / std::f32::consts::PI;
        self.lp_y += self.lp_a * (s - self.lp_y);
        Ok(Some(self.lp_y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iq_bytes(pairs: &[(f32, f32)]) -> Vec<u8> {
        let mut v = Vec::new();
        for &(i, q) in pairs {
            v.extend(i.to_le_bytes());
            v.extend(q.to_le_bytes());
        }
        v
    }

    #[test]
    fn constant_tone_gives_constant_output() {
        // complex exponential at fs/8 -> dphi = 2*pi/8 per sample
        let n = 256;
        let pairs: Vec<(f32, f32)> = (0..n)
            .map(|k| {
                let phi = 2.0 * std::f32::consts::PI * k as f32 / 8.0;
                (phi.cos(), phi.sin())
            })
            .collect();
        let data = iq_bytes(&pairs);
        let src = IqSource::new(&data[..], 8000);
        let mut fm = FmDemod::new(src, 64, 1.0);

        let mut last = 0.0;
        for _ in 0..n {
            last = fm.next_sample().unwrap().unwrap();
        }
        // dphi/pi = 1/4
        assert!((last - 0.25).abs() < 1e-3, "got {last}");
        // offset: fs/8 = 1000 Hz
        assert!((fm.freq_offset() - 1000.0).abs() < 10.0);
    }

    #[test]
    fn fsk_tones_map_to_opposite_signs() {
        let mut pairs = Vec::new();
        let mut phi = 0.0f32;
        for k in 0..400 {
            let f = if (k / 50) % 2 == 0 { 0.05 } else { -0.05 };
            phi += 2.0 * std::f32::consts::PI * f;
            pairs.push((phi.cos(), phi.sin()));
        }
        let data = iq_bytes(&pairs);
        let src = IqSource::new(&data[..], 48_000);
        let mut fm = FmDemod::new(src, 32, 1.0);

        let mut out = Vec::new();
        while let Some(s) = fm.next_sample().unwrap() {
            out.push(s);
        }
        // steady-state samples away from tone switches
        assert!(out[30] > 0.05);
        assert!(out[80] < -0.05);
        assert!(out[130] > 0.05);
    }
}
