//! framing.rs — header acquisition shared by all sonde decoders.
//!
//! Feeds samples, schedules a correlator pass every K-4 samples, and turns
//! qualifying peaks into verified header positions: a peak must beat the
//! threshold, lie strictly after the previously accepted peak, and survive
//! the header re-slice (with a single +1-sample retry for near misses).

use crate::dsp::SymbolSync;
use crate::wav::{SampleSource, SourceError};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct HeaderFound {
    /// Sample index of the correlation peak (last header sample).
    pub pos: u64,
    /// Peak had negative polarity (signal inverted relative to the pattern).
    pub inverted: bool,
    /// Header bit errors after the retry policy.
    pub errs: usize,
}

pub struct Scanner {
    /// Correlator block length from the synchronizer init.
    k: usize,
    k_count: usize,
    thres: f32,
    /// Accept negative peaks too (M10, LMS6).
    both_signs: bool,
    /// Maximum tolerated header bit errors.
    tolerance: usize,
    /// Manchester pairs during header compare.
    symlen: u32,
    /// Samples are globally inverted (`-i`).
    invert: bool,
    /// Fold the window mean into the DC offset on near-matches (`--dc`).
    dc: bool,
    mv_pos: u64,
    accepted: u64,
}

impl Scanner {
    pub fn new(k: usize, thres: f32, tolerance: usize, symlen: u32, both_signs: bool) -> Self {
        Scanner {
            k,
            k_count: 0,
            thres,
            both_signs,
            tolerance,
            symlen,
            invert: false,
            dc: false,
            mv_pos: 0,
            accepted: 0,
        }
    }

    pub fn invert(mut self, inv: bool) -> Self {
        self.invert = inv;
        self
    }

    pub fn dc_tracking(mut self, dc: bool) -> Self {
        self.dc = dc;
        self
    }

    /// Run until the next verified header or EOF.
    pub fn next_header<S: SampleSource>(
        &mut self,
        sync: &mut SymbolSync<S>,
    ) -> Result<Option<HeaderFound>, SourceError> {
        loop {
            if !sync.feed(self.invert)? {
                return Ok(None);
            }

            self.k_count += 1;
            if self.k_count < self.k.saturating_sub(4) {
                continue;
            }
            self.k_count = 0;

            let mv0_pos = self.mv_pos;
            let Some((mv, mv_pos)) = sync.corr_dft(self.k)? else {
                continue;
            };
            self.mv_pos = mv_pos;

            let strong = if self.both_signs {
                mv.abs() > self.thres
            } else {
                mv > self.thres
            };
            if !strong || mv_pos <= mv0_pos {
                continue;
            }

            let inv = mv < 0.0;
            let mut errs = sync.head_cmp(self.symlen, mv_pos, inv, self.dc);
            if errs > 0 && errs <= 3 {
                // one-sample re-slice for near misses
                let retry = sync.head_cmp(self.symlen, mv_pos + 1, inv, self.dc);
                if retry < errs {
                    errs = retry;
                }
            }
            if errs <= self.tolerance && mv_pos > self.accepted {
                self.accepted = mv_pos;
                debug!(pos = mv_pos, corr = mv, errs, "header");
                return Ok(Some(HeaderFound {
                    pos: mv_pos,
                    inverted: inv,
                    errs,
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::PulseShape;
    use crate::wav::{SampleSource, SourceError};

    struct PatternSource {
        samples: Vec<f32>,
        pos: usize,
    }

    impl SampleSource for PatternSource {
        fn next_sample(&mut self) -> Result<Option<f32>, SourceError> {
            let s = self.samples.get(self.pos).copied();
            self.pos += 1;
            Ok(s)
        }
    }

    const HDR: &str = "0000100001101101010100111000100001000100011010010100100000011111";

    fn nrz(bits: &str, spb: usize, amp: f32) -> Vec<f32> {
        bits.bytes()
            .flat_map(|c| {
                let v = if c == b'1' { amp } else { -amp };
                std::iter::repeat(v).take(spb)
            })
            .collect()
    }

    #[test]
    fn accepted_peaks_are_strictly_monotonic() {
        let spb = 10usize;
        let gap = "10".repeat(200);
        let mut samples = vec![0.01f32; 2500];
        for _ in 0..3 {
            samples.extend(nrz(HDR, spb, 0.6));
            samples.extend(nrz(&gap, spb, 0.6));
        }
        let src = PatternSource { samples, pos: 0 };
        let (mut sync, k) = SymbolSync::fft(src, HDR, spb as f32, PulseShape::Gauss);
        let mut scanner = Scanner::new(k, 0.6, 2, 1, false);

        let mut found = Vec::new();
        while let Some(h) = scanner.next_header(&mut sync).unwrap() {
            assert!(h.errs <= 2);
            found.push(h.pos);
        }
        assert!(!found.is_empty(), "no headers found");
        for w in found.windows(2) {
            assert!(w[0] < w[1], "non-monotonic accepts {found:?}");
        }
    }
}
