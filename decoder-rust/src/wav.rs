//! wav.rs — sample sources: RIFF/WAVE PCM, headerless PCM, float32 IQ.
//!
//! Every source yields a lazy, finite, non-restartable stream of mono f32
//! samples in [-1, 1]. EOF is `Ok(None)`; once a sample is consumed it is
//! never re-read.

use std::io::{self, Read};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("not a RIFF/WAVE stream")]
    BadHeader,
    #[error("unsupported PCM width: {0} bits")]
    BadBits(u16),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub trait SampleSource {
    /// Next mono sample, or `None` at end of stream.
    fn next_sample(&mut self) -> Result<Option<f32>, SourceError>;
}

impl SampleSource for Box<dyn SampleSource> {
    fn next_sample(&mut self) -> Result<Option<f32>, SourceError> {
        (**self).next_sample()
    }
}

// ── WAV reader ────────────────────────────────────────────────────────────────

pub struct WavSource<R: Read> {
    rdr: R,
    pub sample_rate: u32,
    pub bits: u16,
    pub channels: u16,
    /// Channel consumed for demodulation (0 = left/mono).
    channel: u16,
}

fn read_exact_opt<R: Read>(rdr: &mut R, buf: &mut [u8]) -> Result<Option<()>, SourceError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = rdr.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;
    }
    Ok(Some(()))
}

/// Scan forward byte-by-byte until the 4-byte tag appears.
fn seek_tag<R: Read>(rdr: &mut R, tag: &[u8; 4]) -> Result<(), SourceError> {
    let mut window = [0u8; 4];
    if read_exact_opt(rdr, &mut window)?.is_none() {
        return Err(SourceError::BadHeader);
    }
    loop {
        if &window == tag {
            return Ok(());
        }
        let mut byte = [0u8; 1];
        if read_exact_opt(rdr, &mut byte)?.is_none() {
            return Err(SourceError::BadHeader);
        }
        window.rotate_left(1);
        window[3] = byte[0];
    }
}

impl<R: Read> WavSource<R> {
    /// Parse the RIFF header and position the reader at the sample data.
    pub fn open(mut rdr: R, channel: u16) -> Result<Self, SourceError> {
        let mut four = [0u8; 4];
        read_exact_opt(&mut rdr, &mut four)?.ok_or(SourceError::BadHeader)?;
        if &four != b"RIFF" {
            return Err(SourceError::BadHeader);
        }
        read_exact_opt(&mut rdr, &mut four)?.ok_or(SourceError::BadHeader)?; // riff size
        read_exact_opt(&mut rdr, &mut four)?.ok_or(SourceError::BadHeader)?;
        if &four != b"WAVE" {
            return Err(SourceError::BadHeader);
        }

        seek_tag(&mut rdr, b"fmt ")?;
        let mut hdr = [0u8; 20];
        read_exact_opt(&mut rdr, &mut hdr)?.ok_or(SourceError::BadHeader)?;
        // [0..4] chunk size, [4..6] format tag
        let channels = u16::from_le_bytes([hdr[6], hdr[7]]);
        let sample_rate = u32::from_le_bytes([hdr[8], hdr[9], hdr[10], hdr[11]]);
        // [12..16] byte rate, [16..18] block align
        let bits = u16::from_le_bytes([hdr[18], hdr[19]]);

        seek_tag(&mut rdr, b"data")?;
        read_exact_opt(&mut rdr, &mut four)?.ok_or(SourceError::BadHeader)?; // data size

        if bits != 8 && bits != 16 {
            return Err(SourceError::BadBits(bits));
        }

        let channel = if channel < channels { channel } else { 0 };
        info!(sample_rate, bits, channels, channel = channel + 1, "wav input");

        Ok(WavSource {
            rdr,
            sample_rate,
            bits,
            channels,
            channel,
        })
    }
}

fn pcm_sample<R: Read>(
    rdr: &mut R,
    bits: u16,
    channels: u16,
    channel: u16,
) -> Result<Option<f32>, SourceError> {
    let mut out = 0.0f32;
    for ch in 0..channels {
        let v = if bits == 8 {
            let mut b = [0u8; 1];
            match read_exact_opt(rdr, &mut b)? {
                None => return Ok(None),
                Some(()) => (b[0] as i16 - 128) as f32 / 128.0,
            }
        } else {
            let mut b = [0u8; 2];
            match read_exact_opt(rdr, &mut b)? {
                None => return Ok(None),
                Some(()) => i16::from_le_bytes(b) as f32 / 32768.0,
            }
        };
        if ch == channel {
            out = v;
        }
    }
    Ok(Some(out))
}

impl<R: Read> SampleSource for WavSource<R> {
    fn next_sample(&mut self) -> Result<Option<f32>, SourceError> {
        pcm_sample(&mut self.rdr, self.bits, self.channels, self.channel)
    }
}

// ── Headerless PCM ────────────────────────────────────────────────────────────

/// Same payload as WAV without the container; rate/width come from the CLI.
pub struct RawPcmSource<R: Read> {
    rdr: R,
    pub sample_rate: u32,
    bits: u16,
    channels: u16,
    channel: u16,
}

impl<R: Read> RawPcmSource<R> {
    pub fn new(
        rdr: R,
        sample_rate: u32,
        bits: u16,
        channels: u16,
        channel: u16,
    ) -> Result<Self, SourceError> {
        if bits != 8 && bits != 16 {
            return Err(SourceError::BadBits(bits));
        }
        Ok(RawPcmSource {
            rdr,
            sample_rate,
            bits,
            channels,
            channel: if channel < channels { channel } else { 0 },
        })
    }
}

impl<R: Read> SampleSource for RawPcmSource<R> {
    fn next_sample(&mut self) -> Result<Option<f32>, SourceError> {
        pcm_sample(&mut self.rdr, self.bits, self.channels, self.channel)
    }
}

// ── Float32 IQ pairs ──────────────────────────────────────────────────────────

/// Interleaved little-endian float32 I/Q stream.
pub struct IqSource<R: Read> {
    rdr: R,
    pub sample_rate: u32,
}

impl<R: Read> IqSource<R> {
    pub fn new(rdr: R, sample_rate: u32) -> Self {
        IqSource { rdr, sample_rate }
    }

    pub fn next_pair(&mut self) -> Result<Option<(f32, f32)>, SourceError> {
        let mut b = [0u8; 8];
        match read_exact_opt(&mut self.rdr, &mut b)? {
            None => Ok(None),
            Some(()) => Ok(Some((
                f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                f32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(rate: u32, bits: u16, channels: u16, frames: &[i16]) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend(b"RIFF");
        v.extend(0u32.to_le_bytes());
        v.extend(b"WAVE");
        v.extend(b"fmt ");
        v.extend(16u32.to_le_bytes());
        v.extend(1u16.to_le_bytes());
        v.extend(channels.to_le_bytes());
        v.extend(rate.to_le_bytes());
        v.extend((rate * channels as u32 * bits as u32 / 8).to_le_bytes());
        v.extend((channels * bits / 8).to_le_bytes());
        v.extend(bits.to_le_bytes());
        v.extend(b"data");
        v.extend(0u32.to_le_bytes());
        for &s in frames {
            if bits == 8 {
                v.push(((s / 256) + 128) as u8);
            } else {
                v.extend(s.to_le_bytes());
            }
        }
        v
    }

    #[test]
    fn parses_mono_16bit() {
        let data = wav_bytes(48_000, 16, 1, &[0, 16_384, -16_384, 32_767]);
        let mut src = WavSource::open(&data[..], 0).unwrap();
        assert_eq!(src.sample_rate, 48_000);
        let a = src.next_sample().unwrap().unwrap();
        let b = src.next_sample().unwrap().unwrap();
        let c = src.next_sample().unwrap().unwrap();
        assert!(a.abs() < 1e-6);
        assert!((b - 0.5).abs() < 1e-6);
        assert!((c + 0.5).abs() < 1e-6);
        assert!(src.next_sample().unwrap().is_some());
        assert!(src.next_sample().unwrap().is_none());
    }

    #[test]
    fn stereo_channel_selection() {
        // interleaved L,R frames
        let data = wav_bytes(22_050, 16, 2, &[100, -100, 200, -200]);
        let mut left = WavSource::open(&data[..], 0).unwrap();
        let mut right = WavSource::open(&data[..], 1).unwrap();
        assert!(left.next_sample().unwrap().unwrap() > 0.0);
        assert!(right.next_sample().unwrap().unwrap() < 0.0);
    }

    #[test]
    fn eight_bit_centering() {
        let data = wav_bytes(8_000, 8, 1, &[0]);
        let mut src = WavSource::open(&data[..], 0).unwrap();
        assert!(src.next_sample().unwrap().unwrap().abs() < 1e-6);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            WavSource::open(&b"OggS nonsense here"[..], 0),
            Err(SourceError::BadHeader)
        ));
    }
}
