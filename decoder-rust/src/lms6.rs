//! lms6.rs — Lockheed Martin LMS6 (403 MHz) decoder.
//!
//! The uplink is rate-1/2 K=7 convolutional over the CCSDS block structure:
//! 5 sync bytes (ASM 1ACFFC1D) + RS(255,223) codeword, transmitted LSB-first
//! at ~4797.7 Bd with every second raw bit inverted on air. Decoding runs
//! Viterbi (hard or soft) over the raw bit block, algebraic deconvolution to
//! input bits, byte packing, data-frame sync search, byte-reversed CCSDS RS,
//! and a CRC-16 (init 0) over the 223-byte data frame.

use crate::dsp::{PulseShape, SymbolSync};
use crate::framing::Scanner;
use crate::output;
use crate::wav::{SampleSource, SourceError};
use crate::DecodeOpts;
use sonde_ecc::crc::crc16_zero;
use sonde_ecc::viterbi::deconv;
use sonde_ecc::{ReedSolomon, Viterbi};
use sonde_types::{Geodetic, GpsDateTime, GroundTrack, SondeKind, Telemetry};
use tracing::{debug, info};

pub const BAUD: f64 = 4797.7; // 4800 / (48023/48000)

/// Raw header: (c0, inv c1) encoding of the last four sync bytes.
pub const RAW_HEADER: &str = concat!(
    "0101011000001000",
    "0001110010010111",
    "0001101010100111",
    "0011110100111110"
);

/// Raw bit block prefix: the convolutional encoding of the five sync bytes
/// 00 58 F3 3F B8 (little-endian 1ACFFC1D).
const SYNC_RAWBITS: &str = concat!(
    "0000000000000000",
    "0000001101011101",
    "0100100111000010",
    "0100111111110010",
    "0110100001101011"
);

const SYNC_LEN: usize = 5;
const FRM_LEN: usize = 223;
const BLOCK_START: usize = SYNC_LEN * 8 * 2;
const RAWBIT_BLOCK_LEN: usize = 300 * 8 * 2;

const FRM_SYNC: [u8; 4] = [0x24, 0x46, 0x05, 0x00];

const OFS: usize = 4;
const POS_SONDE_SN: usize = OFS;
const POS_FRAME_NB: usize = OFS + 0x04;
const POS_GPS_TOW: usize = OFS + 0x06;
const POS_GPS_LAT: usize = OFS + 0x0E;
const POS_GPS_LON: usize = OFS + 0x12;
const POS_GPS_ALT: usize = OFS + 0x16;
const POS_GPS_VH: usize = OFS + 0x1A;
const POS_GPS_VD: usize = OFS + 0x1C;
const POS_GPS_VV: usize = OFS + 0x1E;
const POS_CRC: usize = 221;

fn u16be(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn i32be(b: &[u8]) -> i32 {
    i32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn u32be(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VitMode {
    Off,
    Hard,
    Soft,
}

pub struct Lms6 {
    viterbi: Viterbi,
    rs: Option<ReedSolomon>,
    vit: VitMode,
}

impl Lms6 {
    pub fn new(vit: VitMode, ecc: bool) -> Self {
        Lms6 {
            viterbi: Viterbi::new(),
            rs: ecc.then(ReedSolomon::ccsds),
            vit,
        }
    }

    /// Decode one raw bit block into the 223-byte data frame.
    /// Returns `(frame, rs_errors, crc_ok)` when a data-frame sync is found.
    pub fn proc_block(
        &self,
        blk_rawbits: &[u8],
        soft_rawbits: &[f32],
    ) -> Option<([u8; FRM_LEN], i32, bool)> {
        let mut len = blk_rawbits.len();
        let mut raw_owned;
        let mut rawbits = blk_rawbits;

        // pad a ragged tail up to a byte boundary
        if len % 8 > 4 {
            raw_owned = blk_rawbits.to_vec();
            while raw_owned.len() % 8 != 0 {
                raw_owned.push(0);
            }
            len = raw_owned.len();
            rawbits = &raw_owned[..];
        }
        let flen = len / 16;

        let corrected: Vec<u8> = match self.vit {
            VitMode::Hard => self.viterbi.decode_hard(rawbits),
            VitMode::Soft => self.viterbi.decode_soft(&soft_rawbits[..len.min(soft_rawbits.len())]).1,
            VitMode::Off => rawbits.to_vec(),
        };

        let mut bits = Vec::new();
        let err = deconv(&corrected, &mut bits);
        if err > 0 {
            debug!(err, "deconvolution inconsistency");
        }

        // LSB-first byte pack; the 8/9 error markers keep their data bit
        let mut block_bytes = vec![0u8; flen + 8];
        for (bytepos, chunk) in bits.chunks_exact(8).enumerate() {
            if bytepos >= block_bytes.len() {
                break;
            }
            let mut byte = 0u8;
            for (i, &b) in chunk.iter().enumerate() {
                byte |= (b & 1) << i;
            }
            block_bytes[bytepos] = byte;
        }

        // data-frame sync directly after the block sync, or shifted by the
        // 300-260 slack
        let mut blk_pos = SYNC_LEN;
        let sync_at = |p: usize| -> usize {
            (0..4)
                .filter(|&j| block_bytes.get(p + j) == Some(&FRM_SYNC[j]))
                .count()
        };
        if sync_at(blk_pos) < 4 {
            if sync_at(SYNC_LEN + 35) == 4 {
                blk_pos = SYNC_LEN + 35;
            } else if sync_at(SYNC_LEN + 40) == 4 {
                blk_pos = SYNC_LEN + 40;
            } else {
                return None;
            }
        }

        let blen = bits.len() / 8;
        let mut errs = 0i32;
        if blen > 100 {
            if let Some(rs) = &self.rs {
                if block_bytes.len() >= blk_pos + 255 {
                    let mut cw = [0u8; 255];
                    for j in 0..255 {
                        cw[254 - j] = block_bytes[blk_pos + j];
                    }
                    errs = match rs.decode(&mut cw) {
                        Ok(n) => n as i32,
                        Err(e) => e.code(),
                    };
                    for j in 0..255 {
                        block_bytes[blk_pos + j] = cw[254 - j];
                    }
                }
            }
        }

        let mut frame = [0u8; FRM_LEN];
        for (i, f) in frame.iter_mut().enumerate() {
            *f = block_bytes.get(blk_pos + i).copied().unwrap_or(0);
        }

        let crc_ok = u16be(&frame[POS_CRC..]) == crc16_zero(&frame[..POS_CRC]);
        Some((frame, errs, crc_ok))
    }

    fn parse(frame: &[u8; FRM_LEN], crc_ok: bool) -> Option<Telemetry> {
        if frame[0] == 0 || frame[POS_SONDE_SN + 1] == 0 {
            return None;
        }

        let sn = u32be(&frame[POS_SONDE_SN..]) & 0xFFFFFF;
        let frnr = u16be(&frame[POS_FRAME_NB..]) as u32;
        let tow_ms = u32be(&frame[POS_GPS_TOW..]) as u64;

        let lat = i32be(&frame[POS_GPS_LAT..]) as f64 / 1e7;
        let lon = i32be(&frame[POS_GPS_LON..]) as f64 / 1e7;
        let alt = i32be(&frame[POS_GPS_ALT..]) as f64 / 100.0;
        if !(-100.0..=60_000.0).contains(&alt) {
            return None;
        }

        // the 16-bit velocity words already carry speed / direction / climb
        let vh = i16::from_be_bytes([frame[POS_GPS_VH], frame[POS_GPS_VH + 1]]) as f64 / 1e2;
        let vd = i16::from_be_bytes([frame[POS_GPS_VD], frame[POS_GPS_VD + 1]]) as f64 / 1e2;
        let vv = i16::from_be_bytes([frame[POS_GPS_VV], frame[POS_GPS_VV + 1]]) as f64 / 1e2;

        let mut tel = Telemetry::new(SondeKind::Lms6);
        tel.frame = frnr;
        tel.id = format!("{sn}");
        // LMS6 sends no week number; time-of-week alone fixes the clock face
        tel.datetime = Some(GpsDateTime::from_gps(0, tow_ms));
        tel.pos = Some(Geodetic { lat, lon, alt });
        tel.track = Some(GroundTrack {
            vel_h: vh,
            heading: vd,
            vel_v: vv,
        });
        tel.crc = if crc_ok { 0 } else { 1 };
        Some(tel)
    }

    pub fn process_block(
        &self,
        blk_rawbits: &[u8],
        soft_rawbits: &[f32],
        opts: &DecodeOpts,
    ) {
        let Some((frame, errs, crc_ok)) = self.proc_block(blk_rawbits, soft_rawbits) else {
            debug!("no data-frame sync in block");
            return;
        };

        if opts.output.raw {
            output::print_raw_frame(&frame, Some(if crc_ok { errs.max(0) } else { -1 }), false);
            return;
        }

        if let Some(mut tel) = Self::parse(&frame, crc_ok) {
            tel.ecc = self.rs.as_ref().map(|_| errs);
            output::print_text(&tel, &opts.output);
            if opts.output.json && crc_ok {
                output::print_json(&tel);
            }
        }
    }
}

/// Decode loop: soft bits with the alternating on-air inversion undone by
/// the running bit counter; polarity from the correlation sign.
pub fn run<S: SampleSource>(src: S, spb: f32, opts: &DecodeOpts) -> Result<(), SourceError> {
    let (mut sync, k) = SymbolSync::fft(src, RAW_HEADER, spb, PulseShape::Gauss);
    let thres = opts.thres.unwrap_or(SondeKind::Lms6.corr_threshold());
    let mut scanner = Scanner::new(k, thres, 3, 1, true)
        .invert(opts.invert)
        .dc_tracking(opts.dc);

    let vit = match opts.vit {
        0 => VitMode::Off,
        1 => VitMode::Hard,
        _ => VitMode::Soft,
    };
    let decoder = Lms6::new(vit, opts.ecc > 0);
    let bitofs = 1 + opts.shift;

    let sync_prefix: Vec<u8> = SYNC_RAWBITS.bytes().map(|c| c & 1).collect();
    let soft_prefix: Vec<f32> = sync_prefix.iter().map(|&b| b as f32 * 2.0 - 1.0).collect();

    info!(spb, thres, ?vit, "lms6 decoder");

    'scan: while let Some(h) = scanner.next_header(&mut sync)? {
        let mut blk_rawbits = vec![0u8; RAWBIT_BLOCK_LEN];
        let mut soft_rawbits = vec![0.0f32; RAWBIT_BLOCK_LEN];
        blk_rawbits[..BLOCK_START].copy_from_slice(&sync_prefix);
        soft_rawbits[..BLOCK_START].copy_from_slice(&soft_prefix);

        let level = opts
            .level
            .unwrap_or_else(|| sync.header_level(h.pos, h.inverted) * 0.6);

        let mut bc: u32 = if h.inverted { 1 } else { 0 };
        let mut pos = BLOCK_START;
        let mut bitpos = 0u32;

        while pos < RAWBIT_BLOCK_LEN {
            let Some((rbit, sb)) =
                sync.read_soft_bit(1, level, opts.invert, bitofs, bitpos == 0)?
            else {
                debug!("eof inside block");
                break 'scan;
            };
            // undo the alternating inversion
            blk_rawbits[pos] = rbit ^ (bc % 2) as u8;
            soft_rawbits[pos] = sb * (1.0 - 2.0 * (bc % 2) as f32);
            bc += 1;
            pos += 1;
            bitpos += 1;
        }

        decoder.process_block(&blk_rawbits[..pos], &soft_rawbits[..pos], opts);
    }

    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
