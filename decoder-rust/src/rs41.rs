//! rs41.rs — Vaisala RS41 decoder.
//!
//! 4800 Bd GFSK, 64-bit header, LSB-first bytes, whole frame XOR-scrambled
//! with a 64-byte LFSR mask. Payload is a block chain
//! `(id, len, payload, crc16)`; ECC is two interleaved RS(255,231)
//! codewords over the odd/even message bytes. Frames come in a short (320)
//! and a long (320+198, xdata) flavor; the long/short decision is taken
//! from the frame-type byte and confirmed by watching the per-byte signal
//! variance collapse after the end of useful data.

use crate::dsp::{PulseShape, SymbolSync};
use crate::framing::Scanner;
use crate::output::{self, OutputOpts};
use crate::DecodeOpts;
use crate::wav::{SampleSource, SourceError};
use sonde_ecc::crc::crc16_ccitt;
use sonde_ecc::ReedSolomon;
use sonde_types::{
    ecef_to_geodetic, ecef_vel_to_track, Geodetic, GpsDateTime, SondeKind, Telemetry,
};
use tracing::{debug, info};

pub const BAUD: f64 = 4800.0;

/*                          10      B6      CA      11      22      96      12      F8  */
pub const HEADER: &str = "0000100001101101010100111000100001000100011010010100100000011111";

const FRAME_START: usize = 8;
const NDATA_LEN: usize = 320;
const XDATA_LEN: usize = 198;
const FRAME_LEN: usize = NDATA_LEN + XDATA_LEN;

/// Post-descramble header bytes the frame buffer is seeded with.
const HEADER_BYTES: [u8; 8] = [0x86, 0x35, 0xF4, 0x40, 0x93, 0xDF, 0x1A, 0x60];

const MASK: [u8; 64] = [
    0x96, 0x83, 0x3E, 0x51, 0xB1, 0x49, 0x08, 0x98, 0x32, 0x05, 0x59, 0x0E, 0xF9, 0x44, 0xC6,
    0x26, 0x21, 0x60, 0xC2, 0xEA, 0x79, 0x5D, 0x6D, 0xA1, 0x54, 0x69, 0x47, 0x0C, 0xDC, 0xE8,
    0x5C, 0xF1, 0xF7, 0x76, 0x82, 0x7F, 0x07, 0x99, 0xA2, 0x2C, 0x93, 0x7C, 0x30, 0x63, 0xF5,
    0x10, 0x2E, 0x61, 0xD0, 0xBC, 0xB4, 0xB6, 0x06, 0xAA, 0xF4, 0x23, 0x78, 0x6E, 0x3B, 0xAE,
    0xBF, 0x7B, 0x4C, 0xC1,
];

// block table: (sub-header id, position)
const PCK_FRAME: u16 = 0x7928;
const POS_FRAME: usize = 0x039;
const POS_FRAME_NB: usize = 0x03B;
const POS_SONDE_ID: usize = 0x03D;
const POS_CAL_DATA: usize = 0x052;
const POS_CAL_FREQ: usize = 0x055;
const POS_CAL_RSTYP: usize = 0x05B;

const PCK_PTU: u16 = 0x7A2A;
const POS_PTU: usize = 0x065;

const PCK_GPS1: u16 = 0x7C1E;
const POS_GPS1: usize = 0x093;
const POS_GPS_WEEK: usize = 0x095;
const POS_GPS_TOW: usize = 0x097;

const PCK_GPS2: u16 = 0x7D59;
const POS_GPS2: usize = 0x0B5;
const POS_MIN_PR: usize = 0x0B7;
const POS_DATA_SATS: usize = 0x0BC;
const POS_SATS_N: usize = 0x09B;

const PCK_GPS3: u16 = 0x7B15;
const POS_GPS3: usize = 0x112;
const POS_GPS_ECEF_X: usize = 0x114;
const POS_GPS_ECEF_V: usize = 0x120;
const POS_NUM_SATS: usize = 0x126;

const POS_AUX: usize = 0x12B;
const POS_ZERO_STD: usize = 0x12B;

// CRC bitmap bits
const CRC_FRAME: u32 = 1 << 0;
const CRC_PTU: u32 = 1 << 1;
const CRC_GPS1: u32 = 1 << 2;
const CRC_GPS2: u32 = 1 << 3;
const CRC_GPS3: u32 = 1 << 4;
const CRC_AUX: u32 = 1 << 5;
const CRC_ZERO: u32 = 1 << 6;

const CAL_ROWS: usize = 51;

fn u2(b: &[u8]) -> u32 {
    b[0] as u32 | (b[1] as u32) << 8
}

fn u3(b: &[u8]) -> u32 {
    b[0] as u32 | (b[1] as u32) << 8 | (b[2] as u32) << 16
}

fn u4(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn i3(b: &[u8]) -> i32 {
    let v = b[0] as i32 | (b[1] as i32) << 8 | (b[2] as i32) << 16;
    if v & 0x80_0000 != 0 {
        v - 0x100_0000
    } else {
        v
    }
}

fn i4(b: &[u8]) -> i32 {
    i32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn f4(b: &[u8]) -> f32 {
    f32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// One raw GPS2 measurement (receiver RXM-RAW style).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SatMeas {
    pub sv: u8,
    pub quality: u8,
    /// Meters, minimum-offset restored.
    pub pseudorange: f64,
    /// Meters/second along the line of sight.
    pub doppler: f64,
}

pub struct Rs41 {
    frame: [u8; FRAME_LEN],
    byte_q: [f32; FRAME_LEN],
    calibytes: [u8; CAL_ROWS * 16],
    calfrchk: [bool; CAL_ROWS],
    id: String,
    subtype: Option<String>,
    freq_khz: Option<u32>,
    crc: u32,
    rs: Option<ReedSolomon>,
    // decoded per frame
    frnr: u32,
    week: i32,
    tow_ms: u64,
    num_sv: u8,
    geo: Option<Geodetic>,
    vel: [f64; 3],
    temp: Option<f64>,
    xdata: Option<String>,
}

impl Rs41 {
    pub fn new(ecc: bool) -> Self {
        let mut frame = [0u8; FRAME_LEN];
        frame[..8].copy_from_slice(&HEADER_BYTES);
        Rs41 {
            frame,
            byte_q: [0.0; FRAME_LEN],
            calibytes: [0u8; CAL_ROWS * 16],
            calfrchk: [false; CAL_ROWS],
            id: String::new(),
            subtype: None,
            freq_khz: None,
            crc: 0,
            rs: ecc.then(ReedSolomon::vaisala),
            frnr: 0,
            week: 0,
            tow_ms: 0,
            num_sv: 0,
            geo: None,
            vel: [0.0; 3],
            temp: None,
            xdata: None,
        }
    }

    /// Frame-type nibble balance of the byte before the first block:
    /// 0x0F -> +4 (standard 320), 0xF0 -> -4 (long 518).
    fn frametype(&self) -> i32 {
        let b = self.frame[POS_FRAME - 1];
        let mut ft = 0i32;
        for i in 0..4 {
            ft += ((b >> i) & 1) as i32 - ((b >> (i + 4)) & 1) as i32;
        }
        ft
    }

    /// Verify one `(id, len, payload, crc16)` block at `pos`.
    /// 0 = ok, 1 = crc mismatch, -1 = structural failure.
    fn check_crc(&self, pos: usize, pck: u16) -> i32 {
        if ((pck >> 8) & 0xFF) as u8 != self.frame[pos] {
            return -1;
        }
        let crclen = self.frame[pos + 1] as usize;
        if pos + crclen + 4 > FRAME_LEN {
            return -1;
        }
        let crcdat = u2(&self.frame[pos + 2 + crclen..]) as u16;
        if crcdat != crc16_ccitt(&self.frame[pos + 2..pos + 2 + crclen]) {
            1
        } else {
            0
        }
    }

    // ── Block parsers ─────────────────────────────────────────────────────────

    fn get_frame_conf(&mut self) -> i32 {
        let crc = self.check_crc(POS_FRAME, PCK_FRAME);
        if crc != 0 {
            self.crc |= CRC_FRAME;
        }

        self.frnr = u2(&self.frame[POS_FRAME_NB..]);

        if crc == 0 {
            let id_bytes = &self.frame[POS_SONDE_ID..POS_SONDE_ID + 8];
            let id: String = id_bytes
                .iter()
                .map(|&b| {
                    if (0x20..=0x7E).contains(&b) {
                        b as char
                    } else {
                        ' '
                    }
                })
                .collect();
            if id != self.id {
                // new sonde: calibration restarts
                self.calfrchk = [false; CAL_ROWS];
                self.subtype = None;
                self.freq_khz = None;
                if !self.id.is_empty() {
                    info!(old = %self.id, new = %id, "sonde id changed, calibration reset");
                }
                self.id = id;
            }

            let calfr = self.frame[POS_CAL_DATA] as usize;
            if calfr < CAL_ROWS && !self.calfrchk[calfr] {
                for i in 0..16 {
                    self.calibytes[calfr * 16 + i] = self.frame[POS_CAL_DATA + 1 + i];
                }
                self.calfrchk[calfr] = true;
                self.cal_conf(calfr as u8);
            }
        }

        crc
    }

    /// Configuration nuggets carried in individual calibration rows.
    fn cal_conf(&mut self, calfr: u8) {
        match calfr {
            0x00 => {
                let b0 = (self.frame[POS_CAL_FREQ] & 0xC0) as u32;
                let f0 = (b0 * 10) / 64;
                let f1 = 40 * self.frame[POS_CAL_FREQ + 1] as u32;
                self.freq_khz = Some(400_000 + f1 + f0);
            }
            0x21 => {
                let raw = &self.frame[POS_CAL_RSTYP..POS_CAL_RSTYP + 8];
                let s: String = raw
                    .iter()
                    .take_while(|&&b| b != 0)
                    .filter(|&&b| (0x20..0x7F).contains(&b))
                    .map(|&b| b as char)
                    .collect();
                if !s.is_empty() {
                    self.subtype = Some(s);
                }
            }
            _ => {}
        }
    }

    /// Pt1000 temperature from the reference-resistor calibration.
    fn temperature(&self, f: u32, f1: u32, f2: u32) -> Option<f64> {
        let need = [0x03usize, 0x04, 0x05, 0x06];
        if !need.iter().all(|&r| self.calfrchk[r]) {
            return None;
        }
        let rf1 = f4(&self.calibytes[61..]) as f64; // 750 ohm reference
        let rf2 = f4(&self.calibytes[65..]) as f64; // 1100 ohm reference
        let co1 = [
            f4(&self.calibytes[77..]) as f64,
            f4(&self.calibytes[81..]) as f64,
            f4(&self.calibytes[85..]) as f64,
        ];
        let cal_t1 = [
            f4(&self.calibytes[89..]) as f64,
            f4(&self.calibytes[93..]) as f64,
            f4(&self.calibytes[97..]) as f64,
        ];

        if f2 == f1 || rf2 == rf1 {
            return None;
        }
        let g = (f2 as f64 - f1 as f64) / (rf2 - rf1);
        let rb = (f1 as f64 * rf2 - f2 as f64 * rf1) / (f2 as f64 - f1 as f64);
        let rc = f as f64 / g - rb;
        let r = rc * cal_t1[0];
        let t = (co1[0] + co1[1] * r + co1[2] * r * r + cal_t1[1]) * (1.0 + cal_t1[2]);
        Some(t)
    }

    fn get_ptu(&mut self) -> i32 {
        let err = self.check_crc(POS_PTU, PCK_PTU);
        if err != 0 {
            self.crc |= CRC_PTU;
            return err;
        }

        let mut meas = [0u32; 12];
        for (i, m) in meas.iter_mut().enumerate() {
            *m = u3(&self.frame[POS_PTU + 2 + 3 * i..]);
        }
        self.temp = self
            .temperature(meas[0], meas[1], meas[2])
            .filter(|&t| t > -273.0);
        err
    }

    fn get_gps1(&mut self) -> i32 {
        let err = self.check_crc(POS_GPS1, PCK_GPS1);
        if err != 0 {
            self.crc |= CRC_GPS1;
            return err;
        }
        self.week = u2(&self.frame[POS_GPS_WEEK..]) as i32;
        self.tow_ms = u4(&self.frame[POS_GPS_TOW..]) as u64;
        0
    }

    fn get_gps2(&mut self) -> i32 {
        let err = self.check_crc(POS_GPS2, PCK_GPS2);
        if err != 0 {
            self.crc |= CRC_GPS2;
        }
        err
    }

    /// Raw receiver measurements from the GPS2 block: the transmitted
    /// pseudoranges are centimeter offsets against the separately sent
    /// minimum pseudorange; doppler scales by L1/c.
    pub fn sat_data(&self) -> Vec<SatMeas> {
        const C: f64 = 299.792_458e6;
        const L1: f64 = 1575.42e6;

        let min_pr = u4(&self.frame[POS_MIN_PR..]);
        let mut out = Vec::new();
        for i in 0..12 {
            let sv = self.frame[POS_SATS_N + 2 * i];
            if sv == 0xFF {
                break;
            }
            let n = i * 7;
            let pr_cm = u4(&self.frame[POS_DATA_SATS + n..]);
            let dop = i3(&self.frame[POS_DATA_SATS + n + 4..]);
            out.push(SatMeas {
                sv,
                quality: self.frame[POS_SATS_N + 2 * i + 1],
                pseudorange: pr_cm as f64 / 100.0 + min_pr as f64,
                doppler: -(dop as f64) / 100.0 * L1 / C,
            });
        }
        out
    }

    fn get_gps3(&mut self) -> i32 {
        let err = self.check_crc(POS_GPS3, PCK_GPS3);
        if err != 0 {
            self.crc |= CRC_GPS3;
            return err;
        }

        let mut pos = [0.0f64; 3];
        let mut vel = [0.0f64; 3];
        for k in 0..3 {
            pos[k] = i4(&self.frame[POS_GPS_ECEF_X + 4 * k..]) as f64 / 100.0;
            let v16 = i16::from_le_bytes([
                self.frame[POS_GPS_ECEF_V + 2 * k],
                self.frame[POS_GPS_ECEF_V + 2 * k + 1],
            ]);
            vel[k] = v16 as f64 / 100.0;
        }

        let geo = ecef_to_geodetic(sonde_types::Ecef::new(pos[0], pos[1], pos[2]));
        if geo.alt < -1000.0 || geo.alt > 80_000.0 {
            // ecef = (0,0,0) decodes to a deep negative altitude
            self.geo = None;
            return -3;
        }
        self.geo = Some(geo);
        self.vel = vel;
        self.num_sv = self.frame[POS_NUM_SATS];
        0
    }

    fn get_aux(&mut self) -> i32 {
        if self.frametype() > 0 {
            return 0;
        }
        let mut parts: Vec<String> = Vec::new();
        let mut pos = POS_AUX;
        // 7Exx xdata sub-blocks
        while pos < FRAME_LEN && self.frame[pos] == 0x7E {
            let auxlen = self.frame[pos + 1] as usize;
            if pos + 2 + auxlen + 2 > FRAME_LEN {
                self.crc |= CRC_AUX;
                break;
            }
            let auxcrc = u2(&self.frame[pos + 2 + auxlen..]) as u16;
            if auxcrc == crc16_ccitt(&self.frame[pos + 2..pos + 2 + auxlen]) {
                let ascii: String = self.frame[pos + 2 + 1..pos + 2 + auxlen]
                    .iter()
                    .filter(|&&c| c > 0x1E)
                    .map(|&c| c as char)
                    .collect();
                parts.push(ascii);
                pos += 2 + auxlen + 2;
            } else {
                self.crc |= CRC_AUX;
                pos = FRAME_LEN;
            }
        }
        if !parts.is_empty() {
            self.xdata = Some(parts.join(" # "));
        }

        if pos < FRAME_LEN && self.check_crc(pos, 0x7600) != 0 {
            self.crc |= CRC_ZERO;
        }
        0
    }

    // ── ECC ───────────────────────────────────────────────────────────────────

    /// Two interleaved RS(255,231) codewords over the odd/even message
    /// bytes. Pass 2 (`ecc == 2`) rewrites the known block headers and
    /// padding constants and retries, turning burst-corrupted constants
    /// back into correctable positions.
    fn rs41_ecc(&mut self, frmlen: usize, two_pass: bool) -> i32 {
        let Some(rs) = self.rs.as_ref() else {
            return 0;
        };
        let msgpos = 56usize;
        let parpos = 8usize;
        let rs_r = rs.r;
        let rs_k = rs.k;

        let frmlen = frmlen.min(FRAME_LEN);
        for i in frmlen..FRAME_LEN {
            self.frame[i] = 0;
        }

        let mut cw1 = [0u8; 255];
        let mut cw2 = [0u8; 255];
        let fill = |frame: &[u8; FRAME_LEN], cw1: &mut [u8; 255], cw2: &mut [u8; 255]| {
            for i in 0..rs_r {
                cw1[i] = frame[parpos + i];
                cw2[i] = frame[parpos + i + rs_r];
            }
            for i in 0..rs_k {
                cw1[rs_r + i] = frame[msgpos + 2 * i];
                cw2[rs_r + i] = frame[msgpos + 2 * i + 1];
            }
        };

        fill(&self.frame, &mut cw1, &mut cw2);
        let mut errors1 = rs.decode(&mut cw1);
        let mut errors2 = rs.decode(&mut cw2);

        if two_pass && (errors1.is_err() || errors2.is_err()) {
            // reimpose the block-header constants
            for (pos, pck) in [
                (POS_FRAME, PCK_FRAME),
                (POS_PTU, PCK_PTU),
                (POS_GPS1, PCK_GPS1),
                (POS_GPS2, PCK_GPS2),
                (POS_GPS3, PCK_GPS3),
            ] {
                self.frame[pos] = (pck >> 8) as u8;
                self.frame[pos + 1] = (pck & 0xFF) as u8;
            }
            if self.frametype() < -2 {
                // long frame: zero everything after the standard ozone tail
                for i in NDATA_LEN + 7..FRAME_LEN - 2 {
                    self.frame[i] = 0;
                }
            } else {
                // standard frame: a 7611 zero block with its constant crc
                for i in NDATA_LEN..FRAME_LEN {
                    self.frame[i] = 0;
                }
                self.frame[POS_ZERO_STD] = 0x76;
                self.frame[POS_ZERO_STD + 1] = 0x11;
                for i in POS_ZERO_STD + 2..NDATA_LEN - 2 {
                    self.frame[i] = 0;
                }
                self.frame[NDATA_LEN - 2] = 0xEC;
                self.frame[NDATA_LEN - 1] = 0xC7;
            }
            fill(&self.frame, &mut cw1, &mut cw2);
            errors1 = rs.decode(&mut cw1);
            errors2 = rs.decode(&mut cw2);
        }

        for i in 0..rs_r {
            self.frame[parpos + i] = cw1[i];
            self.frame[parpos + rs_r + i] = cw2[i];
        }
        for i in 0..rs_k {
            self.frame[msgpos + 2 * i] = cw1[rs_r + i];
            if msgpos + 2 * i + 1 < FRAME_LEN {
                self.frame[msgpos + 2 * i + 1] = cw2[rs_r + i];
            }
        }

        match (errors1, errors2) {
            (Ok(e1), Ok(e2)) => (e1 + e2) as i32,
            (e1, e2) => {
                let mut ret = 0;
                if e1.is_err() {
                    ret |= 0x1;
                }
                if e2.is_err() {
                    ret |= 0x2;
                }
                -ret
            }
        }
    }

    // ── Frame processing ──────────────────────────────────────────────────────

    fn emit(&mut self, ec: Option<i32>, opts: &OutputOpts) {
        let err_frame = self.crc & CRC_FRAME != 0;
        let err_gps1 = self.crc & CRC_GPS1 != 0;
        let err_gps3 = self.crc & CRC_GPS3 != 0;
        if err_frame && err_gps1 && err_gps3 {
            return; // nothing verified
        }

        let mut tel = Telemetry::new(SondeKind::Rs41);
        tel.frame = self.frnr;
        tel.crc = self.crc;
        tel.ecc = ec;
        if !err_frame {
            tel.id = self.id.clone();
            tel.subtype = self.subtype.clone();
            tel.freq = self.freq_khz;
        }
        if !err_gps1 {
            tel.week = self.week;
            tel.datetime = Some(GpsDateTime::from_gps(self.week, self.tow_ms));
        }
        if !err_gps3 {
            tel.pos = self.geo;
            if let Some(geo) = &self.geo {
                tel.track = Some(ecef_vel_to_track(geo.lat, geo.lon, self.vel));
            }
            tel.sats = Some(self.num_sv as u32);
        }
        if self.crc & CRC_PTU == 0 {
            tel.temp = self.temp;
        }
        tel.xdata = self.xdata.take();

        output::print_text(&tel, opts);
        if opts.json && !err_frame && !err_gps1 && !err_gps3 && self.geo.is_some() {
            output::print_json(&tel);
        }
    }

    pub fn process_frame(&mut self, len: usize, opts: &DecodeOpts) {
        self.crc = 0;
        self.geo = None;
        self.temp = None;
        self.xdata = None;

        let mut len = len;
        let ft = self.frametype();
        if ft > 2 {
            len = NDATA_LEN;
        }
        if len > NDATA_LEN && len < NDATA_LEN + XDATA_LEN - 10 && ft < -2 {
            len = NDATA_LEN + 7; // standard ozone-aux frame
        }
        for i in len..FRAME_LEN - 2 {
            self.frame[i] = 0;
        }
        if ft > 2 || len == NDATA_LEN {
            self.frame[FRAME_LEN - 2] = 0;
            self.frame[FRAME_LEN - 1] = 0;
        }
        let len = if len > NDATA_LEN { FRAME_LEN } else { NDATA_LEN };

        let ec = if self.rs.is_some() {
            Some(self.rs41_ecc(len, opts.ecc == 2))
        } else {
            None
        };

        if opts.output.raw {
            output::print_raw_frame(&self.frame[..len], ec, opts.ecc == 2);
            return;
        }

        let _ = self.get_frame_conf();
        let _ = self.get_gps1();
        let gps2 = self.get_gps2();
        let _ = self.get_gps3();
        let _ = self.get_ptu();
        let _ = self.get_aux();

        if opts.output.verbosity >= 3 && gps2 == 0 {
            for m in self.sat_data() {
                info!(
                    sv = m.sv,
                    pr = format!("{:.1}", m.pseudorange),
                    doppler = format!("{:.1}", m.doppler),
                    "raw sat"
                );
            }
        }

        self.emit(ec, &opts.output);
    }
}

/// Decode loop: scan for headers, slice bits into descrambled bytes, watch
/// the byte variance for the short-frame cutoff, process each frame.
pub fn run<S: SampleSource>(src: S, spb: f32, opts: &DecodeOpts) -> Result<(), SourceError> {
    let (mut sync, k) = SymbolSync::fft(src, HEADER, spb, PulseShape::Gauss);
    let thres = opts.thres.unwrap_or(SondeKind::Rs41.corr_threshold());
    let mut scanner = Scanner::new(k, thres, 2, 1, false).invert(opts.invert);

    let mut decoder = Rs41::new(opts.ecc > 0);
    let frmlen = opts.frame_len.unwrap_or(FRAME_LEN);
    let bitofs = 2 + opts.shift;

    info!(spb, thres, "rs41 decoder");

    while scanner.next_header(&mut sync)?.is_some() {
        let mut byte_count = FRAME_START;
        let mut bit_count = 0u32;
        let mut bitbuf = [0u8; 8];
        let mut bitpos = 0usize;
        let mut q_errors = 0u32;
        let mut ft_len = frmlen;
        let mut eof = false;

        while byte_count < frmlen {
            let Some(bit) = sync.read_bit(1, opts.invert, bitofs, bit_count == 0, false)? else {
                eof = true;
                break;
            };
            bit_count += 1;
            bitbuf[bitpos] = bit;
            bitpos += 1;
            if bitpos == 8 {
                bitpos = 0;
                let mut byte = 0u8;
                for (i, &b) in bitbuf.iter().enumerate() {
                    byte |= b << i; // LSB first
                }
                decoder.frame[byte_count] = byte ^ MASK[byte_count % MASK.len()];
                decoder.byte_q[byte_count] = sync.buf_var(0);

                // variance collapse after the end of useful data marks a
                // short frame; require four consecutive collapsed bytes
                if byte_count > NDATA_LEN
                    && decoder.byte_q[byte_count] * 2.0 > decoder.byte_q[byte_count - 300] * 3.0
                {
                    q_errors += 1;
                }
                byte_count += 1;
            }
            if q_errors == 4 {
                ft_len = byte_count;
                q_errors += 1;
            }
        }

        if eof && byte_count < POS_ZERO_STD {
            debug!(byte_count, "eof inside frame, dropped");
            break;
        }

        decoder.process_frame(ft_len.min(byte_count.max(NDATA_LEN)), opts);

        if eof {
            break;
        }

        // skim the tail so the next search starts beyond this frame
        while bit_count < 8 * (FRAME_LEN as u32 - 8 + 24) {
            match sync.read_bit(1, opts.invert, bitofs, false, false)? {
                Some(_) => bit_count += 1,
                None => return Ok(()),
            }
        }
    }

    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn put_block(frame: &mut [u8], pos: usize, pck: u16, payload: &[u8]) {
        frame[pos] = (pck >> 8) as u8;
        frame[pos + 1] = payload.len() as u8;
        frame[pos + 2..pos + 2 + payload.len()].copy_from_slice(payload);
        let crc = crc16_ccitt(payload);
        frame[pos + 2 + payload.len()] = (crc & 0xFF) as u8;
        frame[pos + 2 + payload.len() + 1] = (crc >> 8) as u8;
    }

    /// Build a standard frame with conf + gps1 + gps3 blocks around a known
    /// position (Graz, ~47N 15.4E).
    fn synth_frame(decoder: &mut Rs41) {
        decoder.frame[POS_FRAME - 1] = 0x0F; // standard length

        let mut conf = vec![0u8; 0x28];
        conf[0] = 0x51; // frame number 4177
        conf[1] = 0x10;
        conf[2..10].copy_from_slice(b"N3920808");
        conf[0x17] = 0x07; // calibration row index (relative offset 0x052-0x03B=0x17)
        put_block(&mut decoder.frame, POS_FRAME, PCK_FRAME, &conf);

        let mut gps1 = vec![0u8; 0x1E];
        gps1[0..2].copy_from_slice(&2000u16.to_le_bytes());
        gps1[2..6].copy_from_slice(&259_205_123u32.to_le_bytes());
        put_block(&mut decoder.frame, POS_GPS1, PCK_GPS1, &gps1);

        let ecef = sonde_types::geodetic_to_ecef(sonde_types::Geodetic {
            lat: 47.0,
            lon: 15.4,
            alt: 12_345.0,
        });
        let mut gps3 = vec![0u8; 0x15];
        gps3[0..4].copy_from_slice(&(((ecef.x * 100.0) as i32).to_le_bytes()));
        gps3[4..8].copy_from_slice(&(((ecef.y * 100.0) as i32).to_le_bytes()));
        gps3[8..12].copy_from_slice(&(((ecef.z * 100.0) as i32).to_le_bytes()));
        // ENU-ish ECEF velocity: 3 m/s up the Z axis for a visible vV
        gps3[12..14].copy_from_slice(&300i16.to_le_bytes());
        gps3[18] = 9; // numSV
        put_block(&mut decoder.frame, POS_GPS3, PCK_GPS3, &gps3);
    }

    #[test]
    fn mask_restores_the_raw_header() {
        let xheader = [0x10u8, 0xB6, 0xCA, 0x11, 0x22, 0x96, 0x12, 0xF8];
        for i in 0..8 {
            assert_eq!(HEADER_BYTES[i] ^ MASK[i], xheader[i]);
        }
    }

    #[test]
    fn frametype_balance() {
        let mut d = Rs41::new(false);
        d.frame[POS_FRAME - 1] = 0x0F;
        assert_eq!(d.frametype(), 4);
        d.frame[POS_FRAME - 1] = 0xF0;
        assert_eq!(d.frametype(), -4);
        d.frame[POS_FRAME - 1] = 0x33;
        assert_eq!(d.frametype(), 0);
    }

    #[test]
    fn block_crc_round_trip() {
        let mut d = Rs41::new(false);
        synth_frame(&mut d);
        assert_eq!(d.check_crc(POS_FRAME, PCK_FRAME), 0);
        assert_eq!(d.check_crc(POS_GPS1, PCK_GPS1), 0);
        assert_eq!(d.check_crc(POS_GPS3, PCK_GPS3), 0);
        // a flipped payload byte fails exactly that block
        d.frame[POS_GPS1 + 3] ^= 0x40;
        assert_eq!(d.check_crc(POS_GPS1, PCK_GPS1), 1);
        assert_eq!(d.check_crc(POS_GPS3, PCK_GPS3), 0);
        // wrong sub-header id is a structural failure
        assert_eq!(d.check_crc(POS_GPS1, PCK_GPS2), -1);
    }

    #[test]
    fn parses_position_time_and_id() {
        let mut d = Rs41::new(false);
        synth_frame(&mut d);

        assert_eq!(d.get_frame_conf(), 0);
        assert_eq!(d.get_gps1(), 0);
        assert_eq!(d.get_gps3(), 0);

        assert_eq!(d.frnr, 4177);
        assert_eq!(d.id, "N3920808");
        assert_eq!(d.week, 2000);
        let dt = GpsDateTime::from_gps(d.week, d.tow_ms);
        assert_eq!((dt.year, dt.month, dt.day), (2018, 5, 2));

        let geo = d.geo.unwrap();
        assert!((geo.lat - 47.0).abs() < 1e-4, "lat {}", geo.lat);
        assert!((geo.lon - 15.4).abs() < 1e-4);
        assert!((geo.alt - 12_345.0).abs() < 1.0);
        assert_eq!(d.num_sv, 9);
    }

    #[test]
    fn zero_ecef_is_dropped_as_implausible() {
        let mut d = Rs41::new(false);
        synth_frame(&mut d);
        let zeros = vec![0u8; 0x15];
        put_block(&mut d.frame, POS_GPS3, PCK_GPS3, &zeros);
        assert_eq!(d.get_gps3(), -3);
        assert!(d.geo.is_none());
    }

    #[test]
    fn min_pseudorange_offset_is_restored_exactly() {
        let mut d = Rs41::new(false);
        let min_pr: u32 = 19_000_000;
        d.frame[POS_MIN_PR..POS_MIN_PR + 4].copy_from_slice(&min_pr.to_le_bytes());
        // SV 7 with a centimeter offset divisible by 100, SV 12 after it
        let offsets_cm = [123_456_700u32, 3_400u32];
        for (i, (sv, cm)) in [(7u8, offsets_cm[0]), (12u8, offsets_cm[1])]
            .iter()
            .enumerate()
        {
            d.frame[POS_SATS_N + 2 * i] = *sv;
            let n = POS_DATA_SATS + i * 7;
            d.frame[n..n + 4].copy_from_slice(&cm.to_le_bytes());
        }
        d.frame[POS_SATS_N + 4] = 0xFF; // terminator

        let meas = d.sat_data();
        assert_eq!(meas.len(), 2);
        assert_eq!(meas[0].sv, 7);
        // integer-exact: cm/100 + minPR with no residue
        assert_eq!(meas[0].pseudorange, 1_234_567.0 + 19_000_000.0);
        assert_eq!(meas[1].pseudorange, 34.0 + 19_000_000.0);
    }

    #[test]
    fn ecc_corrects_scattered_byte_errors() {
        let mut d = Rs41::new(true);
        synth_frame(&mut d);

        // produce valid parity for the synthesized frame
        let rs = ReedSolomon::vaisala();
        let (mut cw1, mut cw2) = ([0u8; 255], [0u8; 255]);
        for i in 0..rs.k {
            cw1[rs.r + i] = d.frame[56 + 2 * i];
            cw2[rs.r + i] = d.frame[56 + 2 * i + 1];
        }
        rs.encode(&mut cw1);
        rs.encode(&mut cw2);
        for i in 0..rs.r {
            d.frame[8 + i] = cw1[i];
            d.frame[8 + rs.r + i] = cw2[i];
        }

        let clean = d.frame;
        d.frame[100] ^= 0xA5;
        d.frame[101] ^= 0x11;
        d.frame[230] ^= 0x01;
        let ec = d.rs41_ecc(FRAME_LEN, false);
        assert_eq!(ec, 3);
        assert_eq!(&d.frame[8..], &clean[8..]);
    }

    #[test]
    fn second_pass_repairs_smashed_constants() {
        let mut d = Rs41::new(true);
        synth_frame(&mut d);
        d.frame[POS_FRAME - 1] = 0x0F;

        // rebuild the 7611 zero block the transmitter sends in standard
        // frames (crc over its 17 zero bytes is the constant C7EC)
        d.frame[POS_ZERO_STD] = 0x76;
        d.frame[POS_ZERO_STD + 1] = 0x11;
        d.frame[NDATA_LEN - 2] = 0xEC;
        d.frame[NDATA_LEN - 1] = 0xC7;

        let rs = ReedSolomon::vaisala();
        let (mut cw1, mut cw2) = ([0u8; 255], [0u8; 255]);
        for i in 0..rs.k {
            cw1[rs.r + i] = d.frame[56 + 2 * i];
            cw2[rs.r + i] = d.frame[56 + 2 * i + 1];
        }
        rs.encode(&mut cw1);
        rs.encode(&mut cw2);
        for i in 0..rs.r {
            d.frame[8 + i] = cw1[i];
            d.frame[8 + rs.r + i] = cw2[i];
        }
        let clean = d.frame;

        // a corruption run across the block-id constants and the zero-block
        // tail: ~15 errors per interleaved codeword, beyond t=12 for pass 1
        for pos in [POS_FRAME, POS_PTU, POS_GPS1, POS_GPS2, POS_GPS3] {
            d.frame[pos] ^= 0x3C;
            d.frame[pos + 1] ^= 0x3C;
        }
        for i in POS_ZERO_STD..NDATA_LEN {
            d.frame[i] ^= 0x5A;
        }

        let mut d1 = Rs41::new(true);
        d1.frame = d.frame;
        assert!(d1.rs41_ecc(NDATA_LEN, false) < 0);

        // pass 2 reimposes the constants, converting them into known values
        let ec = d.rs41_ecc(NDATA_LEN, true);
        assert!(ec >= 0, "second pass failed: {ec}");
        assert_eq!(&d.frame[..NDATA_LEN], &clean[..NDATA_LEN]);
    }
}
