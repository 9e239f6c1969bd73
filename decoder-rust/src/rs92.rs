//! rs92.rs — Vaisala RS92-SGP/NGP decoder with raw-pseudorange GPS solve.
//!
//! 4800 Bd Manchester, 10-bit 8N1 bytes, 240-byte frames of four
//! `(id, len)`-tagged blocks (CFG / PTU / GPS / AUX) each trailed by a
//! CRC-16. The GPS block carries 12 raw satellite measurements (5-bit PRNs
//! with a PRN-32 overflow encoding, status bytes, integer chip counts and
//! delta chips); position comes from the Bancroft + least-squares solver
//! fed by a SEM almanac or RINEX ephemerides. ECC is one RS(255,231)
//! codeword over the 210-byte message span.
//!
//! RS92-NGP (L-band) scrambles the PTU block and part of the calibration
//! table with a keystream derived from calibration bytes; the variant is
//! recognized by comparing calibration row 0x17 against the constant
//! SGP pattern.

use crate::almanac::select_ephemeris;
use crate::dsp::{PulseShape, SymbolSync};
use crate::ephemeris::{Ephemeris, Sat};
use crate::framing::Scanner;
use crate::output;
use crate::solver::{self, SolverOpts};
use crate::wav::{SampleSource, SourceError};
use crate::{DecodeOpts, VelocityMode};
use sonde_ecc::crc::crc16_ccitt;
use sonde_ecc::ReedSolomon;
use sonde_types::{ecef_vel_to_track, GpsDateTime, SondeKind, Telemetry};
use tracing::{debug, info, warn};

pub const BAUD: f64 = 4800.0;

/// Raw Manchester header covering the last three header bytes (2A 2A 10).
pub const RAW_HEADER: &str = concat!(
    "10100110011001101001",
    "1010011001100110100110101010100110101001"
);

const FRAME_START: usize = 6;
const FRAME_LEN: usize = 240;

const HEADER_BYTES: [u8; 6] = [0x2A, 0x2A, 0x2A, 0x2A, 0x2A, 0x10];

const POS_FRAME_NB: usize = 0x08;
const POS_SONDE_ID: usize = 0x0C;
const POS_CAL_DATA: usize = 0x17;
const POS_CAL_FREQ: usize = 0x1A;
const POS_PTU: usize = 0x2C;
const POS_GPS_TOW: usize = 0x48;
const POS_GPS_PRN: usize = 0x4E;
const POS_GPS_STATUS: usize = 0x56;
const POS_GPS_DATA: usize = 0x62;
const POS_AUX: usize = 0xC6;
const POS_AUX_DATA: usize = 0xC8;

// block lengths are twice the length nibble of the block id word
const LEN_CFG: usize = 2 * 0x10;
const LEN_PTU: usize = 2 * 0x0C;
const LEN_GPS: usize = 2 * 0x3D;
const LEN_AUX: usize = 2 * 0x05;

const CRC_FRAME: u32 = 1 << 0;
const CRC_PTU: u32 = 1 << 1;
const CRC_GPS: u32 = 1 << 2;
const CRC_AUX: u32 = 1 << 3;

/// pseudorange meters per chip unit: c / (1023000 chips/s · 2^10)
const DF: f64 = 299_792.458 / 1023.0 / 1024.0;
/// delta-chip scale: (L1 / chip rate) / 4
const DL: f64 = 1575.42 / 1.023 / 4.0;

/// Calibration row 0x17 of an (unscrambled) RS92-SGP.
const SGP_CAL_X170: [u8; 16] = [
    0x36, 0x98, 0x92, 0x25, 0x6B, 0xB3, 0x99, 0xE1, 0x57, 0x05, 0x30, 0x9A, 0xFE, 0x51, 0xF4,
    0xAB,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rs92Type {
    Sgp,
    Ngp,
}

fn u2(b: &[u8]) -> u32 {
    b[0] as u32 | (b[1] as u32) << 8
}

fn u4(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Per-epoch GPS measurement for one SV slot.
#[derive(Debug, Clone, Copy, Default)]
struct RawRange {
    status: u8,
    chips: u32,
    deltachips: i32,
}

pub struct EphemerisSource {
    /// Almanac (coarse) or navigation (precise) records.
    pub ephs: Vec<Ephemeris>,
    pub is_almanac: bool,
    /// SEM week epoch (1: 1999-2019, 2: 2019-2038).
    pub week1024_epoch: i32,
}

pub struct Rs92 {
    frame: [u8; FRAME_LEN],
    id: String,
    calibytes: [u8; 32 * 16],
    calfrchk: [bool; 32],
    cal_f32: [f32; 256],
    calfrms: u8,
    cal_state: [u8; 2],
    xcal16: [u8; 16],
    xptu16: [u8; 16],
    rs_type: Rs92Type,
    ngp: bool,
    freq_khz: Option<u32>,
    crc: u32,
    rs: Option<ReedSolomon>,
    // GPS state surviving across frames
    eph_source: Option<EphemerisSource>,
    prn32toggle: u8,
    prn32next: u8,
    exsat: Option<u8>,
    sats: [Sat; 33],
    sats_1s: [Sat; 33],
    // per-frame decode
    frnr: u32,
    week: i32,
    tow_ms: u64,
    temp: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<f64>,
    aux: [u16; 4],
}

impl Rs92 {
    pub fn new(ecc: bool, ngp: bool, eph_source: Option<EphemerisSource>) -> Self {
        let mut frame = [0u8; FRAME_LEN];
        frame[..6].copy_from_slice(&HEADER_BYTES);
        Rs92 {
            frame,
            id: String::new(),
            calibytes: [0u8; 32 * 16],
            calfrchk: [false; 32],
            cal_f32: [0.0; 256],
            calfrms: 0,
            cal_state: [0, 0],
            xcal16: [0u8; 16],
            xptu16: [0u8; 16],
            rs_type: if ngp { Rs92Type::Ngp } else { Rs92Type::Sgp },
            ngp,
            freq_khz: None,
            crc: 0,
            rs: ecc.then(ReedSolomon::vaisala),
            eph_source,
            prn32toggle: 0x1,
            prn32next: 0,
            exsat: None,
            sats: [Sat::default(); 33],
            sats_1s: [Sat::default(); 33],
            frnr: 0,
            week: 0,
            tow_ms: 0,
            temp: None,
            humidity: None,
            pressure: None,
            aux: [0; 4],
        }
    }

    fn block_crc_ok(&self, pos: usize, len: usize) -> bool {
        if pos + len + 2 > FRAME_LEN {
            return false;
        }
        let crc_frame = u2(&self.frame[pos + len..]) as u16;
        crc_frame == crc16_ccitt(&self.frame[pos..pos + len])
    }

    // ── Configuration block ───────────────────────────────────────────────────

    fn get_frame_conf(&mut self) -> i32 {
        if !self.block_crc_ok(POS_FRAME_NB, LEN_CFG) {
            self.crc |= CRC_FRAME;
            return 1;
        }

        self.frnr = u2(&self.frame[POS_FRAME_NB..]);

        let id_bytes = &self.frame[POS_SONDE_ID..POS_SONDE_ID + 8];
        if id_bytes.iter().any(|&b| !(0x20..=0x7E).contains(&b)) {
            return -1;
        }
        let id: String = id_bytes.iter().map(|&b| b as char).collect();
        if id != self.id {
            self.calibytes = [0u8; 32 * 16];
            self.calfrchk = [false; 32];
            self.cal_f32 = [0.0; 256];
            self.calfrms = 0;
            self.temp = None;
            self.humidity = None;
            self.pressure = None;
            if !self.id.is_empty() {
                info!(old = %self.id, new = %id, "sonde id changed, calibration reset");
            }
            self.id = id;
        }

        self.cal_state
            .copy_from_slice(&self.frame[POS_FRAME_NB + 12..POS_FRAME_NB + 14]);

        let calfr = self.frame[POS_CAL_DATA] as usize;
        if calfr < 32 && !self.calfrchk[calfr] {
            for i in 0..16 {
                self.calibytes[calfr * 16 + i] = self.frame[POS_CAL_DATA + 1 + i];
            }
            self.calfrchk[calfr] = true;
            if calfr == 0 {
                let word = u2(&self.frame[POS_CAL_FREQ..]);
                self.freq_khz = Some(if self.ngp {
                    1_600_000 + 10 * word
                } else {
                    400_000 + 10 * word
                });
            }
        }

        if self.calfrms < 32 {
            self.calfrms = self.calfrchk.iter().filter(|&&c| c).count() as u8;
        }
        if self.calfrms == 32 {
            self.calfrms += 1;
            self.cal_table_complete();
        }

        0
    }

    /// PTU keystream: an avalanche mix of four calibration bytes per word.
    fn xor_ptu(&mut self) {
        let pcal = &self.calibytes[0x24..];
        for j in 0..8 {
            let mut a: u32;
            let mut tmp: u32 = 0x1d89;
            for k in 0..4 {
                a = pcal[j + k] as u32;
                let c = tmp;
                a = a.wrapping_add(c);
                let c = a;
                a = (a << 10).wrapping_add(c);
                let c = a;
                a = (a >> 6) ^ c;
                tmp = a;
            }
            a = tmp;
            let c = a;
            a = (a << 3).wrapping_add(c);
            let c = a;
            a = (a >> 11) ^ c;
            let c = a;
            a = (a << 15).wrapping_add(c);

            self.xptu16[2 * j] = (a & 0xFF) as u8;
            self.xptu16[2 * j + 1] = ((a >> 8) & 0xFF) as u8;
        }
    }

    /// Row 0x17 against the SGP constant decides SGP vs NGP; a mismatch of
    /// the configured variant flips it.
    fn chk_toggle_type(&mut self) {
        self.rs_type = if self.calibytes[0x170..0x180] == SGP_CAL_X170 {
            Rs92Type::Sgp
        } else {
            Rs92Type::Ngp
        };
        let should_ngp = self.rs_type == Rs92Type::Ngp;
        if should_ngp != self.ngp {
            warn!(rs_type = ?self.rs_type, "calibration indicates the other rs92 variant");
            self.ngp = should_ngp;
        }
    }

    /// Once all 32 rows are present: derive the NGP cal keystream, pick the
    /// variant, and decode the 66-entry float coefficient table.
    fn cal_table_complete(&mut self) {
        self.xor_ptu();

        // xcal16: keystream bytes recovered against the known SGP row,
        // with the 5-byte record structure shuffling the positions
        let p: [u8; 16] = self.calibytes[0x170..0x180].try_into().expect("16 bytes");
        let q = &SGP_CAL_X170;
        for k in 0..3 {
            self.xcal16[5 * k] = p[5 * k] ^ q[5 * k];
            self.xcal16[5 * k + 1] = p[5 * k + 1] ^ q[5 * k + 1];
            self.xcal16[5 * k + 3] = p[5 * k + 3] ^ q[5 * k + 2];
            self.xcal16[5 * k + 4] = p[5 * k + 4] ^ q[5 * k + 3];
            self.xcal16[5 * k + 2] = p[5 * k + 2] ^ q[5 * k + 4];
        }
        self.xcal16[15] = p[15] ^ q[15];

        self.chk_toggle_type();

        // 66 records of (index, f32le) from 0x40, NGP-descrambled
        let mut xcal = [0u8; 66 * 5];
        for (j, x) in xcal.iter_mut().enumerate() {
            *x = self.calibytes[0x40 + j];
            if self.ngp {
                *x ^= self.xcal16[j % 16];
            }
        }
        for j in 0..66 {
            let idx = xcal[5 * j] as usize;
            let dat = &xcal[5 * j + 1..5 * j + 5];
            let le = u32::from_le_bytes([dat[0], dat[1], dat[2], dat[3]]);
            let xx = u32::from_le_bytes([dat[1], dat[2], dat[0], dat[3]]);
            self.cal_f32[idx] = f32::from_bits(if self.ngp { xx } else { le });
        }
        debug!(
            cal_state = format!("{:02x}{:02x}", self.cal_state[0], self.cal_state[1]),
            "calibration table complete"
        );
    }

    // ── PTU ───────────────────────────────────────────────────────────────────

    fn poly5(x: f32, a: &[f32]) -> f32 {
        ((((a[5] * x + a[4]) * x + a[3]) * x + a[2]) * x + a[1]) * x + a[0]
    }

    /// nu = 1 / (y0 - t/t0); the measurement channels are period ratios.
    fn nu(t: f32, t0: f32, y0: f32) -> f32 {
        1.0 / (y0 - t / t0)
    }

    fn get_meas(&mut self) {
        if self.calfrms <= 0x20 {
            return;
        }

        let mut meas24 = [0u8; 24];
        meas24.copy_from_slice(&self.frame[POS_PTU + 2..POS_PTU + 2 + 24]);
        if self.ngp {
            for (j, byte) in meas24.iter_mut().enumerate() {
                *byte ^= self.frame[POS_FRAME_NB + (j & 1)];
                *byte ^= self.xptu16[j % 16];
            }
        }

        let ch = |i: usize| -> u32 {
            meas24[3 * i] as u32 | (meas24[3 * i + 1] as u32) << 8 | (meas24[3 * i + 2] as u32) << 16
        };
        let temp = ch(0);
        let hum1 = ch(1);
        let hum2 = ch(2);
        let ref1 = ch(3);
        let _ref2 = ch(4);
        let pres = ch(5);
        let ref3 = ch(6);
        let ref4 = ch(7);

        let c = &self.cal_f32;

        let x = Self::nu(
            (ref1 as f32) - (temp as f32),
            (ref1 as f32) - (ref4 as f32),
            c[37],
        );
        let t = Self::poly5(x, &c[30..36]);
        self.temp = (t > -120.0 && t < 80.0).then_some(t as f64);

        let x1 = Self::nu(
            (ref1 as f32) - (hum1 as f32),
            (ref1 as f32) - (ref3 as f32),
            c[47],
        );
        let u1 = Self::poly5(x1, &c[40..46]);
        let x2 = Self::nu(
            (ref1 as f32) - (hum2 as f32),
            (ref1 as f32) - (ref3 as f32),
            c[57],
        );
        let u2 = Self::poly5(x2, &c[50..56]);
        let rh = u1.max(u2).clamp(0.0, 100.0);
        self.humidity = Some(rh as f64);

        let xp = Self::nu(
            (ref1 as f32) - (pres as f32),
            (ref1 as f32) - (ref4 as f32),
            c[17],
        );
        let p = Self::poly5(xp, &c[10..16]);
        self.pressure = (0.0..=2000.0).contains(&p).then_some(p as f64);
    }

    fn get_ptu(&mut self) -> i32 {
        if !self.block_crc_ok(POS_PTU, LEN_PTU) {
            self.crc |= CRC_PTU;
            return 1;
        }
        self.get_meas();
        0
    }

    // ── GPS block ─────────────────────────────────────────────────────────────

    fn get_gps_time(&mut self) -> i32 {
        if !self.block_crc_ok(POS_GPS_TOW, LEN_GPS) {
            self.crc |= CRC_GPS;
            return 1;
        }
        self.tow_ms = u4(&self.frame[POS_GPS_TOW..]) as u64;
        0
    }

    fn get_aux(&mut self) -> i32 {
        if !self.block_crc_ok(POS_AUX, LEN_AUX) {
            self.crc |= CRC_AUX;
            return 1;
        }
        for i in 0..4 {
            self.aux[i] = u2(&self.frame[POS_AUX_DATA + 2 * i..]) as u16;
        }
        0
    }

    /// Unpack the 12 5-bit PRNs from four LE 16-bit words; the 16th bit of
    /// each word is the PRN-32 overflow flag for its column.
    fn prn_bits(&self) -> [u8; 64] {
        let mut bits = [0u8; 64];
        for block in 0..4 {
            let word = u2(&self.frame[POS_GPS_PRN + 2 * block..]);
            for i in 0..15 {
                bits[15 * block + i] = ((word >> i) & 1) as u8;
            }
            bits[60 + block] = ((word >> 15) & 1) as u8;
        }
        bits
    }

    /// Resolve the 12 PRNs including the PRN-32 overflow toggle. The SV
    /// following a PRN-32 slot shares the overflow bit; whether its value
    /// must be XOR-corrected is tracked by `prn32toggle` and revised when a
    /// duplicate PRN would result.
    fn prn12(&mut self, prn_le: &[u8; 64]) -> [u8; 12] {
        let mut prns = [0u8; 12];
        let status = &self.frame[POS_GPS_STATUS..POS_GPS_STATUS + 12];

        for i in 0..12 {
            let mut v = 0u8;
            for j in 0..5 {
                v |= (prn_le[5 * i + j]) << j;
            }
            prns[i] = v;
        }

        let mut ind_prn32 = 32usize;
        for i in 0..12 {
            if prns[i] == 0 && status[i] & 0x0F != 0 {
                let overflow = if i % 3 == 2 {
                    prn_le[60 + i / 3] & 1 != 0
                } else {
                    prn_le[5 * (i + 1)] & 1 != 0
                };
                if overflow {
                    prns[i] = 32;
                    ind_prn32 = i;
                }
            } else if status[i] & 0x0F == 0 {
                prns[i] = 0;
            }
        }

        self.prn32next = 0;
        if ind_prn32 < 12 && ind_prn32 % 3 != 2 {
            let next = ind_prn32 + 1;
            if status[next] & 0x0F != 0 && prns[next] > 1 {
                let candidate = prns[next] ^ self.prn32toggle;
                let dup = (0..12).any(|j| {
                    j != next && prns[j] == candidate && status[j] & 0x0F != 0
                });
                if dup {
                    self.prn32toggle ^= 0x1;
                }
                prns[next] ^= self.prn32toggle;
            }
            self.prn32next = prns[next];
        }

        prns
    }

    /// Decode the raw ranges, compute satellite states, and return the PRN
    /// list usable for the solve.
    fn get_pseudorange(&mut self) -> Vec<u8> {
        let tow = self.tow_ms as f64 / 1000.0;
        let prn_le = self.prn_bits();
        let prns = self.prn12(&prn_le);

        let Some(src) = &self.eph_source else {
            return Vec::new();
        };

        // satellite positions at transmission epoch (and at t-1s for the
        // differenced-velocity mode)
        let mut week_out = self.week;
        for prn in 1..33u8 {
            if let Some((eph, rollover)) = select_ephemeris(&src.ephs, prn, tow) {
                let week = eph.week - rollover;
                week_out = if src.is_almanac {
                    eph.week - rollover + src.week1024_epoch * 1024
                } else {
                    eph.gpsweek - rollover
                };
                let (pos, vel, clk, drift) = eph.satellite_position_velocity(week, tow);
                self.sats[prn as usize] = Sat {
                    prn,
                    pos,
                    vel,
                    clock_corr: clk,
                    clock_drift: drift,
                    ..self.sats[prn as usize]
                };
                let (pos1, clk1) = eph.satellite_position(week, tow - 1.0);
                self.sats_1s[prn as usize] = Sat {
                    prn,
                    pos: pos1,
                    clock_corr: clk1,
                    ..self.sats_1s[prn as usize]
                };
            }
        }
        self.week = week_out;

        let mut ranges = [RawRange::default(); 33];
        let mut usable: Vec<u8> = Vec::new();

        for j in 0..12 {
            let prn = prns[j] as usize;
            let chips = u4(&self.frame[POS_GPS_DATA + 8 * j..]);
            let d = &self.frame[POS_GPS_DATA + 8 * j + 4..];
            let deltabytes = d[0] as u32 | (d[1] as u32) << 8 | (d[2] as u32) << 16;

            ranges[prn].status = self.frame[POS_GPS_STATUS + j];

            // idle-channel sentinels and out-of-band chip counts
            if chips == 0x7FFF_FFFF || chips == 0x5555_5555 {
                continue;
            }
            if chips > 0x1000_0000 && chips < 0xF000_0000 {
                continue;
            }
            ranges[prn].chips = chips;
            ranges[prn].deltachips = deltabytes as i32;

            let healthy = prn > 0
                && ranges[prn].status & 0x0F == 0x0F
                && self.sats[prn].pos.norm() > 6_700_000.0;
            if healthy && Some(prn as u8) != self.exsat && !usable.contains(&(prn as u8)) {
                usable.push(prn as u8);
            }
        }

        for &prn in prns.iter() {
            let prn = prn as usize;
            self.sats[prn].pseudorange = -(ranges[prn].chips as f64) * DF;
            self.sats_1s[prn].pseudorange =
                -((ranges[prn].chips as f64) - (ranges[prn].deltachips as f64) / DL) * DF;
            self.sats[prn].pseudorate = -(ranges[prn].deltachips as f64) * DF / DL;
        }

        // solver input: pseudorange plus SV clock; the common receiver
        // offset lands in the clock-bias unknown
        for &prn in &usable {
            let prn = prn as usize;
            self.sats[prn].pr = self.sats[prn].pseudorange + self.sats[prn].clock_corr;
            self.sats_1s[prn].pr = self.sats_1s[prn].pseudorange + self.sats[prn].clock_corr;
        }

        usable
    }

    /// Position (and velocity) solve for this frame's measurement set.
    fn solve(
        &mut self,
        prns: &[u8],
        opts: &SolverOpts,
        vel_mode: VelocityMode,
    ) -> Option<(sonde_types::Geodetic, Option<sonde_types::GroundTrack>, f64, usize)> {
        let mut sats: Vec<Sat> = prns.iter().map(|&p| self.sats[p as usize]).collect();
        let mut prn_list: Vec<u8> = prns.to_vec();

        let fix = solver::solve_position(&mut sats, opts)?;
        debug!(
            clock_bias = format!("{:.1}", fix.clock_bias),
            diter = format!("{:.1}", fix.diter),
            "position solved"
        );
        if let Some(ejected) = fix.ejected {
            let prn = prn_list.remove(ejected);
            if prn == self.prn32next {
                self.prn32toggle ^= 0x1;
                debug!(prn, "prn32 toggle flipped after ejection");
            }
        }

        if fix.gdop <= 0.0 || fix.gdop > opts.dop_limit || fix.diter > opts.d_err {
            debug!(gdop = fix.gdop, diter = fix.diter, "fix gated out");
            return None;
        }
        if fix.geo.alt < -1000.0 || fix.geo.alt > 80_000.0 {
            return None;
        }

        let track = match vel_mode {
            VelocityMode::None => None,
            VelocityMode::Lsq | VelocityMode::Doppler => {
                let mut vel = [0.0f64; 3];
                let (dv, cdot) = solver::lin_vel(&sats, fix.ecef, vel, 0.0)?;
                for k in 0..3 {
                    vel[k] += dv[k];
                }
                if vel_mode == VelocityMode::Doppler {
                    // second iteration against the estimated clock drift
                    let (dv2, _) = solver::lin_vel(&sats, fix.ecef, vel, cdot)?;
                    for k in 0..3 {
                        vel[k] += dv2[k];
                    }
                }
                Some(ecef_vel_to_track(fix.geo.lat, fix.geo.lon, vel))
            }
            VelocityMode::Differenced => {
                let mut sats1: Vec<Sat> =
                    prn_list.iter().map(|&p| self.sats_1s[p as usize]).collect();
                let (mut p1, cc1) = solver::bancroft(&sats1)?;
                if let Some((dp, _)) = solver::lin_pos(&sats1, p1, cc1) {
                    p1 = sonde_types::Ecef::new(p1.x + dp[0], p1.y + dp[1], p1.z + dp[2]);
                }
                let vel = [
                    fix.ecef.x - p1.x,
                    fix.ecef.y - p1.y,
                    fix.ecef.z - p1.z,
                ];
                Some(ecef_vel_to_track(fix.geo.lat, fix.geo.lon, vel))
            }
        };

        Some((fix.geo, track, fix.gdop, fix.sats_used))
    }

    // ── ECC / frame processing ────────────────────────────────────────────────

    /// One RS(255,231) codeword: parity at the frame tail, message from
    /// byte 6 through the parity start.
    fn rs92_ecc(&mut self, msglen: usize) -> i32 {
        let Some(rs) = self.rs.as_ref() else {
            return 0;
        };
        let parpos = FRAME_LEN - 24;
        let msgpos = FRAME_START;
        let msg_len = parpos - msgpos; // 210

        let msglen = msglen.min(FRAME_LEN);
        for i in msglen..FRAME_LEN {
            self.frame[i] = 0;
        }

        let mut cw = [0u8; 255];
        cw[..24].copy_from_slice(&self.frame[parpos..parpos + 24]);
        cw[24..24 + msg_len].copy_from_slice(&self.frame[msgpos..msgpos + msg_len]);

        let ret = match rs.decode(&mut cw) {
            Ok(n) => n as i32,
            Err(e) => e.code(),
        };

        self.frame[parpos..parpos + 24].copy_from_slice(&cw[..24]);
        self.frame[msgpos..msgpos + msg_len].copy_from_slice(&cw[24..24 + msg_len]);
        ret
    }

    pub fn process_frame(&mut self, len: usize, opts: &DecodeOpts, solver_opts: &SolverOpts) {
        self.crc = 0;
        self.temp = None;

        let ec = self.rs.is_some().then(|| self.rs92_ecc(len));
        for i in len..FRAME_LEN {
            self.frame[i] = 0;
        }

        if opts.output.raw {
            output::print_raw_frame(&self.frame[..len.min(FRAME_LEN)], ec, false);
            return;
        }

        let err_conf = self.get_frame_conf() != 0;
        let _ = self.get_ptu();
        let err_gps = self.get_gps_time() != 0;
        let aux_ok = self.get_aux() == 0;
        if aux_ok && opts.output.verbosity >= 2 {
            info!(
                aux = format!(
                    "{:04x} {:04x} {:04x} {:04x}",
                    self.aux[0], self.aux[1], self.aux[2], self.aux[3]
                ),
                "aux block"
            );
        }

        let mut tel = Telemetry::new(SondeKind::Rs92);
        tel.crc = self.crc;
        tel.ecc = ec;
        tel.frame = self.frnr;
        if !err_conf {
            tel.id = self.id.clone();
            tel.freq = self.freq_khz;
            tel.subtype = Some(
                match self.rs_type {
                    Rs92Type::Sgp => "RS92-SGP",
                    Rs92Type::Ngp => "RS92-NGP",
                }
                .to_string(),
            );
        }

        if !err_gps {
            let prns = self.get_pseudorange();
            if prns.len() >= 4 {
                if let Some((geo, track, gdop, n)) = self.solve(&prns, solver_opts, opts.vel) {
                    tel.pos = Some(geo);
                    tel.track = track;
                    tel.sats = Some(n as u32);
                    debug!(gdop, sats = n, "fix");
                }
            }
            // time emits even without a position
            tel.week = self.week;
            if self.week > 0 {
                tel.datetime = Some(GpsDateTime::from_gps(self.week, self.tow_ms));
            }
        }
        if self.crc & CRC_PTU == 0 {
            tel.temp = self.temp;
            tel.humidity = self.humidity;
            tel.pressure = self.pressure;
        }

        if err_conf && err_gps {
            return;
        }
        output::print_text(&tel, &opts.output);
        if opts.output.json && !err_conf && !err_gps && tel.pos.is_some() {
            output::print_json(&tel);
        }
    }
}

/// Decode loop: Manchester pairs into 10-bit 8N1 bytes.
pub fn run<S: SampleSource>(
    src: S,
    spb: f32,
    opts: &DecodeOpts,
    eph_source: Option<EphemerisSource>,
) -> Result<(), SourceError> {
    let (mut sync, k) = SymbolSync::fft(src, RAW_HEADER, spb, PulseShape::Gauss);
    let thres = opts.thres.unwrap_or(SondeKind::Rs92.corr_threshold());
    let mut scanner = Scanner::new(k, thres, 2, 2, false).invert(opts.invert);

    let solver_opts = SolverOpts {
        dop_limit: opts.dop_limit,
        d_err: opts.d_err.unwrap_or(match &eph_source {
            Some(s) if s.is_almanac => 4000.0,
            Some(_) => 1000.0,
            None => 10_000.0,
        }),
        iterate: true,
    };

    let mut decoder = Rs92::new(opts.ecc > 0, opts.ngp, eph_source);
    decoder.exsat = opts.exsat;
    let bitofs = 2 + opts.shift;

    info!(spb, thres, "rs92 decoder");

    'scan: while scanner.next_header(&mut sync)?.is_some() {
        let mut byte_count = FRAME_START;
        let mut bit_count = 0u32;
        let mut bitbuf = [0u8; 10];
        let mut bitpos = 0usize;

        while byte_count < FRAME_LEN {
            let Some(bit) = sync.read_bit(2, opts.invert, bitofs, bit_count == 0, opts.spike)?
            else {
                if byte_count > POS_GPS_TOW + LEN_GPS {
                    decoder.process_frame(byte_count, opts, &solver_opts);
                }
                break 'scan;
            };
            bit_count += 1;
            bitbuf[bitpos] = bit;
            bitpos += 1;
            if bitpos == 10 {
                bitpos = 0;
                // 8N1: skip start and stop bit, LSB first
                let mut byte = 0u8;
                for (i, &b) in bitbuf[1..9].iter().enumerate() {
                    byte |= b << i;
                }
                decoder.frame[byte_count] = byte;
                byte_count += 1;
            }
        }

        if byte_count == FRAME_LEN {
            decoder.process_frame(byte_count, opts, &solver_opts);
        }
    }

    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn put_block(frame: &mut [u8], data_pos: usize, len: usize) {
        let crc = crc16_ccitt(&frame[data_pos..data_pos + len]);
        frame[data_pos + len] = (crc & 0xFF) as u8;
        frame[data_pos + len + 1] = (crc >> 8) as u8;
    }

    fn synth_frame(d: &mut Rs92) {
        d.frame[POS_FRAME_NB - 2] = 0x10; // block id 6510
        d.frame[POS_FRAME_NB - 1] = 0x65;
        d.frame[POS_FRAME_NB..POS_FRAME_NB + 2].copy_from_slice(&4177u16.to_le_bytes());
        d.frame[POS_SONDE_ID..POS_SONDE_ID + 8].copy_from_slice(b"M1234567");
        d.frame[POS_CAL_DATA] = 0x05;
        put_block(&mut d.frame, POS_FRAME_NB, LEN_CFG);

        d.frame[POS_GPS_TOW - 2] = 0x3D;
        d.frame[POS_GPS_TOW - 1] = 0x67;
        d.frame[POS_GPS_TOW..POS_GPS_TOW + 4]
            .copy_from_slice(&259_205_123u32.to_le_bytes());
        put_block(&mut d.frame, POS_GPS_TOW, LEN_GPS);
    }

    #[test]
    fn config_and_gps_blocks_verify() {
        let mut d = Rs92::new(false, false, None);
        synth_frame(&mut d);
        assert_eq!(d.get_frame_conf(), 0);
        assert_eq!(d.get_gps_time(), 0);
        assert_eq!(d.frnr, 4177);
        assert_eq!(d.id, "M1234567");
        assert_eq!(d.tow_ms, 259_205_123);
        assert!(d.calfrchk[5]);

        // flip a payload byte: only the config block fails
        d.frame[POS_SONDE_ID] ^= 0x20;
        d.crc = 0;
        assert_ne!(d.get_frame_conf(), 0);
        assert_eq!(d.get_gps_time(), 0);
        assert_eq!(d.crc, CRC_FRAME);
    }

    #[test]
    fn ecc_round_trip_over_the_message_span() {
        let mut d = Rs92::new(true, false, None);
        synth_frame(&mut d);

        let rs = ReedSolomon::vaisala();
        let mut cw = [0u8; 255];
        cw[24..24 + 210].copy_from_slice(&d.frame[6..216]);
        rs.encode(&mut cw);
        d.frame[216..240].copy_from_slice(&cw[..24]);

        let clean = d.frame;
        d.frame[0x50] ^= 0xFF;
        d.frame[0x90] ^= 0x01;
        assert_eq!(d.rs92_ecc(FRAME_LEN), 2);
        assert_eq!(d.frame[..], clean[..]);
    }

    #[test]
    fn prn12_basic_and_overflow() {
        let mut d = Rs92::new(false, false, None);
        // slots: [3, 17, 9, 31, 12, 1, ...]; all status-healthy
        let slot_vals = [3u8, 17, 9, 31, 12, 1, 2, 4, 5, 6, 7, 8];
        let mut words = [0u16; 4];
        for (i, &v) in slot_vals.iter().enumerate() {
            let block = i / 3;
            let k = i % 3;
            words[block] |= ((v & 0x1F) as u16) << (5 * k);
        }
        for (b, w) in words.iter().enumerate() {
            d.frame[POS_GPS_PRN + 2 * b..POS_GPS_PRN + 2 * b + 2]
                .copy_from_slice(&w.to_le_bytes());
        }
        for i in 0..12 {
            d.frame[POS_GPS_STATUS + i] = 0x0F;
        }
        let bits = d.prn_bits();
        let prns = d.prn12(&bits);
        assert_eq!(&prns[..], &slot_vals[..]);

        // a zero slot with the overflow bit set reads as PRN 32; the third
        // column's flag is bit 15 of its word
        let mut d = Rs92::new(false, false, None);
        let mut words = [0u16; 4];
        words[0] = 3 | (17 << 5) | 0x8000; // slot2 = 0 with overflow flag
        for (b, w) in words.iter().enumerate() {
            d.frame[POS_GPS_PRN + 2 * b..POS_GPS_PRN + 2 * b + 2]
                .copy_from_slice(&w.to_le_bytes());
        }
        for i in 0..3 {
            d.frame[POS_GPS_STATUS + i] = 0x0F;
        }
        let bits = d.prn_bits();
        let prns = d.prn12(&bits);
        assert_eq!(prns[0], 3);
        assert_eq!(prns[1], 17);
        assert_eq!(prns[2], 32);
    }

    #[test]
    fn unhealthy_status_clears_the_slot() {
        let mut d = Rs92::new(false, false, None);
        let mut words = [0u16; 4];
        words[0] = 3 | (17 << 5) | (9 << 10);
        d.frame[POS_GPS_PRN..POS_GPS_PRN + 2].copy_from_slice(&words[0].to_le_bytes());
        d.frame[POS_GPS_STATUS] = 0x0F;
        d.frame[POS_GPS_STATUS + 1] = 0x00; // unhealthy
        d.frame[POS_GPS_STATUS + 2] = 0x0F;
        let bits = d.prn_bits();
        let prns = d.prn12(&bits);
        assert_eq!(prns[0], 3);
        assert_eq!(prns[1], 0);
        assert_eq!(prns[2], 9);
    }

    #[test]
    fn pseudorange_scale_preserves_chip_differences() {
        // two chip counts a fixed number of chips apart decode to ranges
        // exactly df*delta apart
        let chips_a: u32 = 1_000_000;
        let chips_b: u32 = 1_003_500;
        let pr_a = -(chips_a as f64) * DF;
        let pr_b = -(chips_b as f64) * DF;
        assert!(((pr_a - pr_b) - 3500.0 * DF).abs() < 1e-9);
        // df itself is c/(1023000 * 1024)
        assert!((DF - 299_792_458.0 / (1_023_000.0 * 1024.0)).abs() < 1e-12);
        // the delta-chip divisor is (L1 / chip rate) / 4 = 385 exactly
        assert!((DL - 385.0).abs() < 1e-9);
    }

    #[test]
    fn sgp_constant_row_selects_the_sgp_variant() {
        let mut d = Rs92::new(false, true, None); // configured NGP
        d.calibytes[0x170..0x180].copy_from_slice(&SGP_CAL_X170);
        for i in 0..32 {
            d.calfrchk[i] = true;
        }
        d.calfrms = 32;
        d.cal_table_complete();
        // the constant row overrides the configured variant
        assert_eq!(d.rs_type, Rs92Type::Sgp);
        assert!(!d.ngp);
    }

    #[test]
    fn cal_float_records_land_at_their_index() {
        let mut d = Rs92::new(false, false, None);
        d.calibytes[0x170..0x180].copy_from_slice(&SGP_CAL_X170);
        // one (index, f32) record: coefficient 37 = 1.5
        d.calibytes[0x40] = 37;
        d.calibytes[0x41..0x45].copy_from_slice(&1.5f32.to_le_bytes());
        for i in 0..32 {
            d.calfrchk[i] = true;
        }
        d.calfrms = 32;
        d.cal_table_complete();
        assert_eq!(d.cal_f32[37], 1.5);
    }
}
