//! m10.rs — Meisei M10 decoder.
//!
//! 9616 Bd Manchester with differential coding: the transmitted symbol is
//! the XOR of consecutive data bits, so the slicer output is re-differenced
//! (`out = 1 ^ (prev ^ cur)`) and polarity drops out. Bytes are MSB-first.
//! A frame is 102 bytes ending in a 16-bit additive checksum over the first
//! 0x63 bytes. Fields are big-endian; coordinates use the 2^32/360 angle
//! scaling.

use crate::dsp::{PulseShape, SymbolSync};
use crate::framing::Scanner;
use crate::output;
use crate::wav::{SampleSource, SourceError};
use crate::DecodeOpts;
use sonde_ecc::crc::check_m10;
use sonde_types::{Geodetic, GpsDateTime, SondeKind, Telemetry};
use sonde_types::track_from_neu;
use tracing::{debug, info};

pub const BAUD: f64 = 9616.0;

pub const RAW_HEADER: &str = "10011001100110010100110010011001";

const FRAME_LEN: usize = 102;
const BITFRAME_LEN: usize = FRAME_LEN * 8;

const POS_GPS_TOW: usize = 0x0A;
const POS_GPS_LAT: usize = 0x0E;
const POS_GPS_LON: usize = 0x12;
const POS_GPS_ALT: usize = 0x16;
const POS_GPS_WEEK: usize = 0x20;
const POS_VEL_E: usize = 0x04;
const POS_VEL_N: usize = 0x06;
const POS_VEL_V: usize = 0x08;
const POS_SN: usize = 0x5D;
const POS_CHECK: usize = 0x63;

/// 2^32 / 360 = 0xB60B60.xxx — angles are a full-turn fixed-point fraction.
const B60B60: f64 = 0xB60B60 as f64;

fn u16be(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn i16be(b: &[u8]) -> i16 {
    i16::from_be_bytes([b[0], b[1]])
}

fn u32be(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

pub struct M10 {
    frame: [u8; FRAME_LEN],
}

impl M10 {
    pub fn new() -> Self {
        M10 {
            frame: [0u8; FRAME_LEN],
        }
    }

    fn checksum_ok(&self) -> bool {
        let cs1 = u16be(&self.frame[POS_CHECK..]);
        let cs2 = check_m10(&self.frame[..POS_CHECK]);
        cs1 == cs2
    }

    /// Five serial bytes formatted the way the sticker prints them.
    fn serial(&self) -> String {
        let b = &self.frame[POS_SN..POS_SN + 5];
        let w = b[3] as u16 | (b[4] as u16) << 8;
        format!(
            "{:1X}{:02} {:1X} {:1}{:04}",
            (b[2] >> 4) & 0xF,
            b[2] & 0xF,
            b[0] & 0xF,
            (w >> 13) & 0x7,
            w & 0x1FFF
        )
    }

    /// Shibaura NTC: range/scale index selects the divider network, then a
    /// Steinhart-Hart fit maps resistance to temperature.
    fn temperature(&self) -> f64 {
        let p = [
            1.07303516e-03,
            2.41296733e-04,
            2.26744154e-06,
            6.52855181e-08,
        ];
        let rs = [12.1e3, 36.5e3, 475.0e3];
        let rp = [1e20, 330.0e3, 3000.0e3];

        let sc_t = self.frame[0x3E] as usize;
        let adc_rt =
            (((self.frame[0x40] as u32) << 8 | self.frame[0x3F] as u32).wrapping_sub(0xA000))
                & 0xFFFF;

        let adc_max = 4095.0;
        let x = (adc_max - adc_rt as f64) / adc_rt.max(1) as f64;
        let r = if sc_t < 3 {
            rs[sc_t] / (x - rs[sc_t] / rp[sc_t])
        } else {
            -1.0
        };

        if r > 0.0 {
            let lnr = r.ln();
            1.0 / (p[0] + p[1] * lnr + p[2] * lnr * lnr + p[3] * lnr * lnr * lnr) - 273.15
        } else {
            -273.15
        }
    }

    fn parse(&self, cs_ok: bool, opts: &DecodeOpts) -> Option<Telemetry> {
        let week = u16be(&self.frame[POS_GPS_WEEK..]) as i32;
        if !(0..=3000).contains(&week) {
            return None;
        }

        let tow_ms = u32be(&self.frame[POS_GPS_TOW..]) as u64;
        let day = tow_ms / 1000 / 86_400;
        if day > 6 {
            return None;
        }

        let lat = u32be(&self.frame[POS_GPS_LAT..]) as i32 as f64 / B60B60;
        let lon = u32be(&self.frame[POS_GPS_LON..]) as i32 as f64 / B60B60;
        let alt = u32be(&self.frame[POS_GPS_ALT..]) as i32 as f64 / 1000.0;

        // velocities come in 1/200 m/s (knots*100) units, ENU
        let ve = i16be(&self.frame[POS_VEL_E..]) as f64 / 2e2;
        let vn = i16be(&self.frame[POS_VEL_N..]) as f64 / 2e2;
        let vv = i16be(&self.frame[POS_VEL_V..]) as f64 / 2e2;

        let mut tel = Telemetry::new(SondeKind::M10);
        tel.frame = (tow_ms / 1000) as u32; // no frame counter on air; tow stands in
        tel.week = week;
        tel.id = self.serial();
        tel.datetime = Some(GpsDateTime::from_gps(week, tow_ms));
        tel.pos = Some(Geodetic { lat, lon, alt });
        tel.track = Some(track_from_neu(vn, ve, vv));
        tel.crc = if cs_ok { 0 } else { 1 };
        if opts.output.ptu && cs_ok {
            let t = self.temperature();
            if t > -270.0 {
                tel.temp = Some(t);
            }
        }
        Some(tel)
    }

    pub fn process_frame(&mut self, opts: &DecodeOpts) {
        let cs_ok = self.checksum_ok();

        if opts.output.raw {
            output::print_raw_frame(
                &self.frame[..FRAME_LEN - 1],
                Some(if cs_ok { 0 } else { -1 }),
                false,
            );
            return;
        }
        if self.frame[1] == 0x49 {
            // M10-dop variant frame, different layout
            debug!("m10 0x49 frame skipped");
            return;
        }
        if let Some(tel) = self.parse(cs_ok, opts) {
            output::print_text(&tel, &opts.output);
            if opts.output.json && cs_ok {
                output::print_json(&tel);
            }
        }
    }
}

impl Default for M10 {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode loop. Negative correlation peaks are accepted: the differential
/// decode is polarity-insensitive.
pub fn run<S: SampleSource>(src: S, spb: f32, opts: &DecodeOpts) -> Result<(), SourceError> {
    let (mut sync, k) = SymbolSync::fft(src, RAW_HEADER, spb, PulseShape::Clipped);
    let thres = opts.thres.unwrap_or(SondeKind::M10.corr_threshold());
    let mut scanner = Scanner::new(k, thres, 1, 2, true).invert(opts.invert).dc_tracking(opts.dc);

    let mut decoder = M10::new();
    let bitofs = 1 + opts.shift;

    info!(spb, thres, "m10 decoder");

    'scan: while scanner.next_header(&mut sync)?.is_some() {
        let mut bits = [0u8; BITFRAME_LEN];
        let mut pos = 0usize;
        let mut bitpos = 0u32;
        let mut bit0 = 0u8;

        while pos < BITFRAME_LEN {
            let Some(bit) = sync.read_bit(2, opts.invert, bitofs, bitpos == 0, false)? else {
                debug!("eof inside frame");
                break 'scan;
            };
            bits[pos] = 1 ^ (bit0 ^ bit); // differential decode
            bit0 = bit;
            pos += 1;
            bitpos += 1;
        }

        // MSB-first byte pack
        for (bytepos, chunk) in bits.chunks_exact(8).enumerate() {
            let mut byte = 0u8;
            for (i, &b) in chunk.iter().enumerate() {
                byte |= (b & 1) << (7 - i);
            }
            decoder.frame[bytepos] = byte;
        }

        decoder.process_frame(opts);

        // spool to the end of the second (a doubled frame appears every 10 s)
        while bitpos < 5 * BITFRAME_LEN as u32 {
            match sync.read_bit(2, opts.invert, bitofs, false, false)? {
                Some(_) => bitpos += 1,
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

    fn synth_frame() -> M10 {
        let mut m = M10::new();
        m.frame[0] = 0x64;
        m.frame[1] = 0x9F;
        m.frame[2] = 0x20;

        m.frame[POS_GPS_WEEK..POS_GPS_WEEK + 2].copy_from_slice(&2086u16.to_be_bytes());
        let tow_ms: u32 = (2 * 86_400 + 7 * 3600 + 120) * 1000;
        m.frame[POS_GPS_TOW..POS_GPS_TOW + 4].copy_from_slice(&tow_ms.to_be_bytes());

        let lat_units = (48.2 * B60B60) as i32;
        let lon_units = (-16.37 * B60B60) as i32;
        m.frame[POS_GPS_LAT..POS_GPS_LAT + 4].copy_from_slice(&lat_units.to_be_bytes());
        m.frame[POS_GPS_LON..POS_GPS_LON + 4].copy_from_slice(&lon_units.to_be_bytes());
        m.frame[POS_GPS_ALT..POS_GPS_ALT + 4]
            .copy_from_slice(&(28_765_432i32).to_be_bytes()); // mm

        m.frame[POS_VEL_E..POS_VEL_E + 2].copy_from_slice(&(400i16).to_be_bytes()); // 2 m/s E
        m.frame[POS_VEL_N..POS_VEL_N + 2].copy_from_slice(&(0i16).to_be_bytes());
        m.frame[POS_VEL_V..POS_VEL_V + 2].copy_from_slice(&(-300i16).to_be_bytes());

        m.frame[POS_SN] = 0x23;
        m.frame[POS_SN + 2] = 0x91;

        let cs = check_m10(&m.frame[..POS_CHECK]);
        m.frame[POS_CHECK..POS_CHECK + 2].copy_from_slice(&cs.to_be_bytes());
        m
    }

    #[test]
    fn checksum_round_trip_and_bit_flips() {
        let m = synth_frame();
        assert!(m.checksum_ok());
        // flipping any bit in the covered span must break it
        for pos in [0usize, 5, 0x0A, 0x20, 0x3F, 0x62] {
            for bit in 0..8 {
                let mut bad = M10::new();
                bad.frame = m.frame;
                bad.frame[pos] ^= 1 << bit;
                assert!(!bad.checksum_ok(), "flip {pos}:{bit} undetected");
            }
        }
    }

    #[test]
    fn parses_position_and_week() {
        let m = synth_frame();
        let opts = DecodeOpts::default();
        let tel = m.parse(true, &opts).expect("frame should parse");

        assert_eq!(tel.week, 2086);
        let dt = tel.datetime.unwrap();
        assert_eq!(dt.weekday(), "Tue");
        assert_eq!((dt.hour, dt.min), (7, 2));

        let pos = tel.pos.unwrap();
        assert!((pos.lat - 48.2).abs() < 1e-5);
        assert!((pos.lon + 16.37).abs() < 1e-5);
        assert!((pos.alt - 28_765.432).abs() < 1e-6);

        let track = tel.track.unwrap();
        assert!((track.vel_h - 2.0).abs() < 1e-9);
        assert!((track.heading - 90.0).abs() < 1e-9);
        assert!((track.vel_v + 1.5).abs() < 1e-9);
    }

    #[test]
    fn nonsense_week_or_day_is_rejected() {
        let mut m = synth_frame();
        m.frame[POS_GPS_WEEK..POS_GPS_WEEK + 2].copy_from_slice(&40_000u16.to_be_bytes());
        assert!(m.parse(true, &DecodeOpts::default()).is_none());

        let mut m = synth_frame();
        let bad_tow: u32 = 8 * 86_400 * 1000;
        m.frame[POS_GPS_TOW..POS_GPS_TOW + 4].copy_from_slice(&bad_tow.to_be_bytes());
        assert!(m.parse(true, &DecodeOpts::default()).is_none());
    }

    #[test]
    fn differential_decode_is_polarity_insensitive() {
        // raw symlen-2 bit stream b; decoded d[i] = 1 ^ (b[i-1] ^ b[i])
        let raw = [1u8, 1, 0, 1, 0, 0, 0, 1];
        let mut out = Vec::new();
        let mut prev = 0u8;
        for &b in &raw {
            out.push(1 ^ (prev ^ b));
            prev = b;
        }
        let mut out_inv = Vec::new();
        let mut prev = 1u8;
        for &b in &raw {
            let b = b ^ 1;
            out_inv.push(1 ^ (prev ^ b));
            prev = b;
        }
        assert_eq!(out[1..], out_inv[1..]);
    }
}
