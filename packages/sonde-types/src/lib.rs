//! # sonde-types
//!
//! Shared types and geodesy for the radiosonde decoder suite.
//!
//! These types are used by:
//! - `decoder-rust`: assembling decoded frames into telemetry records
//! - `packages/sonde-ecc`: only for error kinds surfaced in records
//!
//! ## Coordinate conventions
//!
//! - **ECEF**: Earth-centered Earth-fixed Cartesian, WGS84, meters
//! - **Geodetic**: latitude/longitude in degrees, height above the WGS84
//!   ellipsoid in meters (not MSL)
//! - **NEU**: local North-East-Up at the receiver, used for horizontal
//!   speed / heading / climb
//!
//! Time is GPS time (week + time-of-week). Civil dates come from the
//! Modified-Julian-Day conversion and ignore leap seconds.

use serde::Serialize;

// ── Sonde families ────────────────────────────────────────────────────────────

/// The decoder families this suite understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SondeKind {
    /// Vaisala RS41 (4800 Bd GFSK, RS(255,231))
    Rs41,
    /// Vaisala RS92 (4800 Bd manchester, RS(255,231), raw pseudoranges)
    Rs92,
    /// GRAW DFM-06/09/17 (2500 Bd manchester, Hamming(8,4))
    Dfm,
    /// Lockheed Martin LMS6 (4800 Bd, r=1/2 K=7 conv + RS CCSDS)
    Lms6,
    /// Meisei M10 (9616 Bd manchester, additive checksum)
    M10,
}

impl SondeKind {
    /// Nominal symbol rate in baud.
    pub fn baud(self) -> f64 {
        match self {
            SondeKind::Rs41 => 4800.0,
            SondeKind::Rs92 => 4800.0,
            SondeKind::Dfm => 2500.0,
            SondeKind::Lms6 => 4797.7,
            SondeKind::M10 => 9616.0,
        }
    }

    /// Default correlation threshold for header acquisition.
    pub fn corr_threshold(self) -> f32 {
        match self {
            SondeKind::Rs41 => 0.7,
            SondeKind::Rs92 => 0.7,
            SondeKind::Dfm => 0.6,
            SondeKind::Lms6 => 0.76,
            SondeKind::M10 => 0.76,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SondeKind::Rs41 => "RS41",
            SondeKind::Rs92 => "RS92",
            SondeKind::Dfm => "DFM",
            SondeKind::Lms6 => "LMS6",
            SondeKind::M10 => "M10",
        }
    }
}

impl std::fmt::Display for SondeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── GPS time ──────────────────────────────────────────────────────────────────

pub const SECONDS_IN_WEEK: f64 = 604_800.0;

/// Civil date + time-of-day derived from GPS week / time-of-week.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GpsDateTime {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    /// Day of week, 0 = Sunday.
    pub wday: u32,
    pub hour: u32,
    pub min: u32,
    /// Seconds including the millisecond fraction.
    pub sec: f64,
}

pub const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

impl GpsDateTime {
    /// Convert GPS week and time-of-week (milliseconds) to a civil date.
    ///
    /// Adapted from the sci.astro FAQ MJD conversion; UTC leap seconds are
    /// ignored (the record carries a `ref_datetime: "GPS"` marker instead).
    pub fn from_gps(week: i32, tow_ms: u64) -> Self {
        let secs = tow_ms / 1000;
        let ms = tow_ms % 1000;

        let gps_days = week as i64 * 7 + (secs / 86_400) as i64;
        let mjd = 44_244 + gps_days;

        let mut j = mjd + 2_468_570;
        let c = 4 * j / 146_097;
        j -= (146_097 * c + 3) / 4;
        let y = 4000 * (j + 1) / 1_461_001;
        j = j - 1461 * y / 4 + 31;
        let m = 80 * j / 2447;
        let day = (j - 2447 * m / 80) as u32;
        j = m / 11;
        let month = (m + 2 - 12 * j) as u32;
        let year = (100 * (c - 49) + y + j) as i32;

        let wday = ((secs / 86_400) % 7) as u32;
        let day_secs = secs % 86_400;

        GpsDateTime {
            year,
            month,
            day,
            wday,
            hour: (day_secs / 3600) as u32,
            min: (day_secs % 3600 / 60) as u32,
            sec: (day_secs % 60) as f64 + ms as f64 / 1000.0,
        }
    }

    /// Build from a civil date (sondes that transmit UTC directly); the
    /// weekday falls out of the day number.
    pub fn from_civil(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: f64) -> Self {
        let a = (14 - month as i64) / 12;
        let y = year as i64 + 4800 - a;
        let m = month as i64 + 12 * a - 3;
        let jdn =
            day as i64 + (153 * m + 2) / 5 + 365 * y + y / 4 - y / 100 + y / 400 - 32_045;
        let mjd = jdn - 2_400_001;
        GpsDateTime {
            year,
            month,
            day,
            wday: ((mjd + 3).rem_euclid(7)) as u32,
            hour,
            min,
            sec,
        }
    }

    pub fn weekday(&self) -> &'static str {
        WEEKDAYS[(self.wday % 7) as usize]
    }

    /// ISO-8601 `YYYY-MM-DDTHH:MM:SS.sssZ` (GPS timescale, `Z`-suffixed).
    pub fn iso8601(&self) -> String {
        format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:06.3}Z",
            self.year, self.month, self.day, self.hour, self.min, self.sec
        )
    }
}

// ── WGS84 ellipsoid ───────────────────────────────────────────────────────────

pub const EARTH_A: f64 = 6_378_137.0;
pub const EARTH_B: f64 = 6_356_752.314_245_18;
pub const EARTH_A2_B2: f64 = EARTH_A * EARTH_A - EARTH_B * EARTH_B;
pub const LIGHTSPEED: f64 = 299_792_458.0;
pub const EARTH_ROTATION_RATE: f64 = 7.292_115_146_7e-5;

/// 3D ECEF vector, meters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Ecef {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Ecef {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Ecef { x, y, z }
    }

    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn dist(&self, o: &Ecef) -> f64 {
        ((self.x - o.x).powi(2) + (self.y - o.y).powi(2) + (self.z - o.z).powi(2)).sqrt()
    }

    /// Rotate about the Z axis by `angle` radians (Sagnac compensation).
    pub fn rot_z(&self, angle: f64) -> Ecef {
        let (sina, cosa) = angle.sin_cos();
        Ecef {
            x: cosa * self.x + sina * self.y,
            y: -sina * self.x + cosa * self.y,
            z: self.z,
        }
    }
}

/// Geodetic position: degrees, degrees, meters above the ellipsoid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Geodetic {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

/// ECEF → geodetic, single-pass Bowring approximation.
///
/// Sub-millimeter for the altitude band a sonde can reach; the round trip
/// with [`geodetic_to_ecef`] stays below 1e-3 m over [-500, 50000] m.
pub fn ecef_to_geodetic(pos: Ecef) -> Geodetic {
    let ea2 = EARTH_A2_B2 / (EARTH_A * EARTH_A);
    let eb2 = EARTH_A2_B2 / (EARTH_B * EARTH_B);

    let lam = pos.y.atan2(pos.x);
    let p = (pos.x * pos.x + pos.y * pos.y).sqrt();
    let t = (pos.z * EARTH_A).atan2(p * EARTH_B);
    let (sint, cost) = t.sin_cos();

    let phi = (pos.z + eb2 * EARTH_B * sint * sint * sint)
        .atan2(p - ea2 * EARTH_A * cost * cost * cost);

    let r = EARTH_A / (1.0 - ea2 * phi.sin() * phi.sin()).sqrt();
    let alt = p / phi.cos() - r;

    Geodetic {
        lat: phi.to_degrees(),
        lon: lam.to_degrees(),
        alt,
    }
}

/// Geodetic → ECEF (exact closed form).
pub fn geodetic_to_ecef(geo: Geodetic) -> Ecef {
    let ea2 = EARTH_A2_B2 / (EARTH_A * EARTH_A);
    let lat = geo.lat.to_radians();
    let lon = geo.lon.to_radians();
    let n = EARTH_A / (1.0 - ea2 * lat.sin() * lat.sin()).sqrt();
    Ecef {
        x: (n + geo.alt) * lat.cos() * lon.cos(),
        y: (n + geo.alt) * lat.cos() * lon.sin(),
        z: (n * (1.0 - ea2) + geo.alt) * lat.sin(),
    }
}

/// Motion over ground: horizontal speed, true heading, climb rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GroundTrack {
    /// Horizontal speed, m/s.
    pub vel_h: f64,
    /// Heading, degrees clockwise from north, [0, 360).
    pub heading: f64,
    /// Vertical speed, m/s, up positive.
    pub vel_v: f64,
}

/// Project an ECEF velocity onto the local NEU basis at `(lat, lon)` degrees
/// and reduce to speed / heading / climb.
pub fn ecef_vel_to_track(lat: f64, lon: f64, vel: [f64; 3]) -> GroundTrack {
    let phi = lat.to_radians();
    let lam = lon.to_radians();

    let vn = -vel[0] * phi.sin() * lam.cos() - vel[1] * phi.sin() * lam.sin() + vel[2] * phi.cos();
    let ve = -vel[0] * lam.sin() + vel[1] * lam.cos();
    let vu = vel[0] * phi.cos() * lam.cos() + vel[1] * phi.cos() * lam.sin() + vel[2] * phi.sin();

    track_from_neu(vn, ve, vu)
}

/// Speed / heading / climb from NEU velocity components.
pub fn track_from_neu(vn: f64, ve: f64, vu: f64) -> GroundTrack {
    let vel_h = (vn * vn + ve * ve).sqrt();
    let mut heading = ve.atan2(vn).to_degrees();
    if heading < 0.0 {
        heading += 360.0;
    }
    GroundTrack {
        vel_h,
        heading,
        vel_v: vu,
    }
}

// ── Telemetry record ──────────────────────────────────────────────────────────

/// One decoded frame, ready for text or JSON emission.
///
/// Fields whose verification failed (block CRC, fix plausibility) stay `None`
/// and are suppressed from output; the frame itself is still emitted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Telemetry {
    #[serde(rename = "type")]
    pub sonde: String,
    pub frame: u32,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datetime: Option<GpsDateTime>,
    #[serde(skip)]
    pub week: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos: Option<Geodetic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<GroundTrack>,
    /// Temperature, °C.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp: Option<f64>,
    /// Relative humidity, %.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    /// Pressure, hPa.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    /// Satellites used for the fix (RS41: receiver-reported count).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sats: Option<u32>,
    /// Subtype string, e.g. "RS41-SG" or "DFM09".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Transmit frequency in kHz from the calibration block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq: Option<u32>,
    /// Per-block CRC failure bitmap (bit set = block failed).
    pub crc: u32,
    /// Corrected byte count, or the negative failure code of the ECC pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ecc: Option<i32>,
    /// Auxiliary xdata payload, printable ASCII, `#`-joined sub-blocks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xdata: Option<String>,
}

impl Telemetry {
    pub fn new(kind: SondeKind) -> Self {
        Telemetry {
            sonde: kind.as_str().to_string(),
            ..Default::default()
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gps_epoch_is_1980_01_06() {
        let dt = GpsDateTime::from_gps(0, 0);
        assert_eq!((dt.year, dt.month, dt.day), (1980, 1, 6));
        assert_eq!(dt.wday, 0);
        assert_eq!(dt.weekday(), "Sun");
    }

    #[test]
    fn gps_date_vectors() {
        let dt = GpsDateTime::from_gps(2000, (3 * 86_400 + 5) * 1000);
        assert_eq!((dt.year, dt.month, dt.day), (2018, 5, 9));
        assert_eq!((dt.hour, dt.min), (0, 0));
        assert!((dt.sec - 5.0).abs() < 1e-9);

        let dt = GpsDateTime::from_gps(1999, 259_200_000);
        assert_eq!((dt.year, dt.month, dt.day), (2018, 5, 2));

        let dt = GpsDateTime::from_gps(2086, 199_800_000);
        assert_eq!((dt.year, dt.month, dt.day), (2019, 12, 31));
        assert_eq!(dt.weekday(), "Tue");
    }

    #[test]
    fn civil_date_weekday() {
        assert_eq!(GpsDateTime::from_civil(1980, 1, 6, 0, 0, 0.0).wday, 0); // Sunday
        assert_eq!(GpsDateTime::from_civil(2018, 5, 2, 12, 0, 0.0).weekday(), "Wed");
        assert_eq!(GpsDateTime::from_civil(2019, 12, 31, 0, 0, 0.0).weekday(), "Tue");
    }

    #[test]
    fn iso8601_keeps_milliseconds() {
        let dt = GpsDateTime::from_gps(2000, 3 * 86_400 * 1000 + 5432);
        assert_eq!(dt.iso8601(), "2018-05-09T00:00:05.432Z");
    }

    #[test]
    fn ecef_geodetic_round_trip() {
        for lat in (-89..=89).step_by(7) {
            for lon in (-179..=179).step_by(23) {
                for alt in [-500.0, 0.0, 1234.5, 12_000.0, 35_000.0, 50_000.0] {
                    let geo = Geodetic {
                        lat: lat as f64,
                        lon: lon as f64,
                        alt,
                    };
                    let back = ecef_to_geodetic(geodetic_to_ecef(geo));
                    // Bowring single pass: measured well below 1e-3 m.
                    assert!(
                        (back.lat - geo.lat).abs() * 6.4e6 < 1e-3,
                        "lat {} {} {}",
                        lat,
                        lon,
                        alt
                    );
                    assert!((back.lon - geo.lon).abs() * 6.4e6 < 1e-3);
                    assert!((back.alt - geo.alt).abs() < 1e-3);
                }
            }
        }
    }

    #[test]
    fn track_heading_quadrants() {
        // due north
        let t = track_from_neu(10.0, 0.0, 1.0);
        assert!((t.heading - 0.0).abs() < 1e-9);
        assert!((t.vel_h - 10.0).abs() < 1e-9);
        // due east
        let t = track_from_neu(0.0, 10.0, 0.0);
        assert!((t.heading - 90.0).abs() < 1e-9);
        // south-west keeps heading in [0, 360)
        let t = track_from_neu(-1.0, -1.0, 0.0);
        assert!(t.heading > 180.0 && t.heading < 270.0);
    }

    #[test]
    fn rot_z_small_angle() {
        let p = Ecef::new(20_000_000.0, 0.0, 1_000_000.0);
        let r = p.rot_z(EARTH_ROTATION_RATE * 0.072);
        // ~105 m of eastward rotation at GPS orbit radius
        assert!((r.y + p.x * (EARTH_ROTATION_RATE * 0.072)).abs() < 1.0);
        assert_eq!(r.z, p.z);
        assert!((r.norm() - p.norm()).abs() < 1e-6);
    }
}
