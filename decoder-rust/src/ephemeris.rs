//! ephemeris.rs — GPS satellite state from broadcast Keplerian elements.
//!
//! Clock polynomial plus relativistic term, Kepler solve by fixed-point
//! iteration, second-harmonic orbit corrections, and the velocity form from
//! the differentiated elements. Angles in radians, positions in WGS84 ECEF
//! meters, clock corrections in meters.

use sonde_types::{Ecef, EARTH_ROTATION_RATE, LIGHTSPEED, SECONDS_IN_WEEK};

pub const GRAVITY_CONSTANT: f64 = 3.986005e14;
/// Combined relativistic constant from IS-GPS-200, [s]/[sqrt(m)].
pub const RELATIVISTIC_CLOCK: f64 = -4.442807633e-10;
/// Approximate signal travel time used for the Sagnac pre-rotation.
pub const RANGE_ESTIMATE: f64 = 0.072;

/// Broadcast orbit + clock for one SV. Immutable once loaded from an
/// almanac or navigation file.
#[derive(Debug, Clone, Default)]
pub struct Ephemeris {
    pub prn: u16,
    pub week: i32,
    /// Full GPS week as given by the source (RINEX); SEM needs the epoch
    /// offset applied downstream.
    pub gpsweek: i32,
    pub toa: u32,
    pub toe: f64,
    pub toc: f64,
    pub e: f64,
    pub delta_n: f64,
    pub i0: f64,
    pub omega_dot: f64,
    pub sqrta: f64,
    pub omega0: f64,
    pub w: f64,
    pub m0: f64,
    pub tgd: f64,
    pub idot: f64,
    pub cuc: f64,
    pub cus: f64,
    pub crc: f64,
    pub crs: f64,
    pub cic: f64,
    pub cis: f64,
    pub af0: f64,
    pub af1: f64,
    pub af2: f64,
    pub svn: u16,
    pub ura: u8,
    pub health: u8,
}

/// Derived per-SV state for one measurement epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sat {
    pub prn: u8,
    pub pos: Ecef,
    pub vel: [f64; 3],
    /// Clock correction, meters.
    pub clock_corr: f64,
    /// Clock drift, meters/second.
    pub clock_drift: f64,
    pub pseudorange: f64,
    pub pseudorate: f64,
    /// Offset-restored pseudorange used by the solver.
    pub pr: f64,
}

/// Kepler's equation M = E - e·sin E by fixed-point iteration; the map
/// E -> M + e·sin E contracts for e < 1.
fn kepler_e(m: f64, ecc: f64) -> f64 {
    let mut e = m;
    for _ in 0..7 {
        e = m + ecc * e.sin();
    }
    e
}

impl Ephemeris {
    /// Clock correction [m] and drift [m/s] at transmission time.
    pub fn clock_correction(&self, week: i32, tow: f64) -> (f64, f64) {
        let tot = week as f64 * SECONDS_IN_WEEK + tow;
        let tk = tot - (self.week as f64 * SECONDS_IN_WEEK + self.toe);
        let tc = tot - (self.week as f64 * SECONDS_IN_WEEK + self.toc);

        let a = self.sqrta * self.sqrta;
        let n = (GRAVITY_CONSTANT / (a * a * a)).sqrt() + self.delta_n;
        let e_anom = kepler_e(self.m0 + n * tk, self.e);

        let d_tr = RELATIVISTIC_CLOCK * self.e * self.sqrta * e_anom.sin() * LIGHTSPEED;
        let d_tsv = self.af0 + self.af1 * tc + self.af2 * tc * tc - self.tgd;
        let drift = (self.af1 + 2.0 * self.af2 * tc) * LIGHTSPEED;

        (d_tsv * LIGHTSPEED + d_tr, drift)
    }

    fn orbit_state(&self, week: i32, tow: f64) -> (Ecef, [f64; 3]) {
        let tot = week as f64 * SECONDS_IN_WEEK + tow;
        let tk = tot - (self.week as f64 * SECONDS_IN_WEEK + self.toe);

        let a = self.sqrta * self.sqrta;
        let n = (GRAVITY_CONSTANT / (a * a * a)).sqrt() + self.delta_n;
        let e_anom = kepler_e(self.m0 + n * tk, self.e);
        let (sin_e, cos_e) = e_anom.sin_cos();

        // true anomaly and argument of latitude
        let v = ((1.0 - self.e * self.e).sqrt() * sin_e).atan2(cos_e - self.e);
        let mut u = v + self.w;
        let mut r = a * (1.0 - self.e * cos_e);
        let mut i = self.i0;

        let (sin2u, cos2u) = (2.0 * u).sin_cos();
        u += self.cuc * cos2u + self.cus * sin2u;
        r += self.crc * cos2u + self.crs * sin2u;
        i += self.cic * cos2u + self.cis * sin2u + self.idot * tk;

        let (sinu, cosu) = u.sin_cos();
        let x_op = r * cosu;
        let y_op = r * sinu;

        let omegak = self.omega0 + self.omega_dot * tk - EARTH_ROTATION_RATE * (tk + self.toe);
        let (sin_om, cos_om) = omegak.sin_cos();
        let (sini, cosi) = i.sin_cos();

        let pos = Ecef::new(
            x_op * cos_om - y_op * sin_om * cosi,
            x_op * sin_om + y_op * cos_om * cosi,
            y_op * sini,
        );

        // velocity terms, cf. Remondi's broadcast-ephemeris formulation
        let (sin2u, cos2u) = (2.0 * u).sin_cos();
        let edot = n / (1.0 - self.e * cos_e);
        let vdot = sin_e * edot * (1.0 + self.e * v.cos()) / (v.sin() * (1.0 - self.e * cos_e));
        let udot = vdot + 2.0 * (self.cus * cos2u - self.cuc * sin2u) * vdot;
        let rdot = a * self.e * sin_e * n / (1.0 - self.e * cos_e)
            + 2.0 * (self.crs * cos2u - self.crc * sin2u) * vdot;
        let idotdot = self.idot + (self.cis * cos2u - self.cic * sin2u) * 2.0 * vdot;

        let vx_op = rdot * cosu - y_op * udot;
        let vy_op = rdot * sinu + x_op * udot;
        let omegadotk = self.omega_dot - EARTH_ROTATION_RATE;

        let tmpa = vx_op - y_op * cosi * omegadotk;
        let tmpb = x_op * omegadotk + vy_op * cosi - y_op * sini * idotdot;

        let vel = [
            tmpa * cos_om - tmpb * sin_om,
            tmpa * sin_om + tmpb * cos_om,
            vy_op * sini + y_op * cosi * idotdot,
        ];

        (pos, vel)
    }

    /// ECEF position and clock correction at transmission time, with the
    /// week-rollover adjustment applied after the clock solve.
    pub fn satellite_position(&self, week: i32, tow: f64) -> (Ecef, f64) {
        let (clk, _) = self.clock_correction(week, tow);
        let (week, tow) = rollover(week, tow + clk / LIGHTSPEED);
        let (pos, _) = self.orbit_state(week, tow);
        (pos, clk)
    }

    /// Position, velocity, clock correction, clock drift.
    pub fn satellite_position_velocity(&self, week: i32, tow: f64) -> (Ecef, [f64; 3], f64, f64) {
        let (clk, drift) = self.clock_correction(week, tow);
        let (week, tow) = rollover(week, tow + clk / LIGHTSPEED);
        let (pos, vel) = self.orbit_state(week, tow);
        (pos, vel, clk, drift)
    }
}

fn rollover(mut week: i32, mut tow: f64) -> (i32, f64) {
    if tow < 0.0 {
        tow += SECONDS_IN_WEEK;
        week -= 1;
    }
    if tow > SECONDS_IN_WEEK {
        tow -= SECONDS_IN_WEEK;
        week += 1;
    }
    (week, tow)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circularish() -> Ephemeris {
        Ephemeris {
            prn: 7,
            week: 1,
            toe: 302_400.0,
            toc: 302_400.0,
            e: 0.01,
            sqrta: 5153.7,
            i0: 0.96,
            omega0: 1.2,
            w: 0.4,
            m0: -2.2,
            af0: 1e-5,
            ..Default::default()
        }
    }

    #[test]
    fn kepler_fixed_point_converges_for_small_e() {
        for &m in &[0.0, 0.5, 2.0, -1.3] {
            for &ecc in &[0.001, 0.01, 0.02] {
                let e = kepler_e(m, ecc);
                assert!((e - ecc * e.sin() - m).abs() < 1e-9, "m={m} e={ecc}");
            }
        }
    }

    #[test]
    fn orbit_radius_is_near_semi_major_axis() {
        let eph = circularish();
        let (pos, clk) = eph.satellite_position(1, 302_400.0);
        let a = eph.sqrta * eph.sqrta;
        assert!((pos.norm() - a).abs() < a * 0.02, "r {} a {a}", pos.norm());
        // af0-dominated clock: 1e-5 s ~ 3 km
        assert!((clk - 1e-5 * LIGHTSPEED).abs() < 100.0);
    }

    #[test]
    fn velocity_is_orbital_speed_minus_earth_rotation() {
        let eph = circularish();
        let (pos, vel, _, _) = eph.satellite_position_velocity(1, 302_000.0);
        let speed = (vel[0] * vel[0] + vel[1] * vel[1] + vel[2] * vel[2]).sqrt();
        // ECEF-frame GPS orbital speed is ~3.9 km/s give or take the frame
        // rotation at orbit radius (~1.9 km/s worst case)
        assert!(
            (2_000.0..6_000.0).contains(&speed),
            "implausible speed {speed}"
        );
        // finite-difference cross-check in the same (ECEF) frame
        let dt = 0.5;
        let (p2, _) = eph.satellite_position(1, 302_000.0 + dt);
        let fd = [
            (p2.x - pos.x) / dt,
            (p2.y - pos.y) / dt,
            (p2.z - pos.z) / dt,
        ];
        for k in 0..3 {
            assert!((fd[k] - vel[k]).abs() < 5.0, "axis {k}: fd {} vel {}", fd[k], vel[k]);
        }
    }

    #[test]
    fn week_rollover_wraps_cleanly() {
        assert_eq!(rollover(10, -5.0).0, 9);
        assert_eq!(rollover(10, SECONDS_IN_WEEK + 5.0).0, 11);
        let (w, t) = rollover(10, 100.0);
        assert_eq!((w, t), (10, 100.0));
    }
}
