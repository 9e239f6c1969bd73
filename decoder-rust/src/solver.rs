//! solver.rs — single-point GNSS position/velocity from raw pseudoranges.
//!
//! Bancroft's closed form seeds the fix (Lorentzian inner-product quadratic
//! over the N×4 range matrix), one linearized least-squares step refines
//! it, GDOP from trace((AᵀA)⁻¹) gates it, and a leave-one-out pass ejects a
//! single bad SV when the refinement step is implausibly large. Velocity
//! comes either from a pseudorate linear solve or from 1-second differenced
//! positions.

use crate::ephemeris::{Sat, RANGE_ESTIMATE};
use sonde_types::{ecef_to_geodetic, Ecef, Geodetic, EARTH_ROTATION_RATE, LIGHTSPEED};
use tracing::debug;

pub const MAX_SATS: usize = 12;

#[derive(Debug, Clone, Copy)]
pub struct SolverOpts {
    pub dop_limit: f64,
    /// Reject/eject threshold on the refinement step length, meters.
    pub d_err: f64,
    /// Apply the refinement step to the emitted position.
    pub iterate: bool,
}

impl Default for SolverOpts {
    fn default() -> Self {
        SolverOpts {
            dop_limit: 9.9,
            d_err: 10_000.0,
            iterate: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Fix {
    pub ecef: Ecef,
    pub geo: Geodetic,
    pub clock_bias: f64,
    pub gdop: f64,
    /// Length of the linear refinement step.
    pub diter: f64,
    pub sats_used: usize,
    /// Index of an ejected outlier SV, if any.
    pub ejected: Option<usize>,
}

fn lorentz(a: [f64; 4], b: [f64; 4]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2] - a[3] * b[3]
}

/// 4×4 inverse by cofactors; `None` when the determinant collapses.
pub fn invert4(m: [[f64; 4]; 4]) -> Option<[[f64; 4]; 4]> {
    let d2 = |r0: usize, r1: usize, c0: usize, c1: usize| {
        m[r0][c0] * m[r1][c1] - m[r0][c1] * m[r1][c0]
    };

    // cofactor expansion along rows 2,3 then 0,1
    let s0 = d2(0, 1, 0, 1);
    let s1 = d2(0, 1, 0, 2);
    let s2 = d2(0, 1, 0, 3);
    let s3 = d2(0, 1, 1, 2);
    let s4 = d2(0, 1, 1, 3);
    let s5 = d2(0, 1, 2, 3);
    let c5 = d2(2, 3, 2, 3);
    let c4 = d2(2, 3, 1, 3);
    let c3 = d2(2, 3, 1, 2);
    let c2 = d2(2, 3, 0, 3);
    let c1 = d2(2, 3, 0, 2);
    let c0 = d2(2, 3, 0, 1);

    let det = s0 * c5 - s1 * c4 + s2 * c3 + s3 * c2 - s4 * c1 + s5 * c0;
    if det.abs() < 1e-4 {
        return None;
    }
    let id = 1.0 / det;

    let mut inv = [[0.0f64; 4]; 4];
    inv[0][0] = (m[1][1] * c5 - m[1][2] * c4 + m[1][3] * c3) * id;
    inv[0][1] = (-m[0][1] * c5 + m[0][2] * c4 - m[0][3] * c3) * id;
    inv[0][2] = (m[3][1] * s5 - m[3][2] * s4 + m[3][3] * s3) * id;
    inv[0][3] = (-m[2][1] * s5 + m[2][2] * s4 - m[2][3] * s3) * id;
    inv[1][0] = (-m[1][0] * c5 + m[1][2] * c2 - m[1][3] * c1) * id;
    inv[1][1] = (m[0][0] * c5 - m[0][2] * c2 + m[0][3] * c1) * id;
    inv[1][2] = (-m[3][0] * s5 + m[3][2] * s2 - m[3][3] * s1) * id;
    inv[1][3] = (m[2][0] * s5 - m[2][2] * s2 + m[2][3] * s1) * id;
    inv[2][0] = (m[1][0] * c4 - m[1][1] * c2 + m[1][3] * c0) * id;
    inv[2][1] = (-m[0][0] * c4 + m[0][1] * c2 - m[0][3] * c0) * id;
    inv[2][2] = (m[3][0] * s4 - m[3][1] * s2 + m[3][3] * s0) * id;
    inv[2][3] = (-m[2][0] * s4 + m[2][1] * s2 - m[2][3] * s0) * id;
    inv[3][0] = (-m[1][0] * c3 + m[1][1] * c1 - m[1][2] * c0) * id;
    inv[3][1] = (m[0][0] * c3 - m[0][1] * c1 + m[0][2] * c0) * id;
    inv[3][2] = (-m[3][0] * s3 + m[3][1] * s1 - m[3][2] * s0) * id;
    inv[3][3] = (m[2][0] * s3 - m[2][1] * s1 + m[2][2] * s0) * id;

    Some(inv)
}

/// `(BᵀB)⁻¹Bᵀ` for N ≥ 4 (direct inverse at N = 4).
fn pseudo_inverse(b: &[[f64; 4]]) -> Option<Vec<[f64; 4]>> {
    let n = b.len();
    if n == 4 {
        let m = [b[0], b[1], b[2], b[3]];
        let inv = invert4(m)?;
        // stored per satellite: out[j][i] = (B⁻¹)[i][j]
        let mut out = vec![[0.0; 4]; 4];
        for (j, row) in out.iter_mut().enumerate() {
            for (i, v) in row.iter_mut().enumerate() {
                *v = inv[i][j];
            }
        }
        return Some(out);
    }

    let mut btb = [[0.0f64; 4]; 4];
    for (i, row_i) in btb.iter_mut().enumerate() {
        for (j, v) in row_i.iter_mut().enumerate() {
            *v = b.iter().map(|r| r[i] * r[j]).sum();
        }
    }
    let bbinv = invert4(btb)?;
    let mut out = vec![[0.0f64; 4]; n];
    for (j, bj) in b.iter().enumerate() {
        for i in 0..4 {
            out[j][i] = (0..4).map(|k| bbinv[i][k] * bj[k]).sum();
        }
    }
    Some(out)
}

/// Multiply the (4×N) pseudoinverse (stored N rows of 4) by a length-N vector.
fn apply_pinv(pinv: &[[f64; 4]], v: &[f64]) -> [f64; 4] {
    let mut out = [0.0f64; 4];
    for (row, &vi) in pinv.iter().zip(v.iter()) {
        for (o, &r) in out.iter_mut().zip(row.iter()) {
            *o += r * vi;
        }
    }
    out
}

/// Bancroft closed-form position: returns ECEF and receiver clock bias [m].
/// Satellite positions are Sagnac-rotated by ω·τ before solving.
pub fn bancroft(sats: &[Sat]) -> Option<(Ecef, f64)> {
    let n = sats.len();
    if !(4..=MAX_SATS).contains(&n) {
        return None;
    }

    let mut b = Vec::with_capacity(n);
    for s in sats {
        let p = s.pos.rot_z(EARTH_ROTATION_RATE * RANGE_ESTIMATE);
        b.push([p.x, p.y, p.z, s.pr]);
    }

    let pinv = pseudo_inverse(&b)?;

    let ones = vec![1.0f64; n];
    let be = apply_pinv(&pinv, &ones);
    let a: Vec<f64> = b.iter().map(|r| 0.5 * lorentz(*r, *r)).collect();
    let ba = apply_pinv(&pinv, &a);

    let q2 = lorentz(be, be);
    let q1 = lorentz(ba, be) - 1.0;
    let q0 = lorentz(ba, ba);
    if q2 == 0.0 {
        return None;
    }

    let p = q1 / q2;
    let q = q0 / q2;
    let sq = p * p - q;
    if sq < 0.0 {
        return None;
    }

    let x1 = -p + sq.sqrt();
    let x2 = -p - sq.sqrt();

    let mut sol1 = [0.0f64; 4];
    let mut sol2 = [0.0f64; 4];
    for i in 0..4 {
        sol1[i] = x1 * be[i] + ba[i];
        sol2[i] = x2 * be[i] + ba[i];
    }
    sol1[3] = -sol1[3];
    sol2[3] = -sol2[3];

    // the root whose radius lands near the Earth's surface is the receiver
    let r1 = (sol1[0] * sol1[0] + sol1[1] * sol1[1] + sol1[2] * sol1[2]).sqrt();
    let r2 = (sol2[0] * sol2[0] + sol2[1] * sol2[1] + sol2[2] * sol2[2]).sqrt();
    let (sol, cc) = if (r1 - 6_371_000.0).abs() < (r2 - 6_371_000.0).abs() {
        (sol1, sol1[3])
    } else {
        (sol2, sol2[3])
    };

    Some((Ecef::new(sol[0], sol[1], sol[2]), cc))
}

/// Unit line-of-sight matrix rows for the refinement and DOP steps.
fn los_rows(sats: &[Sat], pos: Ecef, range_rotate: bool) -> (Vec<[f64; 4]>, Vec<f64>) {
    let mut rows = Vec::with_capacity(sats.len());
    let mut norms = Vec::with_capacity(sats.len());
    for s in sats {
        let sp = if range_rotate {
            // per-satellite travel time, clamped to the plausible window
            let mut range = pos.dist(&s.pos) / LIGHTSPEED;
            if !(0.06..=0.1).contains(&range) {
                range = RANGE_ESTIMATE;
            }
            s.pos.rot_z(EARTH_ROTATION_RATE * range)
        } else {
            s.pos.rot_z(EARTH_ROTATION_RATE * RANGE_ESTIMATE)
        };
        let d = Ecef::new(sp.x - pos.x, sp.y - pos.y, sp.z - pos.z);
        let norm = d.norm();
        rows.push([d.x / norm, d.y / norm, d.z / norm, 1.0]);
        norms.push(norm);
    }
    (rows, norms)
}

/// One linearized position step: residuals against the predicted ranges,
/// solved through the pseudoinverse. Returns `(dpos, clock)` or `None` on a
/// degenerate geometry.
pub fn lin_pos(sats: &[Sat], pos: Ecef, dt: f64) -> Option<([f64; 3], f64)> {
    let n = sats.len();
    if !(4..=MAX_SATS).contains(&n) {
        return None;
    }
    let (rows, norms) = los_rows(sats, pos, true);
    let pinv = pseudo_inverse(&rows)?;

    let resid: Vec<f64> = sats
        .iter()
        .zip(norms.iter())
        .map(|(s, &norm)| (norm - dt) - s.pr)
        .collect();

    let ba = apply_pinv(&pinv, &resid);
    Some(([ba[0], ba[1], ba[2]], ba[3]))
}

/// Velocity solve from pseudorate observations at a known position.
pub fn lin_vel(sats: &[Sat], pos: Ecef, vel: [f64; 3], dt: f64) -> Option<([f64; 3], f64)> {
    let n = sats.len();
    if !(4..=MAX_SATS).contains(&n) {
        return None;
    }
    let (rows, _) = los_rows(sats, pos, false);
    let pinv = pseudo_inverse(&rows)?;

    let resid: Vec<f64> = sats
        .iter()
        .map(|s| {
            // relative velocity projected on the line of sight
            let d = Ecef::new(s.pos.x - pos.x, s.pos.y - pos.y, s.pos.z - pos.z);
            let norm = d.norm();
            let v_proj = (s.vel[0] - vel[0]) * d.x / norm
                + (s.vel[1] - vel[1]) * d.y / norm
                + (s.vel[2] - vel[2]) * d.z / norm;
            (v_proj - dt) - s.pseudorate
        })
        .collect();

    let ba = apply_pinv(&pinv, &resid);
    Some(([ba[0], ba[1], ba[2]], ba[3]))
}

/// GDOP etc. from the diagonal of `(AᵀA)⁻¹`.
pub fn dop(sats: &[Sat], pos: Ecef) -> Option<[f64; 4]> {
    let mut rows = Vec::with_capacity(sats.len());
    for s in sats {
        let d = Ecef::new(s.pos.x - pos.x, s.pos.y - pos.y, s.pos.z - pos.z);
        let norm = d.norm();
        rows.push([d.x / norm, d.y / norm, d.z / norm, 1.0]);
    }
    let mut ata = [[0.0f64; 4]; 4];
    for (i, row_i) in ata.iter_mut().enumerate() {
        for (j, v) in row_i.iter_mut().enumerate() {
            *v = rows.iter().map(|r| r[i] * r[j]).sum();
        }
    }
    let inv = invert4(ata)?;
    Some([inv[0][0], inv[1][1], inv[2][2], inv[3][3]])
}

/// Full position solve: Bancroft, refinement, DOP, leave-one-out ejection.
/// `sats` is shrunk in place when an outlier is dropped.
pub fn solve_position(sats: &mut Vec<Sat>, opts: &SolverOpts) -> Option<Fix> {
    let n = sats.len();
    if !(4..=MAX_SATS).contains(&n) {
        return None;
    }

    let (mut pos, mut cc) = bancroft(sats)?;
    let mut gdop = dop(sats, pos)
        .map(|d| (d[0] + d[1] + d[2] + d[3]).sqrt())
        .unwrap_or(-1.0);

    let (dpos, cc1) = lin_pos(sats, pos, cc)?;
    let mut diter = (dpos[0] * dpos[0] + dpos[1] * dpos[1] + dpos[2] * dpos[2]).sqrt();
    if opts.iterate {
        pos = Ecef::new(pos.x + dpos[0], pos.y + dpos[1], pos.z + dpos[2]);
        cc = cc1;
    }

    let mut ejected = None;
    if diter > opts.d_err && sats.len() > 5 {
        // leave-one-out: keep the subset with the smallest refinement step
        let mut best: Option<(usize, Ecef, f64, f64)> = None;
        for drop in 0..sats.len() {
            let subset: Vec<Sat> = sats
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != drop)
                .map(|(_, s)| *s)
                .collect();
            let Some((p0, c0)) = bancroft(&subset) else {
                continue;
            };
            let Some((dp, c1)) = lin_pos(&subset, p0, c0) else {
                continue;
            };
            let d = (dp[0] * dp[0] + dp[1] * dp[1] + dp[2] * dp[2]).sqrt();
            if d < diter && best.map(|(_, _, _, bd)| d < bd).unwrap_or(true) {
                let p1 = Ecef::new(p0.x + dp[0], p0.y + dp[1], p0.z + dp[2]);
                best = Some((drop, if opts.iterate { p1 } else { p0 }, c1, d));
            }
        }
        if let Some((drop, p, c, d)) = best {
            debug!(drop, d, "ejected outlier sv");
            pos = p;
            cc = c;
            diter = d;
            ejected = Some(drop);
            sats.remove(drop);
            gdop = dop(sats, pos)
                .map(|dd| (dd[0] + dd[1] + dd[2] + dd[3]).sqrt())
                .unwrap_or(gdop);
        }
    }

    let geo = ecef_to_geodetic(pos);
    Some(Fix {
        ecef: pos,
        geo,
        clock_bias: cc,
        gdop,
        diter,
        sats_used: sats.len(),
        ejected,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sonde_types::geodetic_to_ecef;

    /// Satellites on a 26559 km shell above a receiver, with noise-free
    /// pseudoranges measured in the Sagnac-consistent frame.
    fn constellation(rx: Ecef, bias: f64, n: usize) -> Vec<Sat> {
        let r_orbit = 26_559_000.0f64;
        let dirs = [
            (0.0f64, 0.0f64),
            (40.0, 60.0),
            (50.0, 180.0),
            (35.0, 280.0),
            (70.0, 120.0),
            (20.0, 20.0),
            (60.0, 220.0),
            (45.0, 330.0),
        ];
        dirs.iter()
            .take(n)
            .enumerate()
            .map(|(i, &(el, az))| {
                let (el, az) = (el.to_radians(), az.to_radians());
                // crude shell point in the receiver's sky
                let up = Ecef::new(rx.x, rx.y, rx.z);
                let un = up.norm();
                let u = Ecef::new(up.x / un, up.y / un, up.z / un);
                // tangent basis
                let e = Ecef::new(-u.y, u.x, 0.0);
                let en = e.norm().max(1e-9);
                let e = Ecef::new(e.x / en, e.y / en, e.z / en);
                let nn = Ecef::new(
                    u.y * e.z - u.z * e.y,
                    u.z * e.x - u.x * e.z,
                    u.x * e.y - u.y * e.x,
                );
                let dir = Ecef::new(
                    el.sin() * u.x + el.cos() * (az.cos() * nn.x + az.sin() * e.x),
                    el.sin() * u.y + el.cos() * (az.cos() * nn.y + az.sin() * e.y),
                    el.sin() * u.z + el.cos() * (az.cos() * nn.z + az.sin() * e.z),
                );
                // push out to the orbit shell
                let mut t = r_orbit * 0.6;
                for _ in 0..40 {
                    let p = Ecef::new(rx.x + dir.x * t, rx.y + dir.y * t, rx.z + dir.z * t);
                    t += r_orbit - p.norm();
                }
                let sat_pos = Ecef::new(rx.x + dir.x * t, rx.y + dir.y * t, rx.z + dir.z * t);
                // the solver rotates by omega*tau, so ranges are measured
                // against the rotated position
                let rot = sat_pos.rot_z(EARTH_ROTATION_RATE * RANGE_ESTIMATE);
                let pr = rot.dist(&rx) + bias;
                Sat {
                    prn: i as u8 + 1,
                    pos: sat_pos,
                    pr,
                    pseudorange: pr,
                    ..Default::default()
                }
            })
            .collect()
    }

    fn receiver() -> Ecef {
        geodetic_to_ecef(Geodetic {
            lat: 47.1,
            lon: 15.5,
            alt: 18_000.0,
        })
    }

    #[test]
    fn invert4_identity() {
        let m = [
            [4.0, 1.0, 0.5, -2.0],
            [1.0, 3.0, -1.0, 0.0],
            [0.5, -1.0, 5.0, 1.5],
            [-2.0, 0.0, 1.5, 6.0],
        ];
        let inv = invert4(m).unwrap();
        for i in 0..4 {
            for j in 0..4 {
                let v: f64 = (0..4).map(|k| m[i][k] * inv[k][j]).sum();
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!((v - expect).abs() < 1e-12, "({i},{j}) = {v}");
            }
        }
        // singular matrix collapses
        let s = [[1.0; 4]; 4];
        assert!(invert4(s).is_none());
    }

    #[test]
    fn bancroft_recovers_position_and_clock_with_four_sats() {
        let rx = receiver();
        let bias = 1234.5;
        let sats = constellation(rx, bias, 4);
        let (pos, cc) = bancroft(&sats).expect("solvable");
        assert!(pos.dist(&rx) < 1e-3, "pos error {}", pos.dist(&rx));
        assert!((cc - bias).abs() < 1e-3, "clock error {}", cc - bias);
    }

    #[test]
    fn overdetermined_solve_matches_truth() {
        let rx = receiver();
        let sats = constellation(rx, -2500.0, 8);
        let mut sats = sats;
        let fix = solve_position(&mut sats, &SolverOpts::default()).expect("fix");
        assert!(fix.ecef.dist(&rx) < 1e-2, "err {}", fix.ecef.dist(&rx));
        assert!((fix.geo.alt - 18_000.0).abs() < 0.1);
        assert!(fix.gdop > 0.0 && fix.gdop < 10.0, "gdop {}", fix.gdop);
        assert!(fix.diter < 1.0);
        assert!(fix.ejected.is_none());
    }

    #[test]
    fn single_bad_pseudorange_is_ejected() {
        let rx = receiver();
        let mut sats = constellation(rx, 0.0, 8);
        sats[3].pr += 300_000.0; // implicated SV

        let opts = SolverOpts {
            d_err: 100.0,
            ..Default::default()
        };
        let fix = solve_position(&mut sats, &opts).expect("fix");
        assert_eq!(fix.ejected, Some(3));
        assert_eq!(fix.sats_used, 7);
        assert!(fix.ecef.dist(&rx) < 1.0, "err {}", fix.ecef.dist(&rx));
    }

    #[test]
    fn dop_shrinks_with_more_satellites() {
        let rx = receiver();
        let s4 = constellation(rx, 0.0, 4);
        let s8 = constellation(rx, 0.0, 8);
        let g4 = dop(&s4, rx).map(|d| (d[0] + d[1] + d[2] + d[3]).sqrt()).unwrap();
        let g8 = dop(&s8, rx).map(|d| (d[0] + d[1] + d[2] + d[3]).sqrt()).unwrap();
        assert!(g8 < g4, "gdop {g8} !< {g4}");
    }

    #[test]
    fn velocity_solve_recovers_receiver_motion() {
        let rx = receiver();
        let v_rx = [12.0, -7.0, 3.5];
        let mut sats = constellation(rx, 0.0, 6);
        for s in sats.iter_mut() {
            // satellite at rest: observed rate is the negated projection of
            // receiver motion on the line of sight
            let d = Ecef::new(s.pos.x - rx.x, s.pos.y - rx.y, s.pos.z - rx.z);
            let norm = d.norm();
            s.pseudorate =
                -(v_rx[0] * d.x + v_rx[1] * d.y + v_rx[2] * d.z) / norm;
            s.vel = [0.0; 3];
        }
        let (dv, _cc) = lin_vel(&sats, rx, [0.0; 3], 0.0).expect("solvable");
        for k in 0..3 {
            assert!((dv[k] - v_rx[k]).abs() < 0.2, "axis {k}: {} vs {}", dv[k], v_rx[k]);
        }
    }

    #[test]
    fn underdetermined_sets_are_rejected() {
        let rx = receiver();
        let mut sats = constellation(rx, 0.0, 3);
        assert!(bancroft(&sats).is_none());
        assert!(solve_position(&mut sats, &SolverOpts::default()).is_none());
    }
}
