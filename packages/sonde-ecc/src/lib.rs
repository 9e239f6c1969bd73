//! # sonde-ecc
//!
//! Channel decoders for the radiosonde telemetry pipeline:
//!
//! - `gf` / `rs`: Galois-field tables and Reed–Solomon over GF(2^8), in the
//!   two parameterizations the sondes use — Vaisala RS(255,231) and CCSDS
//!   RS(255,223) — including erasure-and-error decoding
//! - `bch`: binary BCH(63,51) t=2 with the closed-form locator cross-check
//! - `viterbi`: rate-1/2 constraint-length-7 convolutional decoder, hard and
//!   soft metrics, plus the algebraic deconvolution of raw bit pairs
//! - `hamming`: Hamming(8,4) nibble decode with the DFM interleaving grid
//! - `crc`: CRC-16 (poly 0x1021) variants and the M10 additive checksum
//!
//! All decoders are plain values: tables are built once at construction and
//! read-only afterwards, so one instance can serve a whole decode run.

pub mod bch;
pub mod crc;
pub mod gf;
pub mod hamming;
pub mod rs;
pub mod viterbi;

pub use bch::Bch63;
pub use rs::{ReedSolomon, RsError};
pub use viterbi::Viterbi;
