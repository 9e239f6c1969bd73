//! main.rs — radiosonde telemetry decoder CLI.
//!
//! One binary, five decoder families. Input is WAV (or headerless PCM, or
//! float32 IQ through the FM discriminator), output is text lines or
//! line-delimited JSON on stdout; logs go to stderr.

mod almanac;
mod dfm;
mod dsp;
mod ephemeris;
mod framing;
mod iq;
mod lms6;
mod m10;
mod output;
mod rs41;
mod rs92;
mod solver;
mod wav;

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;

use output::OutputOpts;
use rs92::EphemerisSource;
use sonde_types::SondeKind;
use wav::{IqSource, RawPcmSource, SampleSource, WavSource};

// ── Decode options shared by the sonde modules ────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VelocityMode {
    #[default]
    None,
    /// Linear least squares over pseudorates.
    Lsq,
    /// 1-second differenced positions from the delta chips.
    Differenced,
    /// Pseudorate solve with a second clock-drift iteration.
    Doppler,
}

#[derive(Debug, Clone)]
pub struct DecodeOpts {
    pub thres: Option<f32>,
    /// 0 = off, 1 = single pass, 2 = two-pass repair.
    pub ecc: u8,
    pub invert: bool,
    /// Bit-sampling phase shift, ±4 samples.
    pub shift: i32,
    /// RS41 frame length override (`--std`).
    pub frame_len: Option<usize>,
    pub dc: bool,
    pub spike: bool,
    /// 0 = off, 1 = hard, 2 = soft (LMS6).
    pub vit: u8,
    /// Soft-bit clip level override (LMS6).
    pub level: Option<f32>,
    /// RS92-NGP (L-band) variant.
    pub ngp: bool,
    pub vel: VelocityMode,
    pub dop_limit: f64,
    pub d_err: Option<f64>,
    /// SV excluded from the solve.
    pub exsat: Option<u8>,
    pub output: OutputOpts,
}

impl Default for DecodeOpts {
    fn default() -> Self {
        DecodeOpts {
            thres: None,
            ecc: 0,
            invert: false,
            shift: 0,
            frame_len: None,
            dc: false,
            spike: false,
            vit: 0,
            level: None,
            ngp: false,
            vel: VelocityMode::None,
            dop_limit: 9.9,
            d_err: None,
            exsat: None,
            output: OutputOpts::default(),
        }
    }
}

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SondeArg {
    Rs41,
    Rs92,
    Dfm,
    M10,
    Lms6,
}

#[derive(Parser, Debug)]
#[command(
    name = "sonde-decoder",
    about = "Radiosonde telemetry decoder: RS41, RS92, DFM, M10, LMS6",
    version
)]
struct Args {
    /// Sonde family to decode
    #[arg(short = 't', long = "type", value_enum)]
    sonde: SondeArg,

    /// Input file (stdin when omitted)
    file: Option<PathBuf>,

    /// Emit line-delimited JSON (implies --ecc2 --crc)
    #[arg(long)]
    json: bool,

    /// Hex frame dump instead of decoded output
    #[arg(short, long)]
    raw: bool,

    /// Error correction (Reed-Solomon / Hamming)
    #[arg(long)]
    ecc: bool,

    /// Two-pass Reed-Solomon with block-constant repair (RS41)
    #[arg(long)]
    ecc2: bool,

    /// Show CRC/ECC status trailer
    #[arg(long)]
    crc: bool,

    /// Decode PTU (temperature etc.)
    #[arg(long)]
    ptu: bool,

    /// Increase verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Invert demodulator polarity
    #[arg(short = 'i', long)]
    invert: bool,

    /// Correlation peak threshold override
    #[arg(long)]
    ths: Option<f32>,

    /// Bit-sampling phase shift in samples (-4..=4)
    #[arg(short = 'd', long, allow_negative_numbers = true)]
    shift: Option<i32>,

    /// Use the right audio channel
    #[arg(long)]
    ch2: bool,

    /// RS41: fix the standard 320-byte frame length
    #[arg(long)]
    std: bool,

    /// RS92: velocity from pseudorates (linear least squares)
    #[arg(long)]
    vel: bool,

    /// RS92: velocity from 1-second differenced positions
    #[arg(long)]
    vel1: bool,

    /// RS92: pseudorate solve with clock-drift iteration
    #[arg(long)]
    vel2: bool,

    /// RS92: SEM almanac file
    #[arg(short = 'a', long)]
    almanac: Option<PathBuf>,

    /// RS92: RINEX navigation file
    #[arg(short = 'e', long)]
    ephem: Option<PathBuf>,

    /// RS92: SEM week-number epoch (1024-week rollovers)
    #[arg(long, default_value_t = 1)]
    gpsepoch: i32,

    /// GDOP limit for accepting a fix
    #[arg(long)]
    dop: Option<f64>,

    /// Residual limit in meters for accepting a fix
    #[arg(long)]
    der: Option<f64>,

    /// Exclude one SV from the solve
    #[arg(long)]
    exsat: Option<u8>,

    /// RS92-NGP (1680 MHz) variant
    #[arg(long)]
    ngp: bool,

    /// LMS6: hard-decision Viterbi
    #[arg(long)]
    vit: bool,

    /// LMS6: soft-decision Viterbi
    #[arg(long)]
    vit2: bool,

    /// Track DC offset through near-match headers
    #[arg(long)]
    dc: bool,

    /// Spike suppression in the bit slicer (RS92)
    #[arg(long)]
    spike: bool,

    /// LMS6: fixed soft-bit clip level
    #[arg(long)]
    level: Option<f32>,

    /// Headerless PCM input: sample rate
    #[arg(long)]
    pcm_rate: Option<u32>,

    /// Headerless PCM input: bits per sample (8 or 16)
    #[arg(long, default_value_t = 16)]
    pcm_bits: u16,

    /// Float32 IQ input: sample rate
    #[arg(long)]
    iq_rate: Option<u32>,

    /// IQ input: one-pole FM lowpass coefficient (0..1]
    #[arg(long, default_value_t = 1.0)]
    lowpass: f32,
}

fn kind_of(arg: SondeArg) -> SondeKind {
    match arg {
        SondeArg::Rs41 => SondeKind::Rs41,
        SondeArg::Rs92 => SondeKind::Rs92,
        SondeArg::Dfm => SondeKind::Dfm,
        SondeArg::M10 => SondeKind::M10,
        SondeArg::Lms6 => SondeKind::Lms6,
    }
}

/// Build the sample source chain and report the sample rate.
fn open_source(args: &Args) -> Result<(Box<dyn SampleSource>, u32)> {
    let reader: Box<dyn Read> = match &args.file {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("open {}", path.display()))?,
        )),
        None => Box::new(std::io::stdin().lock()),
    };
    let channel = if args.ch2 { 1 } else { 0 };

    if let Some(rate) = args.iq_rate {
        let baud = kind_of(args.sonde).baud();
        // spectral-offset window: one header length
        let hdr_samples = (64.0 * rate as f64 / baud) as usize;
        let src = iq::FmDemod::new(IqSource::new(reader, rate), hdr_samples, args.lowpass);
        return Ok((Box::new(src), rate));
    }
    if let Some(rate) = args.pcm_rate {
        let src = RawPcmSource::new(reader, rate, args.pcm_bits, if args.ch2 { 2 } else { 1 }, channel)?;
        return Ok((Box::new(src), rate));
    }

    let src = WavSource::open(reader, channel)?;
    let rate = src.sample_rate;
    Ok((Box::new(src), rate))
}

fn decode_opts(args: &Args) -> DecodeOpts {
    let mut ecc = if args.ecc2 {
        2
    } else if args.ecc {
        1
    } else {
        0
    };
    let mut crc = args.crc;
    let mut vel = if args.vel2 {
        VelocityMode::Doppler
    } else if args.vel1 {
        VelocityMode::Differenced
    } else if args.vel {
        VelocityMode::Lsq
    } else {
        VelocityMode::None
    };

    if args.json {
        // JSON consumers expect verified frames
        ecc = ecc.max(2);
        crc = true;
        if args.sonde == SondeArg::Rs92 && vel == VelocityMode::None {
            vel = VelocityMode::Lsq;
        }
    }
    // the RS92 chain always runs its single RS codeword
    if args.sonde == SondeArg::Rs92 && ecc == 0 {
        ecc = 1;
    }

    let crc_bits = match args.sonde {
        SondeArg::Rs41 => 5,
        SondeArg::Rs92 => 4,
        _ => 1,
    };

    DecodeOpts {
        thres: args.ths,
        ecc,
        invert: args.invert,
        shift: args.shift.unwrap_or(0).clamp(-4, 4),
        frame_len: args.std.then_some(320),
        dc: args.dc,
        spike: args.spike,
        vit: if args.vit2 {
            2
        } else if args.vit {
            1
        } else {
            0
        },
        level: args.level,
        ngp: args.ngp,
        vel,
        dop_limit: args.dop.filter(|d| (0.0..100.0).contains(d)).unwrap_or(9.9),
        d_err: args.der.filter(|d| (0.0..100_000.0).contains(d)),
        exsat: args.exsat.filter(|&s| (1..=32).contains(&s)),
        output: OutputOpts {
            json: args.json,
            crc,
            ecc,
            ptu: args.ptu,
            verbosity: args.verbose,
            raw: args.raw,
            crc_bits,
        },
    }
}

/// Ephemeris/almanac input for the RS92 pseudorange solver.
fn load_ephemeris(args: &Args) -> Result<Option<EphemerisSource>> {
    if let Some(path) = &args.ephem {
        let rdr = BufReader::new(File::open(path).with_context(|| format!("open {}", path.display()))?);
        let ephs = almanac::read_rinex_nav(rdr)?;
        return Ok(Some(EphemerisSource {
            ephs,
            is_almanac: false,
            week1024_epoch: args.gpsepoch,
        }));
    }
    if let Some(path) = &args.almanac {
        let rdr = BufReader::new(File::open(path).with_context(|| format!("open {}", path.display()))?);
        let ephs = almanac::read_sem(rdr)?;
        return Ok(Some(EphemerisSource {
            ephs,
            is_almanac: true,
            week1024_epoch: args.gpsepoch,
        }));
    }
    Ok(None)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sonde_decoder=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let opts = decode_opts(&args);
    let kind = kind_of(args.sonde);

    let (src, rate) = open_source(&args)?;
    let spb = rate as f32 / kind.baud() as f32;
    if spb < 8.0 {
        info!(spb, "note: sample rate low");
    }
    if rate as f64 / kind.baud() < 1.0 {
        bail!("sample rate {rate} below the symbol rate");
    }

    info!(%kind, rate, "decoder starting");

    match args.sonde {
        SondeArg::Rs41 => rs41::run(src, spb, &opts)?,
        SondeArg::Rs92 => {
            let eph = load_ephemeris(&args)?;
            if eph.is_none() {
                info!("no almanac/ephemeris: RS92 emits time and id only");
            }
            rs92::run(src, spb, &opts, eph)?;
        }
        SondeArg::Dfm => dfm::run(src, spb, &opts)?,
        SondeArg::M10 => m10::run(src, spb, &opts)?,
        SondeArg::Lms6 => lms6::run(src, spb, &opts)?,
    }

    Ok(())
}
