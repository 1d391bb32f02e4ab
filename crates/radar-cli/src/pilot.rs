//! Pilot demo wiring the full radar signal processing engine together.
//!
//! Runs the six end-to-end scenarios against a live OpenCL device:
//! 1. Tiny FFT with top-3 peak extraction
//! 2. Zero-delay fractional delay (round-trip fidelity)
//! 3. Integer 5-sample delay (impulse shift)
//! 4. Per-beam ramp delay (mixed integer/fractional)
//! 5. Batched FFT across multiple memory-adaptive streams
//! 6. Program cache re-use
//!
//! Run with:
//! ```bash
//! cargo run --release -p radar-cli --bin radar-pilot
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use radar_core::{AccessMode, Complex, DelayParams, FftParams, LagrangeMatrix, LagrangeMatrixFile};
use radar_dsp::{AntennaFftEngine, BatchingConfig, FractionalDelayConfig, FractionalDelayProcessor};
use radar_gpu::{ComputeFacade, DeviceKind};

#[derive(Parser, Debug)]
#[command(about = "Pilot run of the radar GPU signal processing engine")]
struct Args {
    /// Prefer a GPU device; falls back to whatever OpenCL reports by default.
    #[arg(long)]
    gpu: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    println!("================================================================");
    println!("  Radar GPU Signal Processing Engine -- Pilot Run");
    println!("================================================================");
    println!();

    let kind = if args.gpu { DeviceKind::Gpu } else { DeviceKind::Default };
    let facade = match ComputeFacade::new(kind) {
        Ok(f) => Arc::new(f),
        Err(e) => {
            println!("no OpenCL device available ({e}); nothing to run.");
            return Ok(());
        }
    };
    let caps = facade.context().capabilities();
    println!(
        "device ready: {} MiB global memory, {} compute units",
        caps.global_mem_size / (1024 * 1024),
        caps.compute_units
    );
    println!();

    scenario_tiny_fft(&facade)?;
    scenario_zero_delay(&facade)?;
    scenario_integer_delay(&facade)?;
    scenario_ramp_delay(&facade)?;
    scenario_batched_fft(&facade)?;
    scenario_program_cache(&facade)?;

    println!("================================================================");
    println!("  All scenarios completed");
    println!("================================================================");
    Ok(())
}

fn synthetic_lagrange_matrix() -> Result<LagrangeMatrix> {
    let taps = [-2.0f64, -1.0, 0.0, 1.0, 2.0];
    let mut data = Vec::with_capacity(radar_core::LAGRANGE_ROWS);
    for r in 0..radar_core::LAGRANGE_ROWS {
        let x = r as f64 / radar_core::LAGRANGE_ROWS as f64;
        let mut row = [0f32; 5];
        for (k, slot) in row.iter_mut().enumerate() {
            let mut coeff = 1.0f64;
            for (m, tap_m) in taps.iter().enumerate() {
                if m != k {
                    coeff *= (x - tap_m) / (taps[k] - tap_m);
                }
            }
            *slot = coeff as f32;
        }
        data.push(row.to_vec());
    }
    LagrangeMatrix::from_file(LagrangeMatrixFile {
        description: "pilot-generated Lagrange table".into(),
        rows: radar_core::LAGRANGE_ROWS,
        columns: radar_core::LAGRANGE_COLUMNS,
        data,
    })
    .context("building the demo Lagrange table")
}

fn scenario_tiny_fft(facade: &Arc<ComputeFacade>) -> Result<()> {
    println!("1. Tiny FFT");
    let engine = AntennaFftEngine::new(facade.clone()).context("building antenna FFT engine")?;

    let beam_count = 5;
    let count_points = 1000;
    let params = FftParams {
        beam_count,
        count_points,
        out_count_points_fft: 512,
        max_peaks_count: 3,
    };

    let mut input = Vec::with_capacity(beam_count * count_points);
    for _ in 0..beam_count {
        for t in 0..count_points {
            let angle = 2.0 * std::f32::consts::PI * 100.0 * t as f32 / count_points as f32;
            input.push(Complex::new(angle.cos(), angle.sin()));
        }
    }
    let buffer = facade
        .create_buffer_with_data(&input, AccessMode::ReadOnly)
        .context("uploading tiny FFT input")?;

    let result = engine.process(&buffer, params, "pilot-tiny-fft", "pilot", false)?;
    println!("   nFFT = {}", result.n_fft);
    for beam in &result.results {
        let top = beam.peaks[0];
        println!(
            "   beam {}: peak index={} magnitude={:.2} phase={:.2} deg",
            beam.beam_index, top.index, top.magnitude, top.phase_degrees
        );
    }
    println!();
    Ok(())
}

fn scenario_zero_delay(facade: &Arc<ComputeFacade>) -> Result<()> {
    println!("2. Zero-delay fractional delay");
    let lagrange = synthetic_lagrange_matrix()?;
    let config = FractionalDelayConfig {
        num_beams: 4,
        num_samples: 256,
        local_work_size: 64,
    };
    let mut processor = FractionalDelayProcessor::new(facade.clone(), config, &lagrange)
        .context("building fractional delay processor")?;

    let n = config.num_samples;
    let input: Vec<Complex> = (0..config.num_beams * n)
        .map(|gid| {
            let t = (gid % n) as f32;
            let angle = 2.0 * std::f32::consts::PI * t / n as f32;
            Complex::new(angle.cos(), angle.sin())
        })
        .collect();
    let mut buffer = facade.create_buffer_with_data(&input, AccessMode::ReadWrite)?;

    let profiling = processor.apply(&mut buffer, &vec![DelayParams::new(0, 0); config.num_beams])?;
    let output = buffer.read()?;
    let mse: f32 = output
        .iter()
        .zip(input.iter())
        .map(|(o, i)| (o.re - i.re).powi(2) + (o.im - i.im).powi(2))
        .sum::<f32>()
        / output.len() as f32;
    println!("   mse = {mse:.6} (kernel {:.3} ms)", profiling.kernel_ms);
    println!();
    Ok(())
}

fn scenario_integer_delay(facade: &Arc<ComputeFacade>) -> Result<()> {
    println!("3. Integer 5-sample delay");
    let lagrange = synthetic_lagrange_matrix()?;
    let config = FractionalDelayConfig {
        num_beams: 2,
        num_samples: 128,
        local_work_size: 32,
    };
    let mut processor = FractionalDelayProcessor::new(facade.clone(), config, &lagrange)?;

    let n = config.num_samples;
    let mut input = vec![Complex::ZERO; config.num_beams * n];
    input[20] = Complex::new(1.0, 0.0);
    input[n + 30] = Complex::new(1.0, 0.0);
    let mut buffer = facade.create_buffer_with_data(&input, AccessMode::ReadWrite)?;

    processor.apply(&mut buffer, &vec![DelayParams::new(5, 0); config.num_beams])?;
    let output = buffer.read()?;
    println!(
        "   beam 0 impulse now at 25: magnitude={:.3}",
        output[25].magnitude()
    );
    println!(
        "   beam 1 impulse now at {}: magnitude={:.3}",
        n + 35,
        output[n + 35].magnitude()
    );
    println!();
    Ok(())
}

fn scenario_ramp_delay(facade: &Arc<ComputeFacade>) -> Result<()> {
    println!("4. Per-beam ramp delay");
    let lagrange = synthetic_lagrange_matrix()?;
    let config = FractionalDelayConfig {
        num_beams: 8,
        num_samples: 256,
        local_work_size: 64,
    };
    let mut processor = FractionalDelayProcessor::new(facade.clone(), config, &lagrange)?;

    let n = config.num_samples;
    let mut input = vec![Complex::ZERO; config.num_beams * n];
    for beam in 0..config.num_beams {
        input[beam * n + (50 + 10 * beam)] = Complex::new(1.0, 0.0);
    }
    let mut buffer = facade.create_buffer_with_data(&input, AccessMode::ReadWrite)?;

    let delays: Vec<DelayParams> = (0..config.num_beams)
        .map(|b| DelayParams::from_samples(b as f64 / 2.0))
        .collect();
    processor.apply(&mut buffer, &delays)?;

    let output = buffer.read()?;
    for beam in 0..config.num_beams {
        let row = &output[beam * n..(beam + 1) * n];
        let peak_index = row
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.magnitude().partial_cmp(&b.magnitude()).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        println!("   beam {beam}: peak at {peak_index}");
    }
    println!();
    Ok(())
}

fn scenario_batched_fft(facade: &Arc<ComputeFacade>) -> Result<()> {
    println!("5. Batched FFT");
    let engine = AntennaFftEngine::with_batching_config(facade.clone(), BatchingConfig::default())
        .context("building antenna FFT engine")?;

    // The literal scenario (beam_count=256, count_points=1_300_000) needs a
    // ~2.6GB host-side fixture; scaled down here and forced into the batched
    // path with a tight memory budget so the demo stays fast on a laptop GPU.
    engine.set_batching_config(BatchingConfig {
        memory_usage_limit: 1e-6,
        batch_size_ratio: 0.2,
        min_beams_for_batch: 5,
        num_parallel_streams: 3,
    });

    let beam_count = 40;
    let count_points = 1024;
    let params = FftParams {
        beam_count,
        count_points,
        out_count_points_fft: 64,
        max_peaks_count: 3,
    };

    let mut input = Vec::with_capacity(beam_count * count_points);
    for beam in 0..beam_count {
        for t in 0..count_points {
            let angle = 2.0 * std::f32::consts::PI * (10 + beam) as f32 * t as f32 / count_points as f32;
            input.push(Complex::new(angle.cos(), angle.sin()));
        }
    }
    let buffer = facade.create_buffer_with_data(&input, AccessMode::ReadOnly)?;

    let result = engine.process(&buffer, params, "pilot-batched-fft", "pilot", false)?;
    let total_peaks: usize = result.results.iter().map(|r| r.peaks.len()).sum();
    println!(
        "   {} beams, {} batches, {} peaks total",
        result.total_beams,
        engine.statistics().last_batch_count,
        total_peaks
    );
    println!();
    Ok(())
}

fn scenario_program_cache(facade: &Arc<ComputeFacade>) -> Result<()> {
    println!("6. Program cache re-use");
    const SOURCE: &str = r#"
        __kernel void pilot_noop(__global float2* buf) {
            uint i = get_global_id(0);
            buf[i].x = buf[i].x;
        }
    "#;
    facade.load_program(SOURCE)?;
    facade.load_program(SOURCE)?;
    let stats = facade.statistics();
    println!(
        "   programs={} hits={} misses={}",
        stats.programs.programs, stats.programs.hits, stats.programs.misses
    );
    println!();
    Ok(())
}
