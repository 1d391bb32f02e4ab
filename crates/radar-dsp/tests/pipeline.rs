//! End-to-end scenarios exercising the fractional-delay processor and the
//! antenna FFT + peaks engine together against a live OpenCL device. Every
//! test degrades gracefully (logs and returns) when no device is available,
//! matching the hardware-gating convention used throughout this workspace.

use std::sync::Arc;

use radar_core::{AccessMode, Complex, DelayParams, LagrangeMatrix, LagrangeMatrixFile, FftParams};
use radar_dsp::{AntennaFftEngine, BatchingConfig, FractionalDelayConfig, FractionalDelayProcessor};
use radar_gpu::{ComputeFacade, DeviceKind};

/// Exact 5-tap Lagrange interpolation coefficients for every fractional
/// offset `r/48`, via the standard Lagrange basis polynomial over tap
/// centres `[-2, -1, 0, 1, 2]`.
fn generate_lagrange_matrix() -> LagrangeMatrix {
    let taps = [-2.0f64, -1.0, 0.0, 1.0, 2.0];
    let mut data = Vec::with_capacity(radar_core::LAGRANGE_ROWS);
    for r in 0..radar_core::LAGRANGE_ROWS {
        let x = r as f64 / radar_core::LAGRANGE_ROWS as f64;
        let mut row = [0f32; 5];
        for (k, row_slot) in row.iter_mut().enumerate() {
            let mut coeff = 1.0f64;
            for (m, tap_m) in taps.iter().enumerate() {
                if m != k {
                    coeff *= (x - tap_m) / (taps[k] - tap_m);
                }
            }
            *row_slot = coeff as f32;
        }
        data.push(row.to_vec());
    }
    LagrangeMatrix::from_file(LagrangeMatrixFile {
        description: "generated for tests".into(),
        rows: radar_core::LAGRANGE_ROWS,
        columns: radar_core::LAGRANGE_COLUMNS,
        data,
    })
    .expect("generated Lagrange rows sum to 1.0 by construction")
}

fn facade() -> Option<Arc<ComputeFacade>> {
    match ComputeFacade::new(DeviceKind::Default) {
        Ok(f) => Some(Arc::new(f)),
        Err(_) => {
            log::warn!("no OpenCL device available; skipping end-to-end pipeline test");
            None
        }
    }
}

fn argmax_magnitude(samples: &[Complex]) -> usize {
    samples
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.magnitude().partial_cmp(&b.magnitude()).unwrap())
        .map(|(i, _)| i)
        .unwrap()
}

#[test]
fn tiny_fft_finds_a_dominant_tone() {
    let Some(facade) = facade() else { return };
    let engine = AntennaFftEngine::new(facade.clone()).unwrap();

    let beam_count = 5;
    let count_points = 1000;
    let params = FftParams {
        beam_count,
        count_points,
        out_count_points_fft: 512,
        max_peaks_count: 3,
    };
    assert_eq!(params.n_fft(), 2048);

    let mut input = Vec::with_capacity(beam_count * count_points);
    for _ in 0..beam_count {
        for t in 0..count_points {
            let angle = 2.0 * std::f32::consts::PI * 100.0 * t as f32 / count_points as f32;
            input.push(Complex::new(angle.cos(), angle.sin()));
        }
    }
    let buffer = facade.create_buffer_with_data(&input, AccessMode::ReadOnly).unwrap();

    let result = engine.process(&buffer, params, "tiny-fft", "test", false).unwrap();
    assert_eq!(result.n_fft, 2048);
    assert_eq!(result.results.len(), beam_count);

    for beam in &result.results {
        assert_eq!(beam.peaks.len(), 3);
        assert!(beam.peaks[0].magnitude > beam.peaks[1].magnitude);
        assert!(beam.peaks[0].phase_degrees.abs() < 5.0);
    }
}

#[test]
fn zero_delay_fractional_delay_preserves_signal() {
    let Some(facade) = facade() else { return };
    let lagrange = generate_lagrange_matrix();
    let config = FractionalDelayConfig {
        num_beams: 4,
        num_samples: 256,
        local_work_size: 64,
    };
    let mut processor = FractionalDelayProcessor::new(facade.clone(), config, &lagrange).unwrap();

    let n = config.num_samples;
    let input: Vec<Complex> = (0..config.num_beams * n)
        .map(|gid| {
            let t = (gid % n) as f32;
            let angle = 2.0 * std::f32::consts::PI * t / n as f32;
            Complex::new(angle.cos(), angle.sin())
        })
        .collect();
    let mut buffer = facade.create_buffer_with_data(&input, AccessMode::ReadWrite).unwrap();

    processor
        .apply(&mut buffer, &vec![DelayParams::new(0, 0); config.num_beams])
        .unwrap();

    let output = buffer.read().unwrap();
    let mse: f32 = output
        .iter()
        .zip(input.iter())
        .map(|(o, i)| (o.re - i.re).powi(2) + (o.im - i.im).powi(2))
        .sum::<f32>()
        / output.len() as f32;
    assert!(mse < 1e-2);
}

#[test]
fn integer_five_sample_delay_shifts_impulses() {
    let Some(facade) = facade() else { return };
    let lagrange = generate_lagrange_matrix();
    let config = FractionalDelayConfig {
        num_beams: 2,
        num_samples: 128,
        local_work_size: 32,
    };
    let mut processor = FractionalDelayProcessor::new(facade.clone(), config, &lagrange).unwrap();

    let n = config.num_samples;
    let mut input = vec![Complex::ZERO; config.num_beams * n];
    input[20] = Complex::new(1.0, 0.0);
    input[n + 30] = Complex::new(1.0, 0.0);
    let mut buffer = facade.create_buffer_with_data(&input, AccessMode::ReadWrite).unwrap();

    processor
        .apply(&mut buffer, &vec![DelayParams::new(5, 0); config.num_beams])
        .unwrap();

    let output = buffer.read().unwrap();
    assert!(output[25].magnitude() >= 0.9);
    assert!(output[n + 35].magnitude() >= 0.9);
}

#[test]
fn per_beam_ramp_delay_tracks_expected_offset() {
    let Some(facade) = facade() else { return };
    let lagrange = generate_lagrange_matrix();
    let config = FractionalDelayConfig {
        num_beams: 8,
        num_samples: 256,
        local_work_size: 64,
    };
    let mut processor = FractionalDelayProcessor::new(facade.clone(), config, &lagrange).unwrap();

    let n = config.num_samples;
    let mut input = vec![Complex::ZERO; config.num_beams * n];
    for beam in 0..config.num_beams {
        input[beam * n + (50 + 10 * beam)] = Complex::new(1.0, 0.0);
    }
    let mut buffer = facade.create_buffer_with_data(&input, AccessMode::ReadWrite).unwrap();

    let delays: Vec<DelayParams> = (0..config.num_beams)
        .map(|b| DelayParams::from_samples(b as f64 / 2.0))
        .collect();
    processor.apply(&mut buffer, &delays).unwrap();

    let output = buffer.read().unwrap();
    for beam in 0..config.num_beams {
        let row = &output[beam * n..(beam + 1) * n];
        let peak_index = argmax_magnitude(row);
        let expected = 50 + 10 * beam + beam / 2;
        assert!(
            (peak_index as i64 - expected as i64).abs() <= 1,
            "beam {beam}: peak at {peak_index}, expected near {expected}"
        );
    }
}

#[test]
fn batched_mode_preserves_beam_order_and_splits_into_multiple_batches() {
    let Some(facade) = facade() else { return };
    let engine = AntennaFftEngine::new(facade.clone()).unwrap();
    // A strict memory budget forces the batched path without needing a
    // multi-gigabyte host-side fixture; the functional assertions (merge
    // order, batch count, total peak count) match the literal scenario.
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
    let buffer = facade.create_buffer_with_data(&input, AccessMode::ReadOnly).unwrap();

    let result = engine.process(&buffer, params, "batched-fft", "test", false).unwrap();
    assert_eq!(result.results.len(), beam_count);
    for (i, beam_result) in result.results.iter().enumerate() {
        assert_eq!(beam_result.beam_index, i);
    }
    let total_peaks: usize = result.results.iter().map(|r| r.peaks.len()).sum();
    assert_eq!(total_peaks, beam_count * params.max_peaks_count);
    assert!(engine.statistics().last_batch_count >= 2);
}
