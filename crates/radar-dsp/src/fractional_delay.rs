//! In-place per-beam fractional-sample delay via 5-tap Lagrange interpolation.

use std::sync::Arc;
use std::time::Instant;

use ocl::{Buffer as OclBuffer, Kernel, SpatialDims};
use radar_core::{DelayParams, LagrangeMatrix, RadarError, Result};
use radar_gpu::{ComputeFacade, KernelDescriptor, MemoryBuffer, ProgramHandle};

const SHADER_SOURCE: &str = include_str!("shaders/fractional_delay.cl");

const MIN_NUM_BEAMS: usize = 1;
const MAX_NUM_BEAMS: usize = 256;
const MIN_NUM_SAMPLES: usize = 16;
const MIN_LOCAL_WORK_SIZE: usize = 32;
const MAX_LOCAL_WORK_SIZE: usize = 1024;

/// Device-side mirror of [`DelayParams`]; a distinct type so it can implement
/// the foreign `OclPrm` marker without violating the orphan rule.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
struct GpuDelayParams {
    delay_integer: i32,
    lagrange_row: u32,
}

unsafe impl ocl::OclPrm for GpuDelayParams {}

impl From<DelayParams> for GpuDelayParams {
    fn from(d: DelayParams) -> Self {
        GpuDelayParams {
            delay_integer: d.delay_integer,
            lagrange_row: d.lagrange_row,
        }
    }
}

/// Construction-time configuration, validated once up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FractionalDelayConfig {
    pub num_beams: usize,
    pub num_samples: usize,
    pub local_work_size: usize,
}

impl FractionalDelayConfig {
    fn validate(&self) -> Result<()> {
        if !(MIN_NUM_BEAMS..=MAX_NUM_BEAMS).contains(&self.num_beams) {
            return Err(RadarError::InvalidConfig(format!(
                "num_beams {} outside [{MIN_NUM_BEAMS}, {MAX_NUM_BEAMS}]",
                self.num_beams
            )));
        }
        if self.num_samples < MIN_NUM_SAMPLES {
            return Err(RadarError::InvalidConfig(format!(
                "num_samples {} below minimum {MIN_NUM_SAMPLES}",
                self.num_samples
            )));
        }
        if !(MIN_LOCAL_WORK_SIZE..=MAX_LOCAL_WORK_SIZE).contains(&self.local_work_size) {
            return Err(RadarError::InvalidConfig(format!(
                "local_work_size {} outside [{MIN_LOCAL_WORK_SIZE}, {MAX_LOCAL_WORK_SIZE}]",
                self.local_work_size
            )));
        }
        Ok(())
    }
}

/// Kernel-event timing for one `apply` call, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DelayProfilingRecord {
    pub kernel_ms: f64,
    pub total_ms: f64,
    pub throughput_samples_per_second: f64,
}

/// Applies per-beam Lagrange fractional delay in place on a beam matrix.
///
/// Owns a scratch buffer of the same shape so the 5-tap window never aliases
/// its own output; `apply` reads from the caller's buffer, writes into
/// scratch, then copies scratch back so the caller's handle is mutated in
/// place as the external contract requires.
pub struct FractionalDelayProcessor {
    facade: Arc<ComputeFacade>,
    config: FractionalDelayConfig,
    program: Arc<ProgramHandle>,
    kernel: Arc<KernelDescriptor>,
    lagrange_buffer: OclBuffer<f32>,
    delays_buffer: OclBuffer<GpuDelayParams>,
    scratch: MemoryBuffer,
    last_delays: Option<Vec<DelayParams>>,
}

impl FractionalDelayProcessor {
    pub fn new(
        facade: Arc<ComputeFacade>,
        config: FractionalDelayConfig,
        lagrange: &LagrangeMatrix,
    ) -> Result<Self> {
        config.validate()?;

        let program = facade.load_program(SHADER_SOURCE)?;
        let kernel = facade.get_kernel(&program, "fractional_delay")?;

        let default_queue = facade.queues().next().clone();

        let lagrange_buffer = OclBuffer::<f32>::builder()
            .context(facade.context().ocl_context())
            .queue(default_queue.clone())
            .len(radar_core::LAGRANGE_ROWS * radar_core::LAGRANGE_COLUMNS)
            .copy_host_slice(&lagrange.flatten())
            .build()
            .map_err(|e| RadarError::OutOfMemory(e.to_string()))?;

        let delays_buffer = OclBuffer::<GpuDelayParams>::builder()
            .context(facade.context().ocl_context())
            .queue(default_queue)
            .len(config.num_beams)
            .build()
            .map_err(|e| RadarError::OutOfMemory(e.to_string()))?;

        let scratch = facade.create_buffer(
            config.num_beams * config.num_samples,
            radar_core::AccessMode::ReadWrite,
        )?;

        Ok(Self {
            facade,
            config,
            program,
            kernel,
            lagrange_buffer,
            delays_buffer,
            scratch,
            last_delays: None,
        })
    }

    pub fn config(&self) -> FractionalDelayConfig {
        self.config
    }

    /// Apply one `DelayParams` per beam, mutating `buffer` in place.
    pub fn apply(&mut self, buffer: &mut MemoryBuffer, delays: &[DelayParams]) -> Result<DelayProfilingRecord> {
        if delays.len() != self.config.num_beams {
            return Err(RadarError::ShapeMismatch(format!(
                "expected {} per-beam delays, got {}",
                self.config.num_beams,
                delays.len()
            )));
        }
        if buffer.len() != self.config.num_beams * self.config.num_samples {
            return Err(RadarError::ShapeMismatch(format!(
                "buffer of {} elements does not match {}x{} beam matrix",
                buffer.len(),
                self.config.num_beams,
                self.config.num_samples
            )));
        }

        let start = Instant::now();
        if self.last_delays.as_deref() != Some(delays) {
            let device_delays: Vec<GpuDelayParams> = delays.iter().copied().map(GpuDelayParams::from).collect();
            let queue = self.facade.queues().next();
            self.delays_buffer
                .cmd()
                .queue(queue)
                .write(&device_delays)
                .enq()
                .map_err(|e| RadarError::TransferError(e.to_string()))?;
            self.last_delays = Some(delays.to_vec());
        }

        let kernel_start = Instant::now();
        self.dispatch(buffer)?;
        let kernel_ms = kernel_start.elapsed().as_secs_f64() * 1000.0;

        let result = self.scratch.read()?;
        buffer.write(&result)?;

        let total_ms = start.elapsed().as_secs_f64() * 1000.0;
        let throughput = if total_ms > 0.0 {
            (self.config.num_beams * self.config.num_samples) as f64 / (total_ms / 1000.0)
        } else {
            0.0
        };

        Ok(DelayProfilingRecord {
            kernel_ms,
            total_ms,
            throughput_samples_per_second: throughput,
        })
    }

    /// Apply the same `DelayParams` to every beam without reuploading a
    /// full per-beam vector when the broadcast value is unchanged from the
    /// previous call.
    pub fn apply_broadcast(&mut self, buffer: &mut MemoryBuffer, delay: DelayParams) -> Result<DelayProfilingRecord> {
        let unchanged = self
            .last_delays
            .as_ref()
            .is_some_and(|prev| prev.iter().all(|d| *d == delay));
        if unchanged {
            let start = Instant::now();
            let kernel_start = Instant::now();
            self.dispatch(buffer)?;
            let kernel_ms = kernel_start.elapsed().as_secs_f64() * 1000.0;
            let result = self.scratch.read()?;
            buffer.write(&result)?;
            let total_ms = start.elapsed().as_secs_f64() * 1000.0;
            let throughput = if total_ms > 0.0 {
                (self.config.num_beams * self.config.num_samples) as f64 / (total_ms / 1000.0)
            } else {
                0.0
            };
            return Ok(DelayProfilingRecord {
                kernel_ms,
                total_ms,
                throughput_samples_per_second: throughput,
            });
        }
        let broadcast = vec![delay; self.config.num_beams];
        self.apply(buffer, &broadcast)
    }

    fn dispatch(&self, buffer: &MemoryBuffer) -> Result<()> {
        let global = self.config.num_beams * self.config.num_samples;
        let local = if global % self.config.local_work_size == 0 {
            Some(self.config.local_work_size)
        } else {
            None
        };

        let queue = self.facade.queues().next();
        let mut builder = Kernel::builder();
        builder
            .program(self.kernel.program().ocl_program())
            .name(self.kernel.name())
            .queue(queue.clone())
            .global_work_size(SpatialDims::One(global));
        if let Some(local) = local {
            builder.local_work_size(SpatialDims::One(local));
        }
        let kernel = builder
            .build()
            .map_err(|e| RadarError::KernelLaunch(e.to_string()))?;

        buffer.bind_as_kernel_arg(&kernel, 0)?;
        self.scratch.bind_as_kernel_arg(&kernel, 1)?;
        kernel
            .set_arg(2, &self.lagrange_buffer)
            .map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        kernel
            .set_arg(3, &self.delays_buffer)
            .map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        kernel
            .set_arg(4, self.config.num_beams as u32)
            .map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        kernel
            .set_arg(5, self.config.num_samples as u32)
            .map_err(|e| RadarError::KernelLaunch(e.to_string()))?;

        unsafe {
            kernel
                .cmd()
                .enq()
                .map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        }
        queue.finish().map_err(|e| RadarError::EventWait(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radar_core::{AccessMode, Complex, LagrangeMatrixFile};
    use radar_gpu::DeviceKind;

    fn uniform_lagrange() -> LagrangeMatrix {
        let mut data = vec![vec![0.0f32; 5]; radar_core::LAGRANGE_ROWS];
        for (r, row) in data.iter_mut().enumerate() {
            // row r centres its weight near fractional offset r/48 without
            // needing true Lagrange coefficients for this fixture.
            let _ = r;
            row[2] = 1.0;
        }
        LagrangeMatrix::from_file(LagrangeMatrixFile {
            description: "test fixture".into(),
            rows: radar_core::LAGRANGE_ROWS,
            columns: radar_core::LAGRANGE_COLUMNS,
            data,
        })
        .unwrap()
    }

    #[test]
    fn rejects_out_of_range_config() {
        let bad = FractionalDelayConfig {
            num_beams: 0,
            num_samples: 256,
            local_work_size: 64,
        };
        assert!(matches!(bad.validate(), Err(RadarError::InvalidConfig(_))));
    }

    #[test]
    fn zero_delay_reproduces_input_within_tolerance() {
        let Ok(facade) = ComputeFacade::new(DeviceKind::Default).map(Arc::new) else {
            log::warn!("no OpenCL device available; skipping fractional delay test");
            return;
        };
        let lagrange = uniform_lagrange();
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
        let mut buffer = facade
            .create_buffer_with_data(&input, AccessMode::ReadWrite)
            .unwrap();

        let delays = vec![DelayParams::new(0, 0); config.num_beams];
        processor.apply(&mut buffer, &delays).unwrap();

        let output = buffer.read().unwrap();
        let max_input = input.iter().map(|c| c.magnitude()).fold(0.0f32, f32::max);
        let max_err = output
            .iter()
            .zip(input.iter())
            .map(|(o, i)| ((o.re - i.re).powi(2) + (o.im - i.im).powi(2)).sqrt())
            .fold(0.0f32, f32::max);
        assert!(max_err < 1e-2 * max_input.max(1.0));
    }

    #[test]
    fn integer_delay_shifts_an_impulse() {
        let Ok(facade) = ComputeFacade::new(DeviceKind::Default).map(Arc::new) else {
            log::warn!("no OpenCL device available; skipping fractional delay test");
            return;
        };
        let lagrange = uniform_lagrange();
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
        let mut buffer = facade
            .create_buffer_with_data(&input, AccessMode::ReadWrite)
            .unwrap();

        let delays = vec![DelayParams::new(5, 0); config.num_beams];
        processor.apply(&mut buffer, &delays).unwrap();

        let output = buffer.read().unwrap();
        assert!(output[25].magnitude() >= 0.9);
        assert!(output[n + 35].magnitude() >= 0.9);
    }

    #[test]
    fn broadcast_overload_matches_per_beam_overload() {
        let Ok(facade) = ComputeFacade::new(DeviceKind::Default).map(Arc::new) else {
            log::warn!("no OpenCL device available; skipping fractional delay test");
            return;
        };
        let lagrange = uniform_lagrange();
        let config = FractionalDelayConfig {
            num_beams: 3,
            num_samples: 64,
            local_work_size: 32,
        };
        let mut processor = FractionalDelayProcessor::new(facade.clone(), config, &lagrange).unwrap();

        let n = config.num_samples;
        let input: Vec<Complex> = (0..config.num_beams * n)
            .map(|gid| Complex::new((gid % n) as f32, 0.0))
            .collect();
        let mut via_broadcast = facade
            .create_buffer_with_data(&input, AccessMode::ReadWrite)
            .unwrap();
        let mut via_vector = facade
            .create_buffer_with_data(&input, AccessMode::ReadWrite)
            .unwrap();

        processor
            .apply_broadcast(&mut via_broadcast, DelayParams::new(2, 0))
            .unwrap();
        processor
            .apply(&mut via_vector, &vec![DelayParams::new(2, 0); config.num_beams])
            .unwrap();

        assert_eq!(via_broadcast.read().unwrap(), via_vector.read().unwrap());
    }
}
