//! Batched antenna FFT + top-N peak extraction: a 5-stage event-driven GPU
//! pipeline (pack -> FFT -> post-process -> reduction -> async readback)
//! with a single host wait at the end, and memory-adaptive batching across
//! parallel queues when a single invocation would not fit the device's
//! memory budget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ocl::{Buffer as OclBuffer, Event, EventList, Kernel, Queue, SpatialDims};
use radar_core::{
    sort_peaks_descending, AntennaFftResult, FftParams, FftPeak, FftResult, ProfilingRecord,
    RadarError, Result, NO_PEAK_INDEX,
};
use radar_gpu::{ComputeFacade, KernelDescriptor, MemoryBuffer, ProgramHandle};

const PACK_SOURCE: &str = include_str!("shaders/pack.cl");
const FFT_SOURCE: &str = include_str!("shaders/fft_radix2.cl");
const POST_SOURCE: &str = include_str!("shaders/fft_post_process.cl");
const REDUCTION_SOURCE: &str = include_str!("shaders/peak_reduction.cl");

const REDUCTION_LOCAL_SIZE: usize = 64;

/// Device-side peak record, bit-identical to the kernel argument convention
/// `{u32 index, f32 magnitude, f32 phase, u32 pad}`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
struct GpuPeak {
    index: u32,
    magnitude: f32,
    phase: f32,
    _pad: u32,
}

unsafe impl ocl::OclPrm for GpuPeak {}

/// Converts a device peak record into a host [`FftPeak`].
///
/// `peak_reduction.cl` only ever sees the slim `(beam_count, k)` buffers that
/// `fft_post_process.cl` packed, so `p.index` arrives as a slim-buffer offset
/// in `0..k`, not a bin position in the original `n_fft`-wide spectrum. The
/// slim buffer holds the first `k/2` and last `k/2` bins (see
/// `fft_post_process.cl`), so the inverse mapping is the same split: offsets
/// below `k/2` are already the true low-end bin, offsets at or above `k/2`
/// land in the last `k/2` bins of the full spectrum.
fn gpu_peak_to_fft_peak(p: GpuPeak, k: usize, n_fft: usize) -> FftPeak {
    if p.index == NO_PEAK_INDEX {
        return FftPeak::none();
    }
    let half = (k / 2) as u32;
    let bin = if p.index < half {
        p.index
    } else {
        n_fft as u32 - k as u32 + p.index
    };
    FftPeak {
        index: bin,
        magnitude: p.magnitude,
        phase_degrees: p.phase,
    }
}

/// Runtime policy governing when the engine switches from a single-batch
/// invocation to memory-adaptive parallel batching. All fields have
/// hard-coded defaults and explicit setters; no environment variables or
/// config files are consulted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchingConfig {
    pub memory_usage_limit: f64,
    pub batch_size_ratio: f64,
    pub min_beams_for_batch: usize,
    pub num_parallel_streams: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            memory_usage_limit: 0.65,
            batch_size_ratio: 0.22,
            min_beams_for_batch: 10,
            num_parallel_streams: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PlanKey {
    beam_count: usize,
    count_points: usize,
    n_fft: usize,
    k: usize,
    max_peaks_count: usize,
}

/// A baked FFT "plan": in the absence of a vendored clFFT binding this is
/// just the derived shape constants the radix-2 kernels need, but it is
/// cached the same way a real plan-bake step would be.
struct FftPlan {
    n_fft: usize,
    log2_n_fft: u32,
}

impl FftPlan {
    fn bake(params: &FftParams) -> Self {
        let n_fft = params.n_fft();
        FftPlan {
            n_fft,
            log2_n_fft: n_fft.trailing_zeros(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanCacheStatistics {
    pub plans: usize,
    pub hits: u64,
    pub misses: u64,
}

struct PlanCache {
    plans: Mutex<HashMap<PlanKey, Arc<FftPlan>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PlanCache {
    fn new() -> Self {
        Self {
            plans: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn get_or_bake(&self, params: &FftParams) -> Result<Arc<FftPlan>> {
        let key = PlanKey {
            beam_count: params.beam_count,
            count_points: params.count_points,
            n_fft: params.n_fft(),
            k: params.out_count_points_fft,
            max_peaks_count: params.max_peaks_count,
        };
        let mut plans = self
            .plans
            .lock()
            .map_err(|_| RadarError::PlanBuild("plan cache lock poisoned".into()))?;
        if let Some(plan) = plans.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(plan.clone());
        }
        let plan = Arc::new(FftPlan::bake(params));
        plans.insert(key, plan.clone());
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(plan)
    }

    fn statistics(&self) -> PlanCacheStatistics {
        PlanCacheStatistics {
            plans: self.plans.lock().map(|p| p.len()).unwrap_or(0),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AntennaFftStatistics {
    pub plans: PlanCacheStatistics,
    pub last_batch_count: usize,
}

/// A pending, non-blocking readback of one batch's peak records. `count` is
/// the batch's actual record count, which may be smaller than `buffer.len()`
/// when the buffer is a per-stream cache entry sized to a larger batch.
struct PendingPeaksRead {
    event: Event,
    buffer: OclBuffer<GpuPeak>,
    count: usize,
}

impl PendingPeaksRead {
    fn wait(self) -> Result<Vec<GpuPeak>> {
        self.event
            .wait_for()
            .map_err(|e| RadarError::EventWait(e.to_string()))?;
        let mut host = vec![GpuPeak::default(); self.count];
        self.buffer
            .read(&mut host)
            .enq()
            .map_err(|e| RadarError::TransferError(e.to_string()))?;
        Ok(host)
    }
}

struct BatchHandle {
    beam_offset: usize,
    batch_beams: usize,
    peaks_read: PendingPeaksRead,
    complex_read: Option<radar_gpu::memory::PendingReadHandle>,
}

/// One stream's buffer set, reused across batches and grown (never shrunk)
/// to the largest batch dispatched on that stream so far.
struct StreamBuffers {
    staging: MemoryBuffer,
    staging_cap: usize,
    complex_slim: MemoryBuffer,
    complex_cap: usize,
    magnitude_slim: OclBuffer<f32>,
    magnitude_cap: usize,
    out_peaks: OclBuffer<GpuPeak>,
    out_cap: usize,
    /// Completion events of the previous batch dispatched on this stream;
    /// the next batch's first kernel waits on these before reusing the
    /// buffers above, since the pool's queues are out-of-order.
    drain: Option<EventList>,
}

impl StreamBuffers {
    fn allocate(
        facade: &ComputeFacade,
        queue: &Queue,
        staging_len: usize,
        complex_len: usize,
        magnitude_len: usize,
        peaks_len: usize,
    ) -> Result<Self> {
        Ok(Self {
            staging: Self::new_staging(facade, staging_len)?,
            staging_cap: staging_len,
            complex_slim: Self::new_complex(facade, complex_len)?,
            complex_cap: complex_len,
            magnitude_slim: Self::new_magnitude(facade, queue, magnitude_len)?,
            magnitude_cap: magnitude_len,
            out_peaks: Self::new_peaks(facade, queue, peaks_len)?,
            out_cap: peaks_len,
            drain: None,
        })
    }

    fn new_staging(facade: &ComputeFacade, len: usize) -> Result<MemoryBuffer> {
        facade.create_buffer_with_strategy(
            len,
            radar_gpu::BufferStrategy::Explicit(radar_gpu::BufferKind::Regular),
            radar_core::AccessMode::ReadWrite,
        )
    }

    fn new_complex(facade: &ComputeFacade, len: usize) -> Result<MemoryBuffer> {
        facade.create_buffer(len, radar_core::AccessMode::ReadWrite)
    }

    fn new_magnitude(facade: &ComputeFacade, queue: &Queue, len: usize) -> Result<OclBuffer<f32>> {
        OclBuffer::<f32>::builder()
            .context(facade.context().ocl_context())
            .queue(queue.clone())
            .len(len)
            .build()
            .map_err(|e| RadarError::OutOfMemory(e.to_string()))
    }

    fn new_peaks(facade: &ComputeFacade, queue: &Queue, len: usize) -> Result<OclBuffer<GpuPeak>> {
        OclBuffer::<GpuPeak>::builder()
            .context(facade.context().ocl_context())
            .queue(queue.clone())
            .len(len)
            .build()
            .map_err(|e| RadarError::OutOfMemory(e.to_string()))
    }

    /// Grow any buffer whose capacity is smaller than what this batch needs.
    /// Never shrinks; a buffer built for a large batch stays that size for
    /// smaller later batches on the same stream.
    fn ensure(
        &mut self,
        facade: &ComputeFacade,
        queue: &Queue,
        staging_len: usize,
        complex_len: usize,
        magnitude_len: usize,
        peaks_len: usize,
    ) -> Result<()> {
        if staging_len > self.staging_cap {
            self.staging = Self::new_staging(facade, staging_len)?;
            self.staging_cap = staging_len;
        }
        if complex_len > self.complex_cap {
            self.complex_slim = Self::new_complex(facade, complex_len)?;
            self.complex_cap = complex_len;
        }
        if magnitude_len > self.magnitude_cap {
            self.magnitude_slim = Self::new_magnitude(facade, queue, magnitude_len)?;
            self.magnitude_cap = magnitude_len;
        }
        if peaks_len > self.out_cap {
            self.out_peaks = Self::new_peaks(facade, queue, peaks_len)?;
            self.out_cap = peaks_len;
        }
        Ok(())
    }
}

/// Per-stream buffer sets for `AntennaFftEngine::dispatch_batch`, indexed by
/// stream number (see `pick_queue`). Lazily grown; slot `s` is only
/// allocated the first time stream `s` dispatches a batch.
struct StreamBufferCache {
    slots: Mutex<Vec<Option<StreamBuffers>>>,
}

impl StreamBufferCache {
    fn new() -> Self {
        Self { slots: Mutex::new(Vec::new()) }
    }
}

/// Batched antenna FFT + top-N peak extraction engine.
pub struct AntennaFftEngine {
    facade: Arc<ComputeFacade>,
    pack_program: Arc<ProgramHandle>,
    pack_kernel: Arc<KernelDescriptor>,
    fft_program: Arc<ProgramHandle>,
    bit_reverse_kernel: Arc<KernelDescriptor>,
    butterfly_kernel: Arc<KernelDescriptor>,
    post_program: Arc<ProgramHandle>,
    post_kernel: Arc<KernelDescriptor>,
    reduction_program: Arc<ProgramHandle>,
    reduction_kernel: Arc<KernelDescriptor>,
    plans: PlanCache,
    config: Mutex<BatchingConfig>,
    last_batch_count: AtomicUsize,
    stream_buffers: StreamBufferCache,
}

impl AntennaFftEngine {
    pub fn new(facade: Arc<ComputeFacade>) -> Result<Self> {
        Self::with_batching_config(facade, BatchingConfig::default())
    }

    pub fn with_batching_config(facade: Arc<ComputeFacade>, config: BatchingConfig) -> Result<Self> {
        let pack_program = facade.load_program(PACK_SOURCE)?;
        let pack_kernel = facade.get_kernel(&pack_program, "pack_and_pad")?;

        let fft_program = facade.load_program(FFT_SOURCE)?;
        let bit_reverse_kernel = facade.get_kernel(&fft_program, "fft_bit_reverse")?;
        let butterfly_kernel = facade.get_kernel(&fft_program, "fft_butterfly_stage")?;

        let post_program = facade.load_program(POST_SOURCE)?;
        let post_kernel = facade.get_kernel(&post_program, "fft_post_process")?;

        let reduction_program = facade.load_program(REDUCTION_SOURCE)?;
        let reduction_kernel = facade.get_kernel(&reduction_program, "peak_reduction")?;

        Ok(Self {
            facade,
            pack_program,
            pack_kernel,
            fft_program,
            bit_reverse_kernel,
            butterfly_kernel,
            post_program,
            post_kernel,
            reduction_program,
            reduction_kernel,
            plans: PlanCache::new(),
            config: Mutex::new(config),
            last_batch_count: AtomicUsize::new(0),
            stream_buffers: StreamBufferCache::new(),
        })
    }

    pub fn set_batching_config(&self, config: BatchingConfig) {
        if let Ok(mut guard) = self.config.lock() {
            *guard = config;
        }
    }

    pub fn statistics(&self) -> AntennaFftStatistics {
        AntennaFftStatistics {
            plans: self.plans.statistics(),
            last_batch_count: self.last_batch_count.load(Ordering::Relaxed),
        }
    }

    /// Run the pipeline on `input`, a `(params.beam_count, params.count_points)`
    /// row-major complex buffer. `retain_complex` asks the engine to also read
    /// back each beam's slim complex spectrum into `FftResult::fft_complex`.
    pub fn process(
        &self,
        input: &MemoryBuffer,
        params: FftParams,
        task_id: &str,
        module_name: &str,
        retain_complex: bool,
    ) -> Result<AntennaFftResult> {
        params.validate()?;
        if input.len() != params.beam_count * params.count_points {
            return Err(RadarError::ShapeMismatch(format!(
                "input of {} elements does not match {}x{} beam matrix",
                input.len(),
                params.beam_count,
                params.count_points
            )));
        }

        let plan = self.plans.get_or_bake(&params)?;
        let config = *self
            .config
            .lock()
            .map_err(|_| RadarError::PlanBuild("batching config lock poisoned".into()))?;

        let batches = self.plan_batches(&params, &plan, &config);
        self.last_batch_count.store(batches.len(), Ordering::Relaxed);

        self.run_batches(input, &params, &plan, &batches, &config, task_id, module_name, retain_complex)
    }

    /// Decide whether this call runs single-batch or memory-adaptive parallel
    /// batches, per the estimate in the component design.
    fn plan_batches(&self, params: &FftParams, plan: &FftPlan, config: &BatchingConfig) -> Vec<(usize, usize)> {
        if params.beam_count == 1 {
            return vec![(0, 1)];
        }

        let estimated_bytes = params.beam_count as u64
            * (params.count_points + 2 * plan.n_fft + params.out_count_points_fft) as u64
            * 8;
        let global_mem = self.facade.context().capabilities().global_mem_size;
        let budget = (config.memory_usage_limit * global_mem as f64) as u64;

        if estimated_bytes <= budget {
            return vec![(0, params.beam_count)];
        }

        let mut batch_beams = ((config.batch_size_ratio * params.beam_count as f64) as usize)
            .max(config.min_beams_for_batch)
            .min(params.beam_count);
        if batch_beams == 0 {
            batch_beams = params.beam_count;
        }

        let mut batches = Vec::new();
        let mut offset = 0;
        while offset < params.beam_count {
            let count = batch_beams.min(params.beam_count - offset);
            batches.push((offset, count));
            offset += count;
        }
        batches
    }

    #[allow(clippy::too_many_arguments)]
    fn run_batches(
        &self,
        input: &MemoryBuffer,
        params: &FftParams,
        plan: &FftPlan,
        batches: &[(usize, usize)],
        config: &BatchingConfig,
        task_id: &str,
        module_name: &str,
        retain_complex: bool,
    ) -> Result<AntennaFftResult> {
        let start = Instant::now();
        let num_streams = config.num_parallel_streams.max(1);

        let mut handles = Vec::with_capacity(batches.len());
        let mut dispatch_failed = false;
        for (i, &(beam_offset, batch_beams)) in batches.iter().enumerate() {
            let (stream, queue) = self.pick_queue(i, num_streams)?;
            match self.dispatch_batch(input, params, plan, beam_offset, batch_beams, &queue, stream, retain_complex) {
                Ok(handle) => handles.push(Ok(handle)),
                Err(e) => {
                    handles.push(Err((beam_offset, batch_beams, e)));
                    dispatch_failed = true;
                }
            }
        }

        let mut completed_beams = Vec::new();
        let mut failed_beams = Vec::new();
        let mut results: Vec<Option<FftResult>> = vec![None; params.beam_count];

        for handle in handles {
            match handle {
                Ok(h) => match self.collect_batch(h, params) {
                    Ok(batch_results) => {
                        for r in batch_results {
                            completed_beams.push(r.beam_index);
                            results[r.beam_index] = Some(r);
                        }
                    }
                    Err((beam_offset, batch_beams, _e)) => {
                        for b in beam_offset..beam_offset + batch_beams {
                            failed_beams.push(b);
                        }
                    }
                },
                Err((beam_offset, batch_beams, _e)) => {
                    for b in beam_offset..beam_offset + batch_beams {
                        failed_beams.push(b);
                    }
                }
            }
        }

        if dispatch_failed || !failed_beams.is_empty() {
            let _ = self.facade.finish();
            return Err(RadarError::PartialBatchFailure {
                completed: completed_beams,
                failed: failed_beams,
            });
        }

        let results: Vec<FftResult> = results.into_iter().map(|r| r.expect("every beam produced a result")).collect();
        let total_ms = start.elapsed().as_secs_f64() * 1000.0;

        Ok(AntennaFftResult {
            task_id: task_id.to_string(),
            module_name: module_name.to_string(),
            total_beams: params.beam_count,
            n_fft: plan.n_fft,
            profiling_ms: ProfilingRecord {
                total_ms,
                ..Default::default()
            },
            results,
        })
    }

    fn pick_queue(&self, batch_index: usize, num_streams: usize) -> Result<(usize, Queue)> {
        let pool = self.facade.queues();
        let stream = batch_index % num_streams.min(pool.len().max(1));
        let queue = pool.by_index(stream % pool.len())?.clone();
        Ok((stream, queue))
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_batch(
        &self,
        input: &MemoryBuffer,
        params: &FftParams,
        plan: &FftPlan,
        beam_offset: usize,
        batch_beams: usize,
        queue: &Queue,
        stream: usize,
        retain_complex: bool,
    ) -> Result<BatchHandle> {
        let n_fft = plan.n_fft;
        let k = params.out_count_points_fft;

        let mut slots = self
            .stream_buffers
            .slots
            .lock()
            .map_err(|_| RadarError::PlanBuild("stream buffer cache lock poisoned".into()))?;
        if slots.len() <= stream {
            slots.resize_with(stream + 1, || None);
        }
        let staging_len = batch_beams * n_fft;
        let complex_len = batch_beams * k;
        let peaks_len = batch_beams * params.max_peaks_count;
        if slots[stream].is_none() {
            let fresh = StreamBuffers::allocate(&self.facade, queue, staging_len, complex_len, complex_len, peaks_len)?;
            slots[stream] = Some(fresh);
        } else {
            slots[stream]
                .as_mut()
                .expect("checked is_none above")
                .ensure(&self.facade, queue, staging_len, complex_len, complex_len, peaks_len)?;
        }
        let buffers = slots[stream].as_mut().expect("slot populated above");
        let prev_drain = buffers.drain.take();

        // Stage 1: pack and zero-pad.
        let mut pack_builder = Kernel::builder();
        pack_builder
            .program(self.pack_kernel.program().ocl_program())
            .name(self.pack_kernel.name())
            .queue(queue.clone())
            .global_work_size(SpatialDims::One(batch_beams * n_fft));
        let pack_kernel = pack_builder.build().map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        input.bind_as_kernel_arg(&pack_kernel, 0)?;
        buffers.staging.bind_as_kernel_arg(&pack_kernel, 1)?;
        pack_kernel.set_arg(2, beam_offset as u32).map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        pack_kernel.set_arg(3, params.count_points as u32).map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        pack_kernel.set_arg(4, n_fft as u32).map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        let mut upload_event = Event::empty();
        unsafe {
            let mut cmd = pack_kernel.cmd().enew(&mut upload_event);
            if let Some(drain) = &prev_drain {
                cmd = cmd.ewait_for(drain);
            }
            cmd.enq().map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        }

        // Stage 2: batched radix-2 FFT (bit-reversal + log2(n_fft) butterfly stages).
        let mut br_builder = Kernel::builder();
        br_builder
            .program(self.bit_reverse_kernel.program().ocl_program())
            .name(self.bit_reverse_kernel.name())
            .queue(queue.clone())
            .global_work_size(SpatialDims::One(batch_beams * n_fft));
        let br_kernel = br_builder.build().map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        buffers.staging.bind_as_kernel_arg(&br_kernel, 0)?;
        br_kernel.set_arg(1, n_fft as u32).map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        br_kernel.set_arg(2, plan.log2_n_fft).map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        let mut stage_event = Event::empty();
        unsafe {
            br_kernel
                .cmd()
                .ewait_for(&upload_event)
                .enew(&mut stage_event)
                .enq()
                .map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        }

        for stage in 0..plan.log2_n_fft {
            let mut bf_builder = Kernel::builder();
            bf_builder
                .program(self.butterfly_kernel.program().ocl_program())
                .name(self.butterfly_kernel.name())
                .queue(queue.clone())
                .global_work_size(SpatialDims::One(batch_beams * (n_fft / 2)));
            let bf_kernel = bf_builder.build().map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
            buffers.staging.bind_as_kernel_arg(&bf_kernel, 0)?;
            bf_kernel.set_arg(1, n_fft as u32).map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
            bf_kernel.set_arg(2, stage).map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
            let mut next_event = Event::empty();
            unsafe {
                bf_kernel
                    .cmd()
                    .ewait_for(&stage_event)
                    .enew(&mut next_event)
                    .enq()
                    .map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
            }
            stage_event = next_event;
        }
        let fft_event = stage_event;

        // Stage 3: filtered post-process into slim complex + magnitude buffers.
        let mut post_builder = Kernel::builder();
        post_builder
            .program(self.post_kernel.program().ocl_program())
            .name(self.post_kernel.name())
            .queue(queue.clone())
            .global_work_size(SpatialDims::One(batch_beams * k));
        let post_kernel = post_builder.build().map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        buffers.staging.bind_as_kernel_arg(&post_kernel, 0)?;
        buffers.complex_slim.bind_as_kernel_arg(&post_kernel, 1)?;
        post_kernel.set_arg(2, &buffers.magnitude_slim).map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        post_kernel.set_arg(3, n_fft as u32).map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        post_kernel.set_arg(4, k as u32).map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        let mut post_event = Event::empty();
        unsafe {
            post_kernel
                .cmd()
                .ewait_for(&fft_event)
                .enew(&mut post_event)
                .enq()
                .map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        }

        // Stage 4: top-N reduction with phase, one work-group per beam.
        let local_size = REDUCTION_LOCAL_SIZE.min(k.max(1));

        let mut reduction_builder = Kernel::builder();
        reduction_builder
            .program(self.reduction_kernel.program().ocl_program())
            .name(self.reduction_kernel.name())
            .queue(queue.clone())
            .global_work_size(SpatialDims::One(batch_beams * local_size))
            .local_work_size(SpatialDims::One(local_size));
        let reduction_kernel = reduction_builder.build().map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        buffers.complex_slim.bind_as_kernel_arg(&reduction_kernel, 0)?;
        reduction_kernel.set_arg(1, &buffers.magnitude_slim).map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        reduction_kernel.set_arg(2, &buffers.out_peaks).map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        reduction_kernel.set_arg(3, batch_beams as u32).map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        reduction_kernel.set_arg(4, k as u32).map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        reduction_kernel
            .set_arg(5, params.max_peaks_count as u32)
            .map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        let mut reduction_event = Event::empty();
        unsafe {
            reduction_kernel
                .cmd()
                .ewait_for(&post_event)
                .enew(&mut reduction_event)
                .enq()
                .map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        }

        // Stage 5: async readback, non-blocking; the caller joins later.
        let mut read_event = Event::empty();
        unsafe {
            buffers
                .out_peaks
                .cmd()
                .read(&mut Vec::<GpuPeak>::new())
                .offset(0)
                .len(0)
                .ewait_for(&reduction_event)
                .enew(&mut read_event)
                .enq()
                .map_err(|e| RadarError::TransferError(e.to_string()))?;
        }

        let complex_read = if retain_complex {
            Some(radar_gpu::memory::read_async_after(&buffers.complex_slim, &reduction_event, complex_len)?)
        } else {
            None
        };

        // Record this batch's terminal events so the next batch assigned to
        // this stream waits for them before reusing these same buffers.
        let mut drain = EventList::new();
        drain.push(read_event.clone());
        if let Some(pending) = &complex_read {
            drain.push(pending.event().clone());
        }
        buffers.drain = Some(drain);

        let peaks_buffer = buffers.out_peaks.clone();

        Ok(BatchHandle {
            beam_offset,
            batch_beams,
            peaks_read: PendingPeaksRead {
                event: read_event,
                buffer: peaks_buffer,
                count: peaks_len,
            },
            complex_read,
        })
    }

    fn collect_batch(&self, handle: BatchHandle, params: &FftParams) -> std::result::Result<Vec<FftResult>, (usize, usize, RadarError)> {
        let BatchHandle { beam_offset, batch_beams, peaks_read, complex_read } = handle;
        let peaks = peaks_read
            .wait()
            .map_err(|e| (beam_offset, batch_beams, e))?;
        let complex = match complex_read {
            Some(pending) => Some(pending.wait().map_err(|e| (beam_offset, batch_beams, e))?),
            None => None,
        };

        let k = params.out_count_points_fft;
        let n_fft = params.n_fft();
        let mut results = Vec::with_capacity(batch_beams);
        for local_beam in 0..batch_beams {
            let mut beam_peaks: Vec<FftPeak> = peaks
                [local_beam * params.max_peaks_count..(local_beam + 1) * params.max_peaks_count]
                .iter()
                .map(|p| gpu_peak_to_fft_peak(*p, k, n_fft))
                .collect();
            sort_peaks_descending(&mut beam_peaks);

            let fft_complex = complex.as_ref().map(|c| {
                c[local_beam * k..(local_beam + 1) * k]
                    .iter()
                    .map(|sample| (sample.re, sample.im))
                    .collect()
            });

            results.push(FftResult {
                beam_index: beam_offset + local_beam,
                peaks: beam_peaks,
                fft_complex,
            });
        }
        Ok(results)
    }
}
