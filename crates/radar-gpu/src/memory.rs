//! Polymorphic device-buffer abstraction: {device-private, SVM coarse-grain,
//! SVM fine-grain}, chosen transparently by a size/capability-driven factory.

use std::sync::Arc;

use ocl::builders::BufferBuilder;
use ocl::{Buffer as OclBuffer, Event, Kernel, Queue};
use radar_core::{AccessMode, Complex, RadarError, Result};

use crate::context::DeviceContext;

/// Device-side complex sample. Bit-identical to [`radar_core::Complex`]; kept
/// as a distinct type in this crate only so it can implement the foreign
/// `OclPrm` marker without violating the orphan rule.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuComplex {
    pub re: f32,
    pub im: f32,
}

unsafe impl ocl::OclPrm for GpuComplex {}

impl From<Complex> for GpuComplex {
    fn from(c: Complex) -> Self {
        GpuComplex { re: c.re, im: c.im }
    }
}

impl From<GpuComplex> for Complex {
    fn from(c: GpuComplex) -> Self {
        Complex { re: c.re, im: c.im }
    }
}

pub fn to_device(samples: &[Complex]) -> &[GpuComplex] {
    bytemuck::cast_slice(samples)
}

pub fn from_device(samples: &[GpuComplex]) -> Vec<Complex> {
    bytemuck::cast_slice(samples).to_vec()
}

/// Which storage strategy backs a [`MemoryBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Regular,
    SvmCoarse,
    SvmFine,
}

/// Explicit or auto-selecting buffer allocation policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BufferStrategy {
    Auto,
    Explicit(BufferKind),
}

impl Default for BufferStrategy {
    fn default() -> Self {
        BufferStrategy::Auto
    }
}

/// Thresholds governing the `Auto` strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferConfig {
    pub threshold_fine_bytes: u64,
    pub threshold_coarse_bytes: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            threshold_fine_bytes: 128 * 1024 * 1024,
            threshold_coarse_bytes: 512 * 1024 * 1024,
        }
    }
}

/// A pending, not-yet-awaited host read. The host model is cooperative with
/// explicit blocking points, so this is a synchronous join rather than a
/// polled `Future`.
pub struct PendingRead {
    event: Event,
    buffer: OclBuffer<GpuComplex>,
}

impl PendingRead {
    pub fn wait(self) -> Result<Vec<Complex>> {
        self.event
            .wait_for()
            .map_err(|e| RadarError::EventWait(e.to_string()))?;
        let mut host = vec![GpuComplex::default(); self.buffer.len()];
        self.buffer
            .read(&mut host)
            .enq()
            .map_err(|e| RadarError::TransferError(e.to_string()))?;
        Ok(host.into_iter().map(Complex::from).collect())
    }
}

/// A device-private buffer, allocated by `clCreateBuffer`-equivalent. May be
/// owning, or non-owning when wrapping an externally created handle.
pub struct RegularBuffer {
    buffer: OclBuffer<GpuComplex>,
    owning: bool,
}

/// An SVM coarse-grain buffer. Host access requires an explicit map/unmap
/// bracket; kernel access uses the raw pointer.
pub struct SvmCoarseBuffer {
    svm: ocl::SvmVec<GpuComplex>,
    queue: Queue,
}

/// An SVM fine-grain buffer. Concurrent host/kernel access without explicit
/// mapping; the caller is responsible for ordering via `finish`.
pub struct SvmFineBuffer {
    svm: ocl::SvmVec<GpuComplex>,
    queue: Queue,
    atomics: bool,
}

/// The polymorphic buffer capability. Callers dispatch uniformly through
/// this enum; they never branch on the variant themselves.
pub enum MemoryBuffer {
    Regular(RegularBuffer),
    SvmCoarse(SvmCoarseBuffer),
    SvmFine(SvmFineBuffer),
}

impl MemoryBuffer {
    pub fn kind(&self) -> BufferKind {
        match self {
            MemoryBuffer::Regular(_) => BufferKind::Regular,
            MemoryBuffer::SvmCoarse(_) => BufferKind::SvmCoarse,
            MemoryBuffer::SvmFine(_) => BufferKind::SvmFine,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            MemoryBuffer::Regular(b) => b.buffer.len(),
            MemoryBuffer::SvmCoarse(b) => b.svm.len(),
            MemoryBuffer::SvmFine(b) => b.svm.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len() * std::mem::size_of::<GpuComplex>()
    }

    /// Whether this buffer's backing device reported atomic support over
    /// fine-grain SVM at allocation time. `Regular` and `SvmCoarse` buffers
    /// never expose SVM atomics, so this is always `false` for them.
    pub fn svm_atomics(&self) -> bool {
        match self {
            MemoryBuffer::SvmFine(b) => b.atomics,
            MemoryBuffer::Regular(_) | MemoryBuffer::SvmCoarse(_) => false,
        }
    }

    /// Blocking write of `src` into the buffer.
    pub fn write(&mut self, src: &[Complex]) -> Result<()> {
        if src.len() != self.len() {
            return Err(RadarError::ShapeMismatch(format!(
                "write of {} elements into buffer of {}",
                src.len(),
                self.len()
            )));
        }
        let device_src = to_device(src);
        match self {
            MemoryBuffer::Regular(b) => b
                .buffer
                .write(device_src)
                .enq()
                .map_err(|e| RadarError::TransferError(e.to_string())),
            MemoryBuffer::SvmCoarse(b) => {
                b.queue
                    .enqueue_svm_map(true, ocl::flags::MapFlags::WRITE_INVALIDATE_REGION, &mut b.svm, None::<&Event>, None)
                    .map_err(|e| RadarError::TransferError(e.to_string()))?;
                b.svm.copy_from_slice(device_src);
                b.queue
                    .enqueue_svm_unmap(&b.svm, None::<&Event>, None)
                    .map_err(|e| RadarError::TransferError(e.to_string()))
            }
            MemoryBuffer::SvmFine(b) => {
                // Fine-grain SVM allows direct host writes without a map/unmap
                // bracket; the caller is responsible for ordering against any
                // in-flight kernel via an explicit `finish` beforehand.
                b.svm.copy_from_slice(device_src);
                Ok(())
            }
        }
    }

    /// Blocking read of the entire buffer.
    pub fn read(&self) -> Result<Vec<Complex>> {
        self.read_partial(self.len())
    }

    /// Blocking read of the first `n` elements.
    pub fn read_partial(&self, n: usize) -> Result<Vec<Complex>> {
        if n > self.len() {
            return Err(RadarError::ShapeMismatch(format!(
                "read_partial({n}) exceeds buffer length {}",
                self.len()
            )));
        }
        match self {
            MemoryBuffer::Regular(b) => {
                let mut host = vec![GpuComplex::default(); n];
                b.buffer
                    .read(&mut host)
                    .enq()
                    .map_err(|e| RadarError::TransferError(e.to_string()))?;
                Ok(from_device(&host))
            }
            MemoryBuffer::SvmCoarse(b) => {
                let mut svm = b.svm.clone();
                b.queue
                    .enqueue_svm_map(true, ocl::flags::MapFlags::READ, &mut svm, None::<&Event>, None)
                    .map_err(|e| RadarError::TransferError(e.to_string()))?;
                let host = from_device(&svm[..n]);
                b.queue
                    .enqueue_svm_unmap(&svm, None::<&Event>, None)
                    .map_err(|e| RadarError::TransferError(e.to_string()))?;
                Ok(host)
            }
            MemoryBuffer::SvmFine(b) => Ok(from_device(&b.svm[..n])),
        }
    }

    /// Non-blocking write, returning an event the caller can wait on.
    pub fn write_async(&mut self, src: &[Complex]) -> Result<Event> {
        if src.len() != self.len() {
            return Err(RadarError::ShapeMismatch(format!(
                "write_async of {} elements into buffer of {}",
                src.len(),
                self.len()
            )));
        }
        let device_src = to_device(src).to_vec();
        match self {
            MemoryBuffer::Regular(b) => {
                let mut event = Event::empty();
                b.buffer
                    .write(&device_src)
                    .enew(&mut event)
                    .enq()
                    .map_err(|e| RadarError::TransferError(e.to_string()))?;
                Ok(event)
            }
            // SVM strategies have no separate async write primitive in this
            // engine: coarse-grain needs a map/unmap bracket that is already
            // synchronous, and fine-grain writes are direct pointer stores.
            MemoryBuffer::SvmCoarse(_) | MemoryBuffer::SvmFine(_) => {
                self.write(src)?;
                Ok(Event::empty())
            }
        }
    }

    /// Non-blocking read; returns an event plus a [`PendingRead`] the caller
    /// joins with `.wait()` once the event fires.
    pub fn read_async(&self) -> Result<PendingRead> {
        match self {
            MemoryBuffer::Regular(b) => {
                let mut event = Event::empty();
                // Enqueue a zero-length marker read purely to obtain a
                // completion event bound to the buffer's command stream; the
                // actual data transfer happens synchronously in `wait()`.
                b.buffer
                    .cmd()
                    .read(&mut Vec::<GpuComplex>::new())
                    .offset(0)
                    .len(0)
                    .enew(&mut event)
                    .enq()
                    .map_err(|e| RadarError::TransferError(e.to_string()))?;
                Ok(PendingRead {
                    event,
                    buffer: b.buffer.clone(),
                })
            }
            MemoryBuffer::SvmCoarse(_) | MemoryBuffer::SvmFine(_) => Err(
                RadarError::TransferError("async readback is only supported for regular device buffers".into()),
            ),
        }
    }
}

/// Non-blocking read that waits on a caller-supplied event before enqueuing,
/// for pipelines that chain a readback off a specific prior stage rather
/// than the buffer's own command stream. Only supported for `Regular`
/// buffers, matching [`MemoryBuffer::read_async`].
///
/// `count` is the number of leading elements to read back; callers whose
/// buffer outlives a single logical use (e.g. a cached, reused buffer sized
/// to the largest batch seen so far) pass the current batch's element count
/// rather than the buffer's full capacity.
pub fn read_async_after(buffer: &MemoryBuffer, after: &Event, count: usize) -> Result<PendingReadHandle> {
    match buffer {
        MemoryBuffer::Regular(b) => {
            let mut event = Event::empty();
            b.buffer
                .cmd()
                .read(&mut Vec::<GpuComplex>::new())
                .offset(0)
                .len(0)
                .ewait_for(after)
                .enew(&mut event)
                .enq()
                .map_err(|e| RadarError::TransferError(e.to_string()))?;
            Ok(PendingReadHandle {
                event,
                buffer: b.buffer.clone(),
                count,
            })
        }
        MemoryBuffer::SvmCoarse(_) | MemoryBuffer::SvmFine(_) => Err(RadarError::TransferError(
            "event-chained async readback is only supported for regular device buffers".into(),
        )),
    }
}

/// A pending host read chained off an explicit prior event rather than the
/// buffer's own command stream; see [`read_async_after`].
pub struct PendingReadHandle {
    event: Event,
    buffer: OclBuffer<GpuComplex>,
    count: usize,
}

impl PendingReadHandle {
    /// The completion event of the chained readback, for callers that need
    /// to gate further reuse of the source buffer on it without blocking.
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn wait(self) -> Result<Vec<Complex>> {
        self.event
            .wait_for()
            .map_err(|e| RadarError::EventWait(e.to_string()))?;
        let mut host = vec![GpuComplex::default(); self.count];
        self.buffer
            .read(&mut host)
            .enq()
            .map_err(|e| RadarError::TransferError(e.to_string()))?;
        Ok(host.into_iter().map(Complex::from).collect())
    }
}

impl MemoryBuffer {
    /// Bind this buffer as kernel argument `index`.
    pub fn bind_as_kernel_arg(&self, kernel: &Kernel, index: u32) -> Result<()> {
        match self {
            MemoryBuffer::Regular(b) => kernel
                .set_arg(index, &b.buffer)
                .map_err(|e| RadarError::KernelLaunch(e.to_string())),
            MemoryBuffer::SvmCoarse(b) => kernel
                .set_arg(index, &b.svm)
                .map_err(|e| RadarError::KernelLaunch(e.to_string())),
            MemoryBuffer::SvmFine(b) => kernel
                .set_arg(index, &b.svm)
                .map_err(|e| RadarError::KernelLaunch(e.to_string())),
        }
    }
}

/// Chooses a [`MemoryBuffer`] variant per a [`BufferConfig`] policy and
/// allocates it against the active device context.
pub struct BufferFactory {
    context: Arc<DeviceContext>,
    config: BufferConfig,
    /// Default command queue stamped onto every `Regular` buffer at build
    /// time, so `read`/`write`/`read_async` can `.enq()` without each call
    /// site having to supply one explicitly.
    default_queue: Queue,
}

impl BufferFactory {
    pub fn new(context: Arc<DeviceContext>) -> Result<Self> {
        Self::with_config(context, BufferConfig::default())
    }

    pub fn with_config(context: Arc<DeviceContext>, config: BufferConfig) -> Result<Self> {
        let default_queue = Queue::new(context.ocl_context(), context.device(), None)
            .map_err(|e| RadarError::ContextCreate(e.to_string()))?;
        Ok(Self {
            context,
            config,
            default_queue,
        })
    }

    fn choose_kind(&self, size_bytes: u64) -> BufferKind {
        let svm = self.context.capabilities().svm;
        if svm.fine_grain_buffer && size_bytes <= self.config.threshold_fine_bytes {
            BufferKind::SvmFine
        } else if svm.coarse_grain_buffer && size_bytes <= self.config.threshold_coarse_bytes {
            BufferKind::SvmCoarse
        } else {
            BufferKind::Regular
        }
    }

    /// Allocate an empty buffer of `num_elements` complex samples.
    pub fn create_buffer(
        &self,
        num_elements: usize,
        access: AccessMode,
        strategy: BufferStrategy,
    ) -> Result<MemoryBuffer> {
        let size_bytes = (num_elements * std::mem::size_of::<GpuComplex>()) as u64;
        let kind = match strategy {
            BufferStrategy::Explicit(kind) => kind,
            BufferStrategy::Auto => self.choose_kind(size_bytes),
        };
        self.allocate(num_elements, access, kind)
    }

    /// Allocate a buffer and upload `data` to it in one step.
    pub fn create_buffer_with_data(
        &self,
        data: &[Complex],
        access: AccessMode,
        strategy: BufferStrategy,
    ) -> Result<MemoryBuffer> {
        let mut buffer = self.create_buffer(data.len(), access, strategy)?;
        buffer.write(data)?;
        Ok(buffer)
    }

    fn ocl_flags(&self, access: AccessMode, kind: BufferKind) -> ocl::flags::MemFlags {
        use ocl::flags::MemFlags;
        // The layer never weakens a request; SVM strategies additionally
        // always allow host + device access since that is the point of SVM.
        let strengthened = if matches!(kind, BufferKind::SvmCoarse | BufferKind::SvmFine) {
            access.strengthen(AccessMode::ReadWrite)
        } else {
            access
        };
        match strengthened {
            AccessMode::ReadOnly => MemFlags::READ_ONLY,
            AccessMode::WriteOnly => MemFlags::WRITE_ONLY,
            AccessMode::ReadWrite => MemFlags::READ_WRITE,
        }
    }

    fn allocate(
        &self,
        num_elements: usize,
        access: AccessMode,
        kind: BufferKind,
    ) -> Result<MemoryBuffer> {
        match kind {
            BufferKind::Regular => {
                let flags = self.ocl_flags(access, kind);
                let builder: BufferBuilder<GpuComplex> = OclBuffer::builder()
                    .context(self.context.ocl_context())
                    .queue(self.default_queue.clone())
                    .flags(flags)
                    .len(num_elements);
                let buffer = builder
                    .build()
                    .map_err(|e| RadarError::OutOfMemory(e.to_string()))?;
                Ok(MemoryBuffer::Regular(RegularBuffer {
                    buffer,
                    owning: true,
                }))
            }
            BufferKind::SvmCoarse => {
                let queue = Queue::new(self.context.ocl_context(), self.context.device(), None)
                    .map_err(|e| RadarError::ContextCreate(e.to_string()))?;
                let svm = ocl::SvmVec::<GpuComplex>::zero(self.context.ocl_context(), num_elements)
                    .map_err(|e| RadarError::OutOfMemory(e.to_string()))?;
                Ok(MemoryBuffer::SvmCoarse(SvmCoarseBuffer { svm, queue }))
            }
            BufferKind::SvmFine => {
                let queue = Queue::new(self.context.ocl_context(), self.context.device(), None)
                    .map_err(|e| RadarError::ContextCreate(e.to_string()))?;
                let svm = ocl::SvmVec::<GpuComplex>::zero(self.context.ocl_context(), num_elements)
                    .map_err(|e| RadarError::OutOfMemory(e.to_string()))?;
                Ok(MemoryBuffer::SvmFine(SvmFineBuffer {
                    svm,
                    queue,
                    atomics: self.context.capabilities().svm.atomics,
                }))
            }
        }
    }

    /// Wrap an externally created OpenCL buffer as a non-owning
    /// [`MemoryBuffer`], validating it belongs to the active context.
    pub fn wrap_non_owning(
        &self,
        buffer: OclBuffer<GpuComplex>,
        buffer_context: &ocl::Context,
    ) -> Result<MemoryBuffer> {
        if !self.context.owns_context(buffer_context) {
            return Err(RadarError::ContextMismatch);
        }
        Ok(MemoryBuffer::Regular(RegularBuffer {
            buffer,
            owning: false,
        }))
    }
}

impl Drop for RegularBuffer {
    fn drop(&mut self) {
        // Non-owning wrappers never release the underlying handle; `ocl`'s
        // `Buffer` release is reference-counted via the driver's own
        // refcounting, so dropping an `ocl::Buffer` clone here is safe either
        // way, but we document the invariant explicitly.
        if !self.owning {
            log::trace!("dropping non-owning regular buffer wrapper without releasing handle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{self, DeviceKind};

    #[test]
    fn regular_buffer_round_trips_data() {
        let Ok(ctx) = context::initialize(DeviceKind::Default) else {
            log::warn!("no OpenCL device available; skipping memory layer test");
            return;
        };
        let factory = BufferFactory::new(ctx).unwrap();
        let data: Vec<Complex> = (0..64).map(|i| Complex::new(i as f32, -(i as f32))).collect();

        let buffer = factory
            .create_buffer_with_data(&data, AccessMode::ReadWrite, BufferStrategy::Explicit(BufferKind::Regular))
            .expect("allocate+upload should succeed");
        let read_back = buffer.read().expect("read should succeed");
        assert_eq!(read_back, data);
    }

    #[test]
    fn auto_strategy_picks_regular_for_huge_buffers() {
        let Ok(ctx) = context::initialize(DeviceKind::Default) else {
            log::warn!("no OpenCL device available; skipping memory layer test");
            return;
        };
        let factory = BufferFactory::new(ctx).unwrap();
        let huge_elements = (600 * 1024 * 1024) / std::mem::size_of::<GpuComplex>();
        let kind = factory.choose_kind((huge_elements * std::mem::size_of::<GpuComplex>()) as u64);
        assert_eq!(kind, BufferKind::Regular);
    }

    #[test]
    fn write_rejects_length_mismatch() {
        let Ok(ctx) = context::initialize(DeviceKind::Default) else {
            log::warn!("no OpenCL device available; skipping memory layer test");
            return;
        };
        let factory = BufferFactory::new(ctx).unwrap();
        let mut buffer = factory
            .create_buffer(4, AccessMode::ReadWrite, BufferStrategy::Explicit(BufferKind::Regular))
            .unwrap();
        let wrong = vec![Complex::ZERO; 5];
        assert!(matches!(buffer.write(&wrong), Err(RadarError::ShapeMismatch(_))));
    }
}
