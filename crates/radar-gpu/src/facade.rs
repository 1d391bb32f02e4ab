//! Single entry point combining device context, program cache, queue pool,
//! and memory layer into one high-level API for kernel launch and buffer
//! management.

use std::sync::Arc;

use ocl::{Event, EventList, Kernel, SpatialDims};
use radar_core::{AccessMode, Complex, RadarError, Result};

use crate::context::{self, DeviceContext, DeviceKind};
use crate::memory::{BufferFactory, BufferStrategy, MemoryBuffer};
use crate::program_cache::{KernelDescriptor, ProgramCache, ProgramCacheStatistics, ProgramHandle};
use crate::queue_pool::{QueuePool, QueuePoolStatistics};

/// Combined statistics across every subsystem the facade owns.
#[derive(Debug, Clone)]
pub struct ComputeStatistics {
    pub programs: ProgramCacheStatistics,
    pub queues: QueuePoolStatistics,
    pub kernel_executions: u64,
}

/// The process-lifetime compute runtime: one device context, one program
/// cache, one queue pool, and a default buffer factory.
///
/// Processors (the fractional-delay kernel, the antenna FFT engine) hold a
/// non-owning `Arc` back to this facade and must not outlive it; by
/// convention the facade is constructed before any processor and dropped
/// after all of them, so ownership of the underlying device state is
/// one-way (Context -> Programs/Queues/Memory -> Facade).
pub struct ComputeFacade {
    context: Arc<DeviceContext>,
    programs: ProgramCache,
    queues: QueuePool,
    buffers: BufferFactory,
    kernel_executions: std::sync::atomic::AtomicU64,
}

impl ComputeFacade {
    /// Initialise the process-wide device context (if not already done) and
    /// build a facade around it with a default-sized queue pool.
    pub fn new(kind: DeviceKind) -> Result<Self> {
        let context = context::initialize(kind)?;
        let queues = QueuePool::new(&context)?;
        let programs = ProgramCache::new(context.clone());
        let buffers = BufferFactory::new(context.clone())?;

        Ok(Self {
            context,
            programs,
            queues,
            buffers,
            kernel_executions: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    pub fn queues(&self) -> &QueuePool {
        &self.queues
    }

    pub fn load_program(&self, source: &str) -> Result<Arc<ProgramHandle>> {
        self.programs.load(source)
    }

    pub fn get_kernel(
        &self,
        program: &Arc<ProgramHandle>,
        name: &str,
    ) -> Result<Arc<KernelDescriptor>> {
        self.programs.get_kernel(program, name)
    }

    pub fn create_buffer(&self, num_elements: usize, access: AccessMode) -> Result<MemoryBuffer> {
        self.buffers.create_buffer(num_elements, access, BufferStrategy::Auto)
    }

    pub fn create_buffer_with_data(&self, data: &[Complex], access: AccessMode) -> Result<MemoryBuffer> {
        self.buffers.create_buffer_with_data(data, access, BufferStrategy::Auto)
    }

    pub fn create_buffer_with_strategy(
        &self,
        num_elements: usize,
        strategy: BufferStrategy,
        access: AccessMode,
    ) -> Result<MemoryBuffer> {
        self.buffers.create_buffer(num_elements, access, strategy)
    }

    fn build_kernel(
        &self,
        descriptor: &KernelDescriptor,
        buffers: &[&MemoryBuffer],
        global: usize,
        local: Option<usize>,
        queue: &ocl::Queue,
    ) -> Result<Kernel> {
        let mut builder = Kernel::builder();
        builder
            .program(descriptor.program().ocl_program())
            .name(descriptor.name())
            .queue(queue.clone())
            .global_work_size(SpatialDims::One(global));
        if let Some(local) = local {
            builder.local_work_size(SpatialDims::One(local));
        }
        let kernel = builder
            .build()
            .map_err(|e| RadarError::KernelLaunch(e.to_string()))?;

        for (i, buf) in buffers.iter().enumerate() {
            buf.bind_as_kernel_arg(&kernel, i as u32)?;
        }
        Ok(kernel)
    }

    /// Bind `buffers` as sequential kernel args, enqueue on a pool queue, and
    /// block until completion.
    pub fn execute_kernel(
        &self,
        descriptor: &KernelDescriptor,
        buffers: &[&MemoryBuffer],
        global: usize,
        local: Option<usize>,
    ) -> Result<()> {
        let queue = self.queues.next();
        let kernel = self.build_kernel(descriptor, buffers, global, local, queue)?;
        unsafe {
            kernel
                .cmd()
                .enq()
                .map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        }
        queue.finish().map_err(|e| RadarError::EventWait(e.to_string()))?;
        self.kernel_executions
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue without blocking; returns the completion event.
    pub fn execute_kernel_async(
        &self,
        descriptor: &KernelDescriptor,
        buffers: &[&MemoryBuffer],
        global: usize,
        local: Option<usize>,
    ) -> Result<Event> {
        let queue = self.queues.next();
        let kernel = self.build_kernel(descriptor, buffers, global, local, queue)?;
        let mut event = Event::empty();
        unsafe {
            kernel
                .cmd()
                .enew(&mut event)
                .enq()
                .map_err(|e| RadarError::KernelLaunch(e.to_string()))?;
        }
        self.kernel_executions
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(event)
    }

    pub fn wait(&self, event: &Event) -> Result<()> {
        event.wait_for().map_err(|e| RadarError::EventWait(e.to_string()))
    }

    pub fn wait_all(&self, events: &[Event]) -> Result<()> {
        let mut list = EventList::new();
        for e in events {
            list.push(e.clone());
        }
        list.wait_for().map_err(|e| RadarError::EventWait(e.to_string()))
    }

    pub fn flush(&self) -> Result<()> {
        self.queues.flush_all()
    }

    pub fn finish(&self) -> Result<()> {
        self.queues.finish_all()
    }

    pub fn statistics(&self) -> ComputeStatistics {
        ComputeStatistics {
            programs: self.programs.statistics(),
            queues: self.queues.statistics(),
            kernel_executions: self.kernel_executions.load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADD_ONE_SOURCE: &str = r#"
        __kernel void add_one(__global float2* buf) {
            uint i = get_global_id(0);
            buf[i].x += 1.0f;
        }
    "#;

    #[test]
    fn execute_kernel_blocks_and_mutates_buffer() {
        let Ok(facade) = ComputeFacade::new(DeviceKind::Default) else {
            log::warn!("no OpenCL device available; skipping facade test");
            return;
        };

        let data: Vec<Complex> = (0..16).map(|i| Complex::new(i as f32, 0.0)).collect();
        let mut buffer = facade
            .create_buffer_with_data(&data, AccessMode::ReadWrite)
            .unwrap();

        let program = facade.load_program(ADD_ONE_SOURCE).unwrap();
        let kernel = facade.get_kernel(&program, "add_one").unwrap();
        facade
            .execute_kernel(&kernel, &[&buffer], data.len(), None)
            .expect("kernel execution should succeed");

        let result = buffer.read().unwrap();
        for (i, c) in result.iter().enumerate() {
            assert!((c.re - (i as f32 + 1.0)).abs() < 1e-5);
        }
    }

    #[test]
    fn statistics_compose_from_subsystems() {
        let Ok(facade) = ComputeFacade::new(DeviceKind::Default) else {
            log::warn!("no OpenCL device available; skipping facade test");
            return;
        };
        let program = facade.load_program(ADD_ONE_SOURCE).unwrap();
        facade.load_program(ADD_ONE_SOURCE).unwrap();
        let _ = program;

        let stats = facade.statistics();
        assert_eq!(stats.programs.misses, 1);
        assert_eq!(stats.programs.hits, 1);
    }
}
