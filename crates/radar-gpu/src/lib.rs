//! OpenCL compute runtime for the radar signal processing engine.
//!
//! This crate owns everything that reflects genuinely global device state:
//! the process-wide [`context::DeviceContext`], a content-hashed
//! [`program_cache::ProgramCache`], a round-robin [`queue_pool::QueuePool`],
//! and a [`memory`] layer that picks transparently between device-private
//! and SVM coarse/fine-grain buffers. [`facade::ComputeFacade`] is the single
//! entry point signal processors in `radar-dsp` talk to.
//!
//! ## Ownership
//!
//! The four subsystems form a DAG (Context -> Programs; Context -> Queues;
//! Context + Queues -> Memory; all four -> Facade), so ownership is one-way.
//! Construct one [`facade::ComputeFacade`] before any processor and drop it
//! after all processors are done with it.

pub mod context;
pub mod facade;
pub mod memory;
pub mod program_cache;
pub mod queue_pool;

pub use context::{DeviceContext, DeviceKind};
pub use facade::{ComputeFacade, ComputeStatistics};
pub use memory::{
    read_async_after, BufferConfig, BufferFactory, BufferKind, BufferStrategy, GpuComplex,
    MemoryBuffer, PendingReadHandle,
};
pub use program_cache::{KernelDescriptor, ProgramCache, ProgramCacheStatistics, ProgramHandle};
pub use queue_pool::{QueuePool, QueuePoolStatistics};
