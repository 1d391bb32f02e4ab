//! Error taxonomy shared by every crate in the engine.
//!
//! Each variant corresponds to one of the failure modes named in the system
//! design: configuration, resource, compilation, execution, readback, and the
//! composite partial-batch-failure case for batched FFT runs.

use thiserror::Error;

/// Unified error type returned by the GPU runtime and signal-processing crates.
#[derive(Debug, Error)]
pub enum RadarError {
    // ---- Configuration ----
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid Lagrange matrix file: {0}")]
    InvalidLagrangeFile(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    // ---- Resource ----
    #[error("no device available matching the requested kind: {0}")]
    DeviceUnavailable(String),

    #[error("failed to create device context: {0}")]
    ContextCreate(String),

    #[error("out of device memory: {0}")]
    OutOfMemory(String),

    #[error("buffer belongs to a different context than the active one")]
    ContextMismatch,

    // ---- Compilation ----
    #[error("kernel build failed:\n{log}")]
    BuildError { log: String },

    #[error("kernel '{0}' not found in compiled program")]
    KernelNotFound(String),

    // ---- Execution ----
    #[error("kernel launch failed: {0}")]
    KernelLaunch(String),

    #[error("FFT plan build failed: {0}")]
    PlanBuild(String),

    #[error("failed waiting on device event: {0}")]
    EventWait(String),

    // ---- Readback ----
    #[error("device-to-host transfer failed: {0}")]
    TransferError(String),

    // ---- Composite ----
    #[error("{} of {} batches failed during antenna FFT", failed.len(), completed.len() + failed.len())]
    PartialBatchFailure {
        /// Indices (in submission order) of batches that completed successfully.
        completed: Vec<usize>,
        /// Indices (in submission order) of batches that failed.
        failed: Vec<usize>,
    },
}

pub type Result<T> = std::result::Result<T, RadarError>;
