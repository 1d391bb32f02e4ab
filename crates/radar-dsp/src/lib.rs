//! Signal processors built on top of the `radar-gpu` compute runtime:
//! in-place per-beam fractional delay and the batched antenna FFT / top-N
//! peak extraction pipeline.

pub mod antenna_fft;
pub mod fractional_delay;

pub use antenna_fft::{AntennaFftEngine, AntennaFftStatistics, BatchingConfig, PlanCacheStatistics};
pub use fractional_delay::{DelayProfilingRecord, FractionalDelayConfig, FractionalDelayProcessor};
