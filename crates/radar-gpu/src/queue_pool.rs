//! A pool of out-of-order OpenCL command queues with round-robin selection.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ocl::flags::CommandQueueProperties;
use ocl::Queue;
use radar_core::{RadarError, Result};

use crate::context::DeviceContext;

const DEFAULT_QUEUE_COUNT: usize = 4;
const MIN_QUEUE_COUNT: usize = 1;
const MAX_QUEUE_COUNT: usize = 16;

struct PoolQueue {
    queue: Queue,
    uses: AtomicU64,
}

/// `N` out-of-order command streams, selectable round-robin or by index.
pub struct QueuePool {
    queues: Vec<PoolQueue>,
    counter: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct QueuePoolStatistics {
    pub uses_per_queue: Vec<u64>,
}

impl QueuePool {
    /// Build a pool sized to `hardware_concurrency()` (or 4 if unknown),
    /// clamped to `[1, 16]`.
    pub fn new(context: &Arc<DeviceContext>) -> Result<Self> {
        let requested = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(DEFAULT_QUEUE_COUNT);
        Self::with_size(context, requested)
    }

    /// Build a pool with an explicit queue count, clamped to `[1, 16]`.
    pub fn with_size(context: &Arc<DeviceContext>, requested: usize) -> Result<Self> {
        let n = requested.clamp(MIN_QUEUE_COUNT, MAX_QUEUE_COUNT);
        let mut queues = Vec::with_capacity(n);
        for _ in 0..n {
            let queue = Queue::new(
                context.ocl_context(),
                context.device(),
                Some(CommandQueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE | CommandQueueProperties::PROFILING_ENABLE),
            )
            .map_err(|e| RadarError::ContextCreate(e.to_string()))?;
            queues.push(PoolQueue {
                queue,
                uses: AtomicU64::new(0),
            });
        }

        Ok(Self {
            queues,
            counter: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Return the queue at `counter mod N`, atomically advancing the counter.
    pub fn next(&self) -> &Queue {
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        self.queues[idx].uses.fetch_add(1, Ordering::Relaxed);
        &self.queues[idx].queue
    }

    /// Direct, bounds-checked access to queue `i`.
    pub fn by_index(&self, i: usize) -> Result<&Queue> {
        let entry = self
            .queues
            .get(i)
            .ok_or_else(|| RadarError::InvalidConfig(format!("queue index {i} out of range")))?;
        entry.uses.fetch_add(1, Ordering::Relaxed);
        Ok(&entry.queue)
    }

    pub fn finish_all(&self) -> Result<()> {
        for entry in &self.queues {
            entry
                .queue
                .finish()
                .map_err(|e| RadarError::EventWait(e.to_string()))?;
        }
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        for entry in &self.queues {
            entry
                .queue
                .flush()
                .map_err(|e| RadarError::EventWait(e.to_string()))?;
        }
        Ok(())
    }

    pub fn statistics(&self) -> QueuePoolStatistics {
        QueuePoolStatistics {
            uses_per_queue: self
                .queues
                .iter()
                .map(|q| q.uses.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{self, DeviceKind};

    #[test]
    fn size_is_clamped_to_valid_range() {
        let Ok(ctx) = context::initialize(DeviceKind::Default) else {
            log::warn!("no OpenCL device available; skipping queue pool test");
            return;
        };
        let pool = QueuePool::with_size(&ctx, 0).unwrap();
        assert_eq!(pool.len(), MIN_QUEUE_COUNT);

        let pool = QueuePool::with_size(&ctx, 1000).unwrap();
        assert_eq!(pool.len(), MAX_QUEUE_COUNT);
    }

    #[test]
    fn next_round_robins_and_tracks_use_counts() {
        let Ok(ctx) = context::initialize(DeviceKind::Default) else {
            log::warn!("no OpenCL device available; skipping queue pool test");
            return;
        };
        let pool = QueuePool::with_size(&ctx, 4).unwrap();
        for _ in 0..8 {
            pool.next();
        }
        let stats = pool.statistics();
        assert_eq!(stats.uses_per_queue.len(), 4);
        assert!(stats.uses_per_queue.iter().all(|&u| u == 2));
    }

    #[test]
    fn by_index_is_bounds_checked() {
        let Ok(ctx) = context::initialize(DeviceKind::Default) else {
            log::warn!("no OpenCL device available; skipping queue pool test");
            return;
        };
        let pool = QueuePool::with_size(&ctx, 2).unwrap();
        assert!(pool.by_index(0).is_ok());
        assert!(pool.by_index(5).is_err());
    }
}
