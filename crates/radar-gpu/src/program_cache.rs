//! Compiles kernel source once per content hash and caches named kernel
//! entry points per `(program, name)` pair.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use ocl::Program;
use radar_core::{RadarError, Result};

use crate::context::DeviceContext;

/// Hash of a kernel source string, used as the program-cache key so that
/// identical sources compile once regardless of which caller supplied them.
pub type SourceHash = u64;

pub fn hash_source(source: &str) -> SourceHash {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

struct CachedProgram {
    program: Program,
}

/// Maps source string -> compiled `Program`, and caches named kernel handles
/// per program so repeated lookups are O(1).
pub struct ProgramCache {
    context: Arc<DeviceContext>,
    programs: Mutex<HashMap<SourceHash, Arc<CachedProgram>>>,
    kernels: Mutex<HashMap<(SourceHash, String), Arc<KernelDescriptor>>>,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProgramCacheStatistics {
    pub programs: usize,
    pub hits: u64,
    pub misses: u64,
}

impl ProgramCacheStatistics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl ProgramCache {
    pub fn new(context: Arc<DeviceContext>) -> Self {
        Self {
            context,
            programs: Mutex::new(HashMap::new()),
            kernels: Mutex::new(HashMap::new()),
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Compile `source` (or return the cached program on a hash hit).
    pub fn load(&self, source: &str) -> Result<Arc<ProgramHandle>> {
        let key = hash_source(source);
        let mut programs = self
            .programs
            .lock()
            .map_err(|_| RadarError::KernelLaunch("program cache lock poisoned".into()))?;

        if let Some(cached) = programs.get(&key) {
            self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Ok(Arc::new(ProgramHandle {
                key,
                program: cached.clone(),
            }));
        }

        let program = Program::builder()
            .src(source)
            .devices(self.context.device())
            .build(self.context.ocl_context())
            .map_err(|e| RadarError::BuildError { log: e.to_string() })?;

        let cached = Arc::new(CachedProgram { program });
        programs.insert(key, cached.clone());
        self.misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        Ok(Arc::new(ProgramHandle {
            key,
            program: cached,
        }))
    }

    /// Produce a named kernel entry point, cached per `(program, name)` so a
    /// second call for the same pair is O(1).
    pub fn get_kernel(
        &self,
        program: &Arc<ProgramHandle>,
        name: &str,
    ) -> Result<Arc<KernelDescriptor>> {
        let cache_key = (program.key(), name.to_string());
        let mut kernels = self
            .kernels
            .lock()
            .map_err(|_| RadarError::KernelLaunch("kernel cache lock poisoned".into()))?;

        if let Some(descriptor) = kernels.get(&cache_key) {
            return Ok(descriptor.clone());
        }

        // Validate the entry point exists before caching it.
        ocl::Kernel::builder()
            .program(program.ocl_program())
            .name(name)
            .build()
            .map_err(|_| RadarError::KernelNotFound(name.to_string()))?;

        let descriptor = Arc::new(KernelDescriptor {
            program: program.clone(),
            name: name.to_string(),
        });
        kernels.insert(cache_key, descriptor.clone());
        Ok(descriptor)
    }

    pub fn statistics(&self) -> ProgramCacheStatistics {
        let programs = self.programs.lock().map(|p| p.len()).unwrap_or(0);
        ProgramCacheStatistics {
            programs,
            hits: self.hits.load(std::sync::atomic::Ordering::Relaxed),
            misses: self.misses.load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}

/// Reference to one compiled program in the cache.
pub struct ProgramHandle {
    key: SourceHash,
    program: Arc<CachedProgram>,
}

impl ProgramHandle {
    pub fn ocl_program(&self) -> &Program {
        &self.program.program
    }

    pub fn key(&self) -> SourceHash {
        self.key
    }
}

/// A named entry point within a cached program. Cheap to clone; building the
/// actual `ocl::Kernel` bound to a queue happens at dispatch time, since the
/// queue is chosen per-call from the [`crate::queue_pool::QueuePool`].
pub struct KernelDescriptor {
    program: Arc<ProgramHandle>,
    name: String,
}

impl KernelDescriptor {
    pub fn program(&self) -> &Arc<ProgramHandle> {
        &self.program
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{self, DeviceKind};

    const TRIVIAL_SOURCE: &str = r#"
        __kernel void noop(__global float* buf) {
            buf[get_global_id(0)] = buf[get_global_id(0)];
        }
    "#;

    #[test]
    fn loading_same_source_twice_hits_the_cache() {
        let Ok(ctx) = context::initialize(DeviceKind::Default) else {
            log::warn!("no OpenCL device available; skipping program cache test");
            return;
        };
        let cache = ProgramCache::new(ctx);

        let first = cache.load(TRIVIAL_SOURCE).expect("first load should compile");
        let stats = cache.statistics();
        assert_eq!(stats.programs, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);

        let second = cache.load(TRIVIAL_SOURCE).expect("second load should hit cache");
        assert_eq!(first.key(), second.key());

        let stats = cache.statistics();
        assert_eq!(stats.programs, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn get_kernel_is_cached_per_program_and_name() {
        let Ok(ctx) = context::initialize(DeviceKind::Default) else {
            log::warn!("no OpenCL device available; skipping program cache test");
            return;
        };
        let cache = ProgramCache::new(ctx);
        let program = cache.load(TRIVIAL_SOURCE).unwrap();

        let a = cache.get_kernel(&program, "noop").unwrap();
        let b = cache.get_kernel(&program, "noop").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(cache.get_kernel(&program, "missing").is_err());
    }

    #[test]
    fn distinct_sources_each_compile_once() {
        let Ok(ctx) = context::initialize(DeviceKind::Default) else {
            log::warn!("no OpenCL device available; skipping program cache test");
            return;
        };
        let cache = ProgramCache::new(ctx);

        let other_source = TRIVIAL_SOURCE.replace("noop", "noop2");
        cache.load(TRIVIAL_SOURCE).unwrap();
        cache.load(&other_source).unwrap();

        let stats = cache.statistics();
        assert_eq!(stats.programs, 2);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn hash_source_is_stable_and_content_sensitive() {
        assert_eq!(hash_source("a"), hash_source("a"));
        assert_ne!(hash_source("a"), hash_source("b"));
    }
}
