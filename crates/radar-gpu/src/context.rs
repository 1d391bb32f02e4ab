//! Process-wide OpenCL device context.
//!
//! There is exactly one platform/device/context per process. Initialisation
//! is guarded by a mutex-protected lifecycle state machine; once
//! initialised, the returned handles are immutable for the remainder of the
//! process. Double-initialisation is a no-op that logs a warning; teardown
//! is idempotent.

use std::sync::{Arc, Mutex, OnceLock};

use ocl::flags::DeviceType;
use ocl::{Context as OclContext, Device, Platform};
use radar_core::{DeviceCapabilities, RadarError, Result, SvmCapabilities};

/// Which kind of device to prefer when selecting among the platform's devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Gpu,
    Cpu,
    Default,
}

impl DeviceKind {
    fn to_ocl(self) -> Option<DeviceType> {
        match self {
            DeviceKind::Gpu => Some(DeviceType::GPU),
            DeviceKind::Cpu => Some(DeviceType::CPU),
            DeviceKind::Default => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialised,
    Initialised,
    TornDown,
}

/// A process-wide, immutable-after-init handle to the selected OpenCL device.
pub struct DeviceContext {
    platform: Platform,
    device: Device,
    context: OclContext,
    capabilities: DeviceCapabilities,
}

impl DeviceContext {
    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn ocl_context(&self) -> &OclContext {
        &self.context
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    /// True if `handle` belongs to this context, used to validate non-owning
    /// buffer wrappers supplied from the outside.
    pub fn owns_context(&self, handle: &OclContext) -> bool {
        handle.as_ptr() == self.context.as_ptr()
    }
}

static INSTANCE: OnceLock<Mutex<Lifecycle>> = OnceLock::new();
static CONTEXT: OnceLock<Arc<DeviceContext>> = OnceLock::new();

fn lifecycle() -> &'static Mutex<Lifecycle> {
    INSTANCE.get_or_init(|| Mutex::new(Lifecycle::Uninitialised))
}

/// Initialise the process-wide device context, selecting a platform/device of
/// the requested kind. Safe to call more than once: a second call is a
/// logged no-op that returns the existing handle.
pub fn initialize(kind: DeviceKind) -> Result<Arc<DeviceContext>> {
    let mut state = lifecycle()
        .lock()
        .map_err(|_| RadarError::ContextCreate("device context lock poisoned".into()))?;

    match *state {
        Lifecycle::Initialised => {
            log::warn!("DeviceContext::initialize called after initialisation; ignoring");
            return Ok(CONTEXT.get().expect("context set when Initialised").clone());
        }
        Lifecycle::TornDown => {
            log::warn!("DeviceContext::initialize called after teardown; ignoring");
            return Err(RadarError::DeviceUnavailable(
                "device context was torn down".into(),
            ));
        }
        Lifecycle::Uninitialised => {}
    }

    let platform = Platform::default();
    let device = select_device(platform, kind)?;
    let context = OclContext::builder()
        .platform(platform)
        .devices(device)
        .build()
        .map_err(|e| RadarError::ContextCreate(e.to_string()))?;

    let capabilities = query_capabilities(&device);

    let ctx = Arc::new(DeviceContext {
        platform,
        device,
        context,
        capabilities,
    });

    CONTEXT
        .set(ctx.clone())
        .map_err(|_| RadarError::ContextCreate("context already set".into()))?;
    *state = Lifecycle::Initialised;

    log::info!(
        "DeviceContext initialised: device={:?} global_mem={}MiB svm={:?}",
        ctx.device.name().unwrap_or_default(),
        ctx.capabilities.global_mem_size / (1024 * 1024),
        ctx.capabilities.svm,
    );

    Ok(ctx)
}

/// Return the current context if one has been initialised.
pub fn instance() -> Option<Arc<DeviceContext>> {
    CONTEXT.get().cloned()
}

/// Idempotently tear down the process-wide context.
pub fn teardown() {
    if let Ok(mut state) = lifecycle().lock() {
        if *state == Lifecycle::Initialised {
            log::info!("DeviceContext torn down");
        }
        *state = Lifecycle::TornDown;
    }
}

fn select_device(platform: Platform, kind: DeviceKind) -> Result<Device> {
    match kind.to_ocl() {
        Some(device_type) => {
            let devices = Device::list(platform, Some(device_type))
                .map_err(|e| RadarError::DeviceUnavailable(e.to_string()))?;
            devices.into_iter().next().ok_or_else(|| {
                RadarError::DeviceUnavailable(format!("no device of kind {kind:?} found"))
            })
        }
        None => Device::first(platform).map_err(|e| RadarError::DeviceUnavailable(e.to_string())),
    }
}

fn query_capabilities(device: &Device) -> DeviceCapabilities {
    let global_mem_size = device.global_mem_size().unwrap_or(0);
    let compute_units = device.max_compute_units().unwrap_or(1);
    let max_work_group_size = device.max_wg_size().unwrap_or(256);
    let preferred_vector_width_float = device
        .info(ocl::enums::DeviceInfo::PreferredVectorWidthFloat)
        .ok()
        .and_then(|info| match info {
            ocl::enums::DeviceInfoResult::PreferredVectorWidthFloat(w) => Some(w),
            _ => None,
        })
        .unwrap_or(1);

    let svm = query_svm_capabilities(device);

    DeviceCapabilities {
        global_mem_size,
        compute_units,
        max_work_group_size,
        preferred_vector_width_float,
        svm,
    }
}

fn query_svm_capabilities(device: &Device) -> SvmCapabilities {
    match device.info(ocl::enums::DeviceInfo::SvmCapabilities) {
        Ok(ocl::enums::DeviceInfoResult::SvmCapabilities(flags)) => SvmCapabilities {
            coarse_grain_buffer: flags.contains(ocl::flags::DeviceSvmCapabilities::COARSE_GRAIN_BUFFER),
            fine_grain_buffer: flags.contains(ocl::flags::DeviceSvmCapabilities::FINE_GRAIN_BUFFER),
            fine_grain_system: flags.contains(ocl::flags::DeviceSvmCapabilities::FINE_GRAIN_SYSTEM),
            atomics: flags.contains(ocl::flags::DeviceSvmCapabilities::ATOMICS),
        },
        _ => {
            log::debug!("device does not report SVM capabilities (pre-OpenCL-2.0 device)");
            SvmCapabilities::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_initialise_is_a_logged_no_op() {
        // Only meaningful on a machine with an OpenCL ICD installed; skip
        // gracefully otherwise, matching the teacher's own hardware-gated tests.
        let Ok(first) = initialize(DeviceKind::Default) else {
            log::warn!("no OpenCL device available; skipping context test");
            return;
        };
        let second = initialize(DeviceKind::Default).expect("second init should reuse context");
        assert!(Arc::ptr_eq(&first, &second));
    }
}
