//! Process-wide device/driver/allocator registry.
//!
//! A [`System`] is built once via [`SystemBuilder`] and frozen: no device can be added after
//! the first [`Fiber`](crate::fiber::Fiber) attaches.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::device::Device;
use crate::error::{CoreError, CoreResult};

/// Opaque host allocator handle, consumed but never interpreted by this crate.
pub trait HostAllocator: Send + Sync + std::fmt::Debug {}

#[derive(Debug, Default)]
pub struct DefaultHostAllocator;
impl HostAllocator for DefaultHostAllocator {}

/// An opaque driver reference, kept alive for the lifetime of the [`System`] that created it.
pub type DriverHandle = Box<dyn std::any::Any + Send + Sync>;

/// Builds a frozen [`System`].
pub struct SystemBuilder {
    devices: Vec<Arc<Device>>,
    drivers: Vec<DriverHandle>,
    allocator: Arc<dyn HostAllocator>,
}

impl Default for SystemBuilder {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            drivers: Vec::new(),
            allocator: Arc::new(DefaultHostAllocator),
        }
    }
}

impl SystemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn HostAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn add_driver(mut self, driver: DriverHandle) -> Self {
        self.drivers.push(driver);
        self
    }

    /// Registers a device. Devices are not validated for name-uniqueness until [`build`],
    /// matching the distilled spec's emphasis on `device_name` uniqueness as a System-wide
    /// invariant rather than a per-call check.
    ///
    /// [`build`]: SystemBuilder::build
    pub fn add_device(mut self, device: Arc<Device>) -> Self {
        self.devices.push(device);
        self
    }

    pub fn build(self) -> CoreResult<Arc<System>> {
        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.name()) {
                return Err(CoreError::invalid_argument(format!(
                    "duplicate device name {}",
                    device.name()
                )));
            }
        }
        debug!(count = self.devices.len(), "system built with devices");
        Ok(Arc::new(System {
            devices: self.devices,
            drivers: Mutex::new(self.drivers),
            allocator: self.allocator,
            frozen: std::sync::atomic::AtomicBool::new(false),
        }))
    }
}

/// A frozen, process-wide registry of [`Device`]s, drivers and a host allocator.
pub struct System {
    devices: Vec<Arc<Device>>,
    drivers: Mutex<Vec<DriverHandle>>,
    allocator: Arc<dyn HostAllocator>,
    frozen: std::sync::atomic::AtomicBool,
}

impl System {
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn allocator(&self) -> &Arc<dyn HostAllocator> {
        &self.allocator
    }

    pub fn device_by_name(&self, name: &str) -> Option<Arc<Device>> {
        self.devices.iter().find(|d| d.name() == name).cloned()
    }

    /// Marks the System as attached-to, i.e. at least one [`Fiber`](crate::fiber::Fiber) now
    /// holds references into it. Called once by `Fiber::new`/`Fiber::with_names`; subsequent
    /// calls are no-ops, matching the "frozen after first attach" invariant without needing to
    /// reject anything (devices were already immutable after `build()`).
    pub(crate) fn mark_attached(&self) {
        self.frozen
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Drains and drops every registered driver handle. Devices sharing a driver must not be
    /// used afterward; the teardown ordering itself is the caller's responsibility.
    pub fn shutdown_drivers(&self) {
        self.drivers.lock().expect("driver registry poisoned").clear();
    }
}
