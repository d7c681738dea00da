//! Fiber/Scope: a Worker binding plus a named subset of devices.

use std::collections::HashMap;
use std::sync::Arc;

use crate::device::{Device, DeviceAffinity};
use crate::error::{CoreError, CoreResult};
use crate::system::System;
use crate::worker::Worker;

pub type FiberHandle = Arc<Fiber>;

/// A way to name one of the devices passed to [`Fiber::device`].
pub enum DeviceKey<'a> {
    Name(&'a str),
    Index(usize),
    Device(Arc<Device>),
}

impl<'a> From<&'a str> for DeviceKey<'a> {
    fn from(value: &'a str) -> Self {
        DeviceKey::Name(value)
    }
}
impl From<usize> for DeviceKey<'static> {
    fn from(value: usize) -> Self {
        DeviceKey::Index(value)
    }
}
impl From<Arc<Device>> for DeviceKey<'static> {
    fn from(value: Arc<Device>) -> Self {
        DeviceKey::Device(value)
    }
}

/// A logical thread of execution bound to one [`Worker`] plus a selection of [`Device`]s.
pub struct Fiber {
    worker: Arc<Worker>,
    system: Arc<System>,
    devices: Vec<Arc<Device>>,
    names: Vec<String>,
    name_index: HashMap<String, usize>,
}

impl Fiber {
    /// Constructs a Fiber naming each device `<logical_class><index>`, counting per class from
    /// zero.
    pub fn new(
        worker: Arc<Worker>,
        system: Arc<System>,
        devices: impl IntoIterator<Item = Arc<Device>>,
    ) -> CoreResult<FiberHandle> {
        let devices: Vec<Arc<Device>> = devices.into_iter().collect();
        let mut per_class = HashMap::<String, usize>::new();
        let named = devices
            .iter()
            .map(|d| {
                let class = d.address().logical_class.clone();
                let idx = per_class.entry(class.clone()).or_insert(0);
                let name = format!("{class}{idx}");
                *idx += 1;
                name
            })
            .collect::<Vec<_>>();
        Self::with_named_devices(worker, system, devices.into_iter().zip(named))
    }

    /// Constructs a Fiber from caller-supplied `(class_name, Device)` pairs.
    pub fn with_named_devices(
        worker: Arc<Worker>,
        system: Arc<System>,
        named: impl IntoIterator<Item = (Arc<Device>, String)>,
    ) -> CoreResult<FiberHandle> {
        let mut devices = Vec::new();
        let mut names = Vec::new();
        let mut name_index = HashMap::new();
        for (device, name) in named {
            if name_index.contains_key(&name) {
                return Err(CoreError::invalid_argument(format!(
                    "duplicate device name {name} in fiber"
                )));
            }
            if !system.devices().iter().any(|d| Arc::ptr_eq(d, &device)) {
                return Err(CoreError::invalid_argument(format!(
                    "device {name} is not a member of this fiber's system"
                )));
            }
            let idx = devices.len();
            name_index.insert(name.clone(), idx);
            devices.push(device);
            names.push(name);
        }
        system.mark_attached();
        Ok(Arc::new(Fiber {
            worker,
            system,
            devices,
            names,
            name_index,
        }))
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn system(&self) -> &Arc<System> {
        &self.system
    }

    /// Interned device names, in insertion order.
    pub fn device_names(&self) -> &[String] {
        &self.names
    }

    pub fn raw_device_by_name(&self, name: &str) -> CoreResult<Arc<Device>> {
        self.name_index
            .get(name)
            .map(|&i| self.devices[i].clone())
            .ok_or_else(|| CoreError::invalid_argument(format!("unknown device name {name}")))
    }

    pub fn raw_device_by_index(&self, index: usize) -> CoreResult<Arc<Device>> {
        self.devices
            .get(index)
            .cloned()
            .ok_or_else(|| CoreError::invalid_argument(format!("device index {index} out of range")))
    }

    /// Fails with `InvalidArgument` if `device` isn't one this Fiber was constructed with.
    pub fn raw_device_by_ref(&self, device: &Arc<Device>) -> CoreResult<Arc<Device>> {
        self.devices
            .iter()
            .find(|d| Arc::ptr_eq(d, device))
            .cloned()
            .ok_or_else(|| CoreError::invalid_argument("device not owned by this fiber"))
    }

    fn resolve(&self, key: DeviceKey<'_>) -> CoreResult<Arc<Device>> {
        match key {
            DeviceKey::Name(name) => self.raw_device_by_name(name),
            DeviceKey::Index(idx) => self.raw_device_by_index(idx),
            DeviceKey::Device(d) => self.raw_device_by_ref(&d),
        }
    }

    /// Builds a [`ScopedDevice`] whose affinity is the bitwise OR of each resolved key. Fails
    /// with `InvalidArgument` if any two contributing devices differ on
    /// `(system_class, instance_ordinal)`.
    pub fn device<'a, const N: usize>(
        self: &Arc<Self>,
        keys: [DeviceKey<'a>; N],
    ) -> CoreResult<ScopedDevice> {
        let mut affinity = DeviceAffinity::empty();
        for key in keys {
            let device = self.resolve(key)?;
            affinity = affinity.union(DeviceAffinity::single(device))?;
        }
        Ok(ScopedDevice {
            fiber: Arc::clone(self),
            affinity,
        })
    }

    /// Convenience single-device selector, equivalent to `device([key])`.
    pub fn device_one<'a>(self: &Arc<Self>, key: impl Into<DeviceKey<'a>>) -> CoreResult<ScopedDevice> {
        self.device([key.into()])
    }
}

/// An ephemeral `(Fiber, DeviceAffinity)` value.
#[derive(Clone)]
pub struct ScopedDevice {
    fiber: Arc<Fiber>,
    affinity: DeviceAffinity,
}

impl ScopedDevice {
    pub fn fiber(&self) -> &Arc<Fiber> {
        &self.fiber
    }

    pub fn affinity(&self) -> &DeviceAffinity {
        &self.affinity
    }
}
