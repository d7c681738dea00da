//! Device identity, address and affinity algebra.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// The addressable identity of a [`Device`].
///
/// `device_name` (see [`Address::device_name`]) is unique within a [`System`](crate::system::System):
/// `{system_class}:{instance_ordinal}:{queue_ordinal}@{t0},{t1},...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub system_class: String,
    pub logical_class: String,
    pub driver_prefix: String,
    pub instance_ordinal: u32,
    pub queue_ordinal: u32,
    pub topology: Vec<u32>,
}

impl Address {
    pub fn new(
        system_class: impl Into<String>,
        logical_class: impl Into<String>,
        driver_prefix: impl Into<String>,
        instance_ordinal: u32,
        queue_ordinal: u32,
        topology: Vec<u32>,
    ) -> Self {
        Self {
            system_class: system_class.into(),
            logical_class: logical_class.into(),
            driver_prefix: driver_prefix.into(),
            instance_ordinal,
            queue_ordinal,
            topology,
        }
    }

    /// The `(system_class, instance_ordinal)` pair that device-selection rules key affinity
    /// compatibility on.
    pub fn instance_key(&self) -> (&str, u32) {
        (&self.system_class, self.instance_ordinal)
    }

    pub fn device_name(&self) -> String {
        let topo = self
            .topology
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{}:{}:{}@{}",
            self.system_class, self.instance_ordinal, self.queue_ordinal, topo
        )
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.device_name())
    }
}

/// A single device known to a [`System`](crate::system::System).
///
/// The opaque HAL handle is intentionally untyped here: driver/device construction is an
/// external collaborator this crate consumes but never interprets.
pub struct Device {
    address: Address,
    hal_handle: Box<dyn std::any::Any + Send + Sync>,
    numa_node: Option<u32>,
    node_locked: bool,
}

impl Device {
    pub fn new(
        address: Address,
        hal_handle: Box<dyn std::any::Any + Send + Sync>,
        numa_node: Option<u32>,
        node_locked: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            address,
            hal_handle,
            numa_node,
            node_locked,
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn hal_handle(&self) -> &(dyn std::any::Any + Send + Sync) {
        self.hal_handle.as_ref()
    }

    pub fn numa_node(&self) -> Option<u32> {
        self.numa_node
    }

    pub fn node_locked(&self) -> bool {
        self.node_locked
    }

    pub fn name(&self) -> String {
        self.address.device_name()
    }

    /// The affinity that selects exactly this device's own queue.
    pub fn self_affinity(self: &Arc<Self>) -> DeviceAffinity {
        DeviceAffinity::single(self.clone())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("numa_node", &self.numa_node)
            .field("node_locked", &self.node_locked)
            .finish()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}
impl Eq for Device {}

/// A `(Device, queue_mask)` pair used to select and combine queues across devices for
/// scheduling.
///
/// Queue masks are at most 64 bits wide, matching the "≤64 queues" invariant of the data
/// model: the mask type itself is the enforcement.
#[derive(Debug, Clone)]
pub struct DeviceAffinity {
    device: Option<Arc<Device>>,
    queue_mask: u64,
}

impl DeviceAffinity {
    /// The empty affinity: no device, no queues. Valid only for `NONE`/`UNKNOWN` invocation
    /// models at schedule time.
    pub fn empty() -> Self {
        Self {
            device: None,
            queue_mask: 0,
        }
    }

    /// The affinity selecting exactly `device`'s own queue.
    pub fn single(device: Arc<Device>) -> Self {
        let queue_mask = 1u64 << (device.address().queue_ordinal as u64 % 64);
        Self {
            device: Some(device),
            queue_mask,
        }
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    pub fn queue_mask(&self) -> u64 {
        self.queue_mask
    }

    pub fn is_empty(&self) -> bool {
        self.device.is_none()
    }

    /// Combine two affinities. Fails with [`CoreError::InvalidArgument`] if both sides name a
    /// device and those devices disagree on `(system_class, instance_ordinal)`.
    pub fn union(self, other: DeviceAffinity) -> CoreResult<DeviceAffinity> {
        match (self.device, other.device) {
            (None, None) => Ok(DeviceAffinity {
                device: None,
                queue_mask: self.queue_mask | other.queue_mask,
            }),
            (Some(d), None) => Ok(DeviceAffinity {
                device: Some(d),
                queue_mask: self.queue_mask | other.queue_mask,
            }),
            (None, Some(d)) => Ok(DeviceAffinity {
                device: Some(d),
                queue_mask: self.queue_mask | other.queue_mask,
            }),
            (Some(a), Some(b)) => {
                if a.address().instance_key() != b.address().instance_key() {
                    return Err(CoreError::invalid_argument(format!(
                        "cannot union affinities across device instances {} and {}",
                        a.name(),
                        b.name()
                    )));
                }
                Ok(DeviceAffinity {
                    device: Some(a),
                    queue_mask: self.queue_mask | other.queue_mask,
                })
            }
        }
    }
}

impl std::ops::BitOr for DeviceAffinity {
    type Output = CoreResult<DeviceAffinity>;

    fn bitor(self, rhs: DeviceAffinity) -> Self::Output {
        self.union(rhs)
    }
}
