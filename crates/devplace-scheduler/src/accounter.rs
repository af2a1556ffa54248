//! Per-node accounting of device instance usage

use devplace_core::{
    AllocatedDeviceResource, Allocation, CollisionPolicy, DeviceIdTuple, Node, NodeDeviceResource,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Tracks how many occupants use each healthy device instance of a node.
///
/// Built once per scheduling attempt from the node inventory. Usage is a
/// count rather than a flag: an instance may be shared by several
/// allocations.
#[derive(Debug, Clone)]
pub struct DeviceAccounter {
    /// Device groups indexed by identity
    pub(crate) devices: BTreeMap<DeviceIdTuple, DeviceAccounterInstance>,
    /// Collision reporting for running allocations
    collision_policy: CollisionPolicy,
}

/// A device group together with the usage of its healthy instances
#[derive(Debug, Clone)]
pub struct DeviceAccounterInstance {
    /// The device group as reported by the node
    pub(crate) device: NodeDeviceResource,
    /// Usage per instance identifier; 0 means unused
    pub(crate) instances: BTreeMap<String, u32>,
}

impl DeviceAccounterInstance {
    fn new(device: &NodeDeviceResource) -> Self {
        // Unhealthy instances are not allocatable and are never tracked
        let instances = device
            .instances
            .iter()
            .filter(|i| i.healthy)
            .map(|i| (i.id.clone(), 0))
            .collect();

        Self {
            device: device.clone(),
            instances,
        }
    }

    /// The device group definition
    pub fn device(&self) -> &NodeDeviceResource {
        &self.device
    }

    /// Usage of every tracked instance
    pub fn instances(&self) -> &BTreeMap<String, u32> {
        &self.instances
    }

    /// Usage of a single instance, if it is tracked
    pub fn usage(&self, instance_id: &str) -> Option<u32> {
        self.instances.get(instance_id).copied()
    }

    /// Number of instances nobody uses
    pub fn free_count(&self) -> usize {
        self.instances.values().filter(|&&u| u == 0).count()
    }

    /// Instance with the lowest usage; ties go to the lowest identifier
    pub fn least_loaded(&self) -> Option<(&str, u32)> {
        self.instances
            .iter()
            .min_by_key(|(_, usage)| **usage)
            .map(|(id, usage)| (id.as_str(), *usage))
    }
}

impl DeviceAccounter {
    /// Create an accounter that allows running allocations to share instances
    pub fn new(node: &Node) -> Self {
        Self::with_policy(node, CollisionPolicy::Shared)
    }

    /// Create an accounter with an explicit collision policy
    pub fn with_policy(node: &Node, collision_policy: CollisionPolicy) -> Self {
        let devices = node
            .devices()
            .iter()
            .map(|d| (d.id(), DeviceAccounterInstance::new(d)))
            .collect();

        Self {
            devices,
            collision_policy,
        }
    }

    pub fn collision_policy(&self) -> CollisionPolicy {
        self.collision_policy
    }

    /// Whether the node has no device groups at all
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Number of device groups
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Device groups in identity order
    pub fn devices(&self) -> impl Iterator<Item = (&DeviceIdTuple, &DeviceAccounterInstance)> {
        self.devices.iter()
    }

    /// Device group with exactly this identity
    pub fn get(&self, id: &DeviceIdTuple) -> Option<&DeviceAccounterInstance> {
        self.devices.get(id)
    }

    /// First device group, in identity order, whose identity satisfies `ask`
    pub fn find_matching(
        &self,
        ask: &DeviceIdTuple,
    ) -> Option<(&DeviceIdTuple, &DeviceAccounterInstance)> {
        self.devices.iter().find(|(id, _)| id.matches(ask))
    }

    /// Mark the instances used by running allocations.
    ///
    /// Terminal allocations and allocations without per-task device
    /// accounting are skipped, as are instances the node no longer reports
    /// as healthy. Under [`CollisionPolicy::Shared`] an instance used more
    /// than once is not a collision and `false` is always returned.
    pub fn add_allocs(&mut self, allocs: &[Allocation]) -> bool {
        let report = self.collision_policy == CollisionPolicy::Exclusive;
        let mut collision = false;

        for alloc in allocs {
            if alloc.is_terminal() {
                continue;
            }

            let Some(resources) = &alloc.allocated_resources else {
                continue;
            };

            for task in resources.tasks.values() {
                for device in &task.devices {
                    let Some(group) = self.devices.get_mut(&device.id()) else {
                        continue;
                    };

                    for instance_id in &device.device_ids {
                        if let Some(usage) = group.instances.get_mut(instance_id) {
                            if *usage != 0 {
                                debug!(
                                    alloc_id = %alloc.id,
                                    device = %device.id(),
                                    instance = %instance_id,
                                    usage = *usage,
                                    "Device instance shared by running allocations"
                                );
                                collision |= report;
                            }
                            *usage += 1;
                        }
                    }
                }
            }
        }

        collision
    }

    /// Mark the instances of a plan-time reservation as used. Returns true if
    /// any of them was already in use; usage is incremented regardless.
    pub fn add_reserved(&mut self, reserved: &AllocatedDeviceResource) -> bool {
        let Some(group) = self.devices.get_mut(&reserved.id()) else {
            return false;
        };

        let mut collision = false;
        for instance_id in &reserved.device_ids {
            if let Some(usage) = group.instances.get_mut(instance_id) {
                if *usage != 0 {
                    collision = true;
                }
                *usage += 1;
            }
        }

        if collision {
            debug!(device = %reserved.id(), instances = ?reserved.device_ids, "Reservation collides with used instances");
        }

        collision
    }

    /// Usage summary of every device group
    pub fn usage_report(&self) -> Vec<DeviceGroupStatus> {
        self.devices
            .iter()
            .map(|(id, group)| DeviceGroupStatus {
                id: id.clone(),
                total: group.instances.len(),
                free: group.free_count(),
                instances: group.instances.clone(),
            })
            .collect()
    }
}

/// Device group with usage information
#[derive(Debug, Clone, Serialize)]
pub struct DeviceGroupStatus {
    /// Group identity
    pub id: DeviceIdTuple,
    /// Number of healthy instances
    pub total: usize,
    /// Number of unused instances
    pub free: usize,
    /// Usage per instance
    pub instances: BTreeMap<String, u32>,
}
