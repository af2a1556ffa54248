//! Shared capacity accounting for devices that support co-location
//!
//! Quantities are expressed in MiB-equivalents. `GiB` converts with a decimal
//! factor of 1000, not 1024; running allocations were recorded with this
//! factor and usage must stay comparable to them.

use crate::accounter::{DeviceAccounter, DeviceAccounterInstance};
use devplace_core::{Allocation, Attribute, Constraint, DeviceIdTuple, TaskResources};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const MIB: &str = "MiB";
pub const GIB: &str = "GiB";

/// MiB-equivalents per GiB
pub const GIB_FACTOR: i64 = 1000;

/// Multiplier from `unit` to MiB-equivalents
pub(crate) fn unit_scale(unit: &str) -> Option<i64> {
    match unit {
        MIB => Some(1),
        GIB => Some(GIB_FACTOR),
        _ => None,
    }
}

/// Constraint target naming a device attribute, e.g. `${device.attr.memory}`
pub fn attribute_target(attribute: &str) -> String {
    format!("${{device.attr.{}}}", attribute)
}

/// Parse a requested quantity such as `"2000 MiB"` or `"1.5 GiB"`.
/// Negative, infinite and NaN quantities are unusable and yield `None`.
pub fn parse_requested_quantity(target: &str) -> Option<i64> {
    let parts: Vec<&str> = target.split_whitespace().collect();
    let [number, unit] = parts.as_slice() else {
        return None;
    };

    let value: f64 = number.parse().ok()?;
    let scaled = value * unit_scale(unit)? as f64;
    if !scaled.is_finite() || scaled < 0.0 {
        return None;
    }
    // Saturates at i64::MAX for huge finite values
    Some(scaled as i64)
}

/// Declared capacity of a device attribute in MiB-equivalents
pub fn normalize_capacity(attr: &Attribute) -> Option<i64> {
    let scale = unit_scale(attr.unit.as_deref()?)?;

    if let Some(value) = attr.as_int() {
        return value.checked_mul(scale);
    }
    attr.as_float().map(|value| (value * scale as f64) as i64)
}

fn is_lower_bound(operand: &str) -> bool {
    matches!(operand, ">" | ">=")
}

/// Quantity requested through the first lower-bound constraint on `attribute`
pub fn requested_quantity(constraints: &[Constraint], attribute: &str) -> Option<i64> {
    let target = attribute_target(attribute);
    constraints
        .iter()
        .find(|c| c.l_target == target && is_lower_bound(&c.operand))
        .and_then(|c| parse_requested_quantity(&c.r_target))
}

/// Quantity a task requested from the given device group
fn task_quantity(requested: &TaskResources, group: &DeviceIdTuple, attribute: &str) -> Option<i64> {
    requested
        .devices
        .iter()
        .filter(|ask| group.matches(&ask.id()))
        .find_map(|ask| requested_quantity(&ask.constraints, attribute))
}

impl DeviceAccounterInstance {
    /// Sum of the quantities running allocations requested from each
    /// instance of this group. Instances nobody uses report 0.
    pub fn aggregate_usage(
        &self,
        ask: &DeviceIdTuple,
        allocs: &[Allocation],
        attribute: &str,
    ) -> BTreeMap<String, i64> {
        let mut usage: BTreeMap<String, i64> =
            self.instances.keys().map(|id| (id.clone(), 0)).collect();

        for alloc in allocs.iter().filter(|a| !a.is_terminal()) {
            let Some(resources) = &alloc.allocated_resources else {
                continue;
            };

            for (task, assigned) in &resources.tasks {
                for device in assigned.devices.iter().filter(|d| d.id().matches(ask)) {
                    let quantity = alloc
                        .task_resources
                        .get(task)
                        .and_then(|r| task_quantity(r, &device.id(), attribute));
                    let Some(quantity) = quantity else {
                        continue;
                    };

                    for instance_id in &device.device_ids {
                        if let Some(used) = usage.get_mut(instance_id) {
                            *used = used.saturating_add(quantity);
                        }
                    }
                }
            }
        }

        debug!(device = %self.device.id(), usage = ?usage, "Computed shared device usage");
        usage
    }

    /// Whether every instance of this group stays within the capacity the
    /// device declares for `attribute`. A missing or unparsable capacity
    /// fails the check.
    pub fn within_capacity(
        &self,
        ask: &DeviceIdTuple,
        allocs: &[Allocation],
        attribute: &str,
    ) -> bool {
        let id = self.device.id();
        let Some(capacity) = self
            .device
            .attributes
            .get(attribute)
            .and_then(normalize_capacity)
        else {
            warn!(device = %id, attribute, "Device declares no usable capacity");
            return false;
        };

        for (instance_id, used) in self.aggregate_usage(ask, allocs, attribute) {
            if used > capacity {
                warn!(
                    device = %id,
                    instance = %instance_id,
                    used,
                    capacity,
                    "Device instance over capacity"
                );
                return false;
            }
        }

        true
    }
}

impl DeviceAccounter {
    /// Admission check for a shared device request: the first matching
    /// group must stay within capacity on every instance.
    pub fn check_capacity(&self, ask: &DeviceIdTuple, allocs: &[Allocation], attribute: &str) -> bool {
        match self.find_matching(ask) {
            Some((_, group)) => group.within_capacity(ask, allocs, attribute),
            None => false,
        }
    }
}
