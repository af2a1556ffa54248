//! Constraint and affinity evaluation against device attributes

use crate::usage::unit_scale;
use devplace_core::{Attribute, AttributeValue, NodeDeviceResource, RequestedDevice};
use std::cmp::Ordering;

/// Evaluates requests against device groups.
///
/// The allocator only consumes this narrow interface, so schedulers can plug
/// in their own attribute engine.
pub trait DeviceEvaluator: Send + Sync {
    /// Whether the device group is feasible for the request: identity and
    /// every constraint must hold
    fn matches(&self, device: &NodeDeviceResource, ask: &RequestedDevice) -> bool;

    /// Resolve a target expression against a device. `None` when the target
    /// refers to something the device does not have.
    fn resolve_target(&self, target: &str, device: &NodeDeviceResource) -> Option<Attribute>;

    /// Whether `left <operand> right` holds
    fn affinity_satisfied(
        &self,
        operand: &str,
        left: Option<&Attribute>,
        right: Option<&Attribute>,
    ) -> bool;
}

/// Default evaluator over `${device.*}` targets and literal values
#[derive(Debug, Clone, Copy, Default)]
pub struct AttributeEvaluator;

impl DeviceEvaluator for AttributeEvaluator {
    fn matches(&self, device: &NodeDeviceResource, ask: &RequestedDevice) -> bool {
        if !device.id().matches(&ask.id()) {
            return false;
        }

        ask.constraints.iter().all(|c| {
            let left = self.resolve_target(&c.l_target, device);
            let right = self.resolve_target(&c.r_target, device);
            self.affinity_satisfied(&c.operand, left.as_ref(), right.as_ref())
        })
    }

    fn resolve_target(&self, target: &str, device: &NodeDeviceResource) -> Option<Attribute> {
        if !target.starts_with("${") {
            return Some(Attribute::parse(target));
        }

        match target {
            "${device.vendor}" => Some(Attribute::string(&device.vendor)),
            "${device.type}" => Some(Attribute::string(&device.device_type)),
            "${device.model}" => Some(Attribute::string(&device.name)),
            _ => target
                .strip_prefix("${device.attr.")
                .and_then(|rest| rest.strip_suffix('}'))
                .and_then(|key| device.attributes.get(key))
                .cloned(),
        }
    }

    fn affinity_satisfied(
        &self,
        operand: &str,
        left: Option<&Attribute>,
        right: Option<&Attribute>,
    ) -> bool {
        match operand {
            "=" | "==" | "is" => equal(left, right),
            "!=" | "not" => !equal(left, right),
            "<" | "<=" | ">" | ">=" => {
                let (Some(l), Some(r)) = (left, right) else {
                    return false;
                };
                match compare(l, r) {
                    Some(ord) => match operand {
                        "<" => ord == Ordering::Less,
                        "<=" => ord != Ordering::Greater,
                        ">" => ord == Ordering::Greater,
                        _ => ord != Ordering::Less,
                    },
                    None => false,
                }
            }
            "is_set" => left.is_some(),
            "is_not_set" => left.is_none(),
            "set_contains" | "set_contains_all" => set_check(left, right, true),
            "set_contains_any" => set_check(left, right, false),
            _ => false,
        }
    }
}

fn equal(left: Option<&Attribute>, right: Option<&Attribute>) -> bool {
    match (left, right) {
        (Some(l), Some(r)) => compare(l, r) == Some(Ordering::Equal),
        _ => false,
    }
}

/// Order two attributes. Numbers compare across MiB/GiB; otherwise units
/// must be identical.
fn compare(left: &Attribute, right: &Attribute) -> Option<Ordering> {
    match (&left.value, &right.value) {
        (AttributeValue::String(l), AttributeValue::String(r)) => Some(l.cmp(r)),
        (AttributeValue::Bool(l), AttributeValue::Bool(r)) => (l == r).then_some(Ordering::Equal),
        _ => {
            let (l, r) = (left.as_number()?, right.as_number()?);
            let (l, r) = if left.unit == right.unit {
                (l, r)
            } else {
                let l_scale = unit_scale(left.unit.as_deref()?)?;
                let r_scale = unit_scale(right.unit.as_deref()?)?;
                (l * l_scale as f64, r * r_scale as f64)
            };
            l.partial_cmp(&r)
        }
    }
}

/// Comma-separated set membership: `left` must contain all (or any) of the
/// items in `right`
fn set_check(left: Option<&Attribute>, right: Option<&Attribute>, all: bool) -> bool {
    let (Some(l), Some(r)) = (left, right) else {
        return false;
    };

    let (l, r) = (l.to_string(), r.to_string());
    let have: Vec<&str> = l.split(',').map(str::trim).collect();
    let mut want = r.split(',').map(str::trim).filter(|s| !s.is_empty());

    if all {
        want.all(|item| have.contains(&item))
    } else {
        want.any(|item| have.contains(&item))
    }
}
