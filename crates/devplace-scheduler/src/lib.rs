//! devplace-scheduler: device accounting and placement for one node
//!
//! This crate answers, for a single scheduling attempt on a single node:
//! - Which device instances are free and how heavily shared the rest are
//! - Which instances to offer a device request, and with what score
//! - Whether the shared capacity of a device group is still respected

pub mod accounter;
pub mod allocator;
pub mod feasibility;
pub mod usage;

pub use accounter::{DeviceAccounter, DeviceAccounterInstance, DeviceGroupStatus};
pub use allocator::DeviceAllocator;
pub use feasibility::{AttributeEvaluator, DeviceEvaluator};

#[cfg(test)]
mod test_utils;
