//! Device allocator for assigning device instances to requests

use crate::accounter::{DeviceAccounter, DeviceAccounterInstance};
use crate::feasibility::{AttributeEvaluator, DeviceEvaluator};
use devplace_core::{
    AllocatedDeviceResource, Allocation, DeviceIdTuple, DevplaceError, DevplaceResult, Node,
    NodeDeviceResource, RequestedDevice, SharingConfig,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Assigns device instances of one node to device requests.
///
/// Offers are proposals only. Usage is not updated by assigning; callers
/// commit an offer through [`DeviceAllocator::add_reserved`].
pub struct DeviceAllocator {
    /// Usage of the node's devices
    accounter: DeviceAccounter,
    /// Constraint and affinity evaluation
    evaluator: Arc<dyn DeviceEvaluator>,
    /// Sharing configuration
    config: SharingConfig,
}

impl DeviceAllocator {
    /// Create an allocator for a node using the default attribute evaluator
    pub fn new(node: &Node, config: SharingConfig) -> Self {
        Self::with_evaluator(node, config, Arc::new(AttributeEvaluator))
    }

    /// Create an allocator with a custom evaluator
    pub fn with_evaluator(
        node: &Node,
        config: SharingConfig,
        evaluator: Arc<dyn DeviceEvaluator>,
    ) -> Self {
        Self {
            accounter: DeviceAccounter::with_policy(node, config.collision_policy),
            evaluator,
            config,
        }
    }

    pub fn accounter(&self) -> &DeviceAccounter {
        &self.accounter
    }

    pub fn config(&self) -> &SharingConfig {
        &self.config
    }

    /// Mark devices used by running allocations, see [`DeviceAccounter::add_allocs`]
    pub fn add_allocs(&mut self, allocs: &[Allocation]) -> bool {
        self.accounter.add_allocs(allocs)
    }

    /// Mark a reservation as used, see [`DeviceAccounter::add_reserved`]
    pub fn add_reserved(&mut self, reserved: &AllocatedDeviceResource) -> bool {
        self.accounter.add_reserved(reserved)
    }

    /// Assign a request, routing shareable device types to
    /// [`DeviceAllocator::assign_shared`] and everything else to
    /// [`DeviceAllocator::assign_device`]
    pub fn assign(
        &self,
        ask: &RequestedDevice,
        allocs: &[Allocation],
    ) -> DevplaceResult<(AllocatedDeviceResource, f64)> {
        if self.config.is_shared_type(&ask.id().device_type) {
            self.assign_shared(ask, allocs)
        } else {
            self.assign_device(ask)
        }
    }

    fn check_request(&self, ask: &RequestedDevice) -> DevplaceResult<()> {
        if self.accounter.is_empty() {
            return Err(DevplaceError::NoDevicesAvailable);
        }
        if ask.count == 0 {
            return Err(DevplaceError::InvalidRequest(format!(
                "zero devices requested for {}",
                ask.name
            )));
        }
        Ok(())
    }

    /// Assign the best scoring feasible device group.
    ///
    /// Returns the offer and the sum of the affinity weights the chosen group
    /// matched. Groups are scored in identity order and a later group wins a
    /// tie. Instances are not reserved exclusively: the least used instance
    /// is offered `count` times, so no request fails for lack of free
    /// instances.
    pub fn assign_device(
        &self,
        ask: &RequestedDevice,
    ) -> DevplaceResult<(AllocatedDeviceResource, f64)> {
        self.check_request(ask)?;

        let mut offer: Option<AllocatedDeviceResource> = None;
        let mut offer_score = 0.0;
        let mut matched_weights = 0.0;

        for (id, group) in self.accounter.devices() {
            if !self.evaluator.matches(group.device(), ask) {
                debug!(device = %id, request = %ask.name, "Device group infeasible");
                continue;
            }

            let Some((instance_id, usage)) = group.least_loaded() else {
                debug!(device = %id, "Device group has no healthy instances");
                continue;
            };

            let (score, sum_matched) = self.score(group.device(), ask);
            debug!(device = %id, score, sum_matched, "Scored device group");

            if offer.is_some() && score < offer_score {
                continue;
            }

            offer_score = score;
            matched_weights = sum_matched;

            let mut choice = AllocatedDeviceResource::for_group(id, ask.count as usize);
            for _ in 0..ask.count {
                choice.device_ids.push(instance_id.to_string());
            }

            debug!(device = %id, instance = %instance_id, usage, "Selected least loaded instance");
            offer = Some(choice);
        }

        let offer = offer.ok_or_else(|| DevplaceError::NoMatch(ask.name.clone()))?;

        info!(
            device = %offer.id(),
            instances = ?offer.device_ids,
            score = offer_score,
            "Assigned devices"
        );

        Ok((offer, matched_weights))
    }

    /// Normalized affinity score and the sum of matched affinity weights
    fn score(&self, device: &NodeDeviceResource, ask: &RequestedDevice) -> (f64, f64) {
        let mut total_weight = 0.0;
        let mut sum_matched = 0.0;

        for affinity in &ask.affinities {
            let left = self.evaluator.resolve_target(&affinity.l_target, device);
            let right = self.evaluator.resolve_target(&affinity.r_target, device);

            let weight = f64::from(affinity.weight);
            total_weight += weight.abs();

            if self
                .evaluator
                .affinity_satisfied(&affinity.operand, left.as_ref(), right.as_ref())
            {
                sum_matched += weight;
            }
        }

        if total_weight == 0.0 {
            return (0.0, sum_matched);
        }
        (sum_matched / total_weight, sum_matched)
    }

    /// Assign a shareable device by remaining capacity.
    ///
    /// Picks the first device group matching the request's identity and
    /// offers its instance with the lowest aggregate requested capacity
    /// (lowest identifier on ties), repeated `count` times. Capacity itself
    /// is not checked here; run [`DeviceAccounter::check_capacity`] before
    /// committing the offer. The score is always 0.
    pub fn assign_shared(
        &self,
        ask: &RequestedDevice,
        allocs: &[Allocation],
    ) -> DevplaceResult<(AllocatedDeviceResource, f64)> {
        self.check_request(ask)?;

        let ask_id = ask.id();
        let (id, group) = self
            .accounter
            .find_matching(&ask_id)
            .ok_or_else(|| DevplaceError::NoMatchingDevice(ask.name.clone()))?;

        let (instance_id, used) = self.least_used(group, &ask_id, allocs).ok_or_else(|| {
            DevplaceError::UsageComputation(format!("no instances tracked for {}", id))
        })?;

        let mut offer = AllocatedDeviceResource::for_group(id, ask.count as usize);
        for _ in 0..ask.count {
            offer.device_ids.push(instance_id.clone());
        }

        info!(
            device = %id,
            instance = %instance_id,
            used,
            count = ask.count,
            "Assigned shared device"
        );

        Ok((offer, 0.0))
    }

    fn least_used(
        &self,
        group: &DeviceAccounterInstance,
        ask: &DeviceIdTuple,
        allocs: &[Allocation],
    ) -> Option<(String, i64)> {
        group
            .aggregate_usage(ask, allocs, &self.config.capacity_attribute)
            .into_iter()
            .min_by_key(|(_, used)| *used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use devplace_core::{Affinity, Attribute, CollisionPolicy, NodeDevice};

    fn create_test_node() -> Node {
        node_with(vec![
            gpu_group(
                "a100",
                Attribute::int(40, Some("GiB")),
                &[("GPU-0", true), ("GPU-1", true)],
            ),
            gpu_group("t4", Attribute::int(16, Some("GiB")), &[("GPU-2", true)]),
        ])
    }

    fn create_test_allocator() -> DeviceAllocator {
        DeviceAllocator::new(&create_test_node(), SharingConfig::default())
    }

    #[test]
    fn test_empty_node_fails() {
        let allocator = DeviceAllocator::new(&Node::default(), SharingConfig::default());
        let ask = RequestedDevice::new("gpu", 1);

        assert!(matches!(
            allocator.assign_device(&ask),
            Err(DevplaceError::NoDevicesAvailable)
        ));
        assert!(matches!(
            allocator.assign_shared(&ask, &[]),
            Err(DevplaceError::NoDevicesAvailable)
        ));
    }

    #[test]
    fn test_zero_count_fails() {
        let allocator = create_test_allocator();
        let ask = RequestedDevice::new("gpu", 0);

        assert!(matches!(
            allocator.assign_device(&ask),
            Err(DevplaceError::InvalidRequest(_))
        ));
        assert!(matches!(
            allocator.assign_shared(&ask, &[]),
            Err(DevplaceError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_assign_device_no_match() {
        let allocator = create_test_allocator();

        let result = allocator.assign_device(&RequestedDevice::new("amd/gpu", 1));
        assert!(matches!(result, Err(DevplaceError::NoMatch(_))));

        let result = allocator.assign_device(&memory_request(1, "64 GiB"));
        assert!(matches!(result, Err(DevplaceError::NoMatch(_))));
    }

    #[test]
    fn test_assign_device_duplicates_when_short() {
        let allocator = create_test_allocator();
        let ask = RequestedDevice::new("nvidia/gpu/t4", 2);

        let (offer, score) = allocator.assign_device(&ask).unwrap();
        assert_eq!(offer.id(), gpu_id("t4"));
        assert_eq!(offer.device_ids, vec!["GPU-2", "GPU-2"]);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_assign_device_picks_least_loaded() {
        let node = create_test_node();
        let mut allocator = DeviceAllocator::new(&node, SharingConfig::default());
        allocator.add_allocs(&[running_alloc("train", &node.devices()[0], &["GPU-0"], "1 GiB")]);

        let (offer, _) = allocator
            .assign_device(&RequestedDevice::new("nvidia/gpu/a100", 2))
            .unwrap();
        assert_eq!(offer.device_ids, vec!["GPU-1", "GPU-1"]);
    }

    #[test]
    fn test_assign_device_tie_goes_to_later_group() {
        let allocator = create_test_allocator();

        // a100 and t4 both score 0; t4 comes later in identity order
        let (offer, _) = allocator
            .assign_device(&RequestedDevice::new("gpu", 1))
            .unwrap();
        assert_eq!(offer.id(), gpu_id("t4"));
    }

    #[test]
    fn test_assign_device_affinity_scoring() {
        let allocator = create_test_allocator();

        let mut ask = RequestedDevice::new("nvidia/gpu", 1);
        ask.affinities
            .push(Affinity::new("${device.model}", "=", "a100", 50));
        ask.affinities
            .push(Affinity::new("${device.attr.memory}", ">=", "32 GiB", 25));
        ask.affinities
            .push(Affinity::new("${device.model}", "=", "t4", -20));

        let (offer, matched) = allocator.assign_device(&ask).unwrap();
        assert_eq!(offer.id(), gpu_id("a100"));
        assert_eq!(offer.device_ids, vec!["GPU-0"]);
        // Sum of matched weights, not the normalized score
        assert_eq!(matched, 75.0);
    }

    #[test]
    fn test_assign_device_negative_affinity() {
        let allocator = create_test_allocator();

        let mut ask = RequestedDevice::new("gpu", 1);
        ask.affinities
            .push(Affinity::new("${device.model}", "=", "t4", -50));

        let (offer, matched) = allocator.assign_device(&ask).unwrap();
        assert_eq!(offer.id(), gpu_id("a100"));
        assert_eq!(matched, 0.0);
    }

    #[test]
    fn test_assign_device_skips_groups_without_instances() {
        let node = node_with(vec![
            gpu_group("a100", Attribute::int(40, Some("GiB")), &[("GPU-0", true)]),
            gpu_group("t4", Attribute::int(16, Some("GiB")), &[("GPU-1", false)]),
        ]);
        let allocator = DeviceAllocator::new(&node, SharingConfig::default());

        let (offer, _) = allocator
            .assign_device(&RequestedDevice::new("gpu", 1))
            .unwrap();
        assert_eq!(offer.id(), gpu_id("a100"));
    }

    #[test]
    fn test_assign_shared_prefers_lower_usage() {
        let node = create_test_node();
        let allocator = DeviceAllocator::new(&node, SharingConfig::default());
        let a100 = &node.devices()[0];

        let allocs = vec![
            running_alloc("train", a100, &["GPU-0"], "500 MiB"),
            running_alloc("serve", a100, &["GPU-1"], "100 MiB"),
        ];

        let (offer, score) = allocator
            .assign_shared(&memory_request(1, "1 GiB"), &allocs)
            .unwrap();
        assert_eq!(offer.id(), gpu_id("a100"));
        assert_eq!(offer.device_ids, vec!["GPU-1"]);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_assign_shared_tie_goes_to_lowest_id() {
        let node = node_with(vec![gpu_group(
            "a100",
            Attribute::int(40, Some("GiB")),
            &[("GPU-0", true), ("GPU-1", true), ("GPU-2", true)],
        )]);
        let allocator = DeviceAllocator::new(&node, SharingConfig::default());
        let a100 = &node.devices()[0];

        let allocs = vec![
            running_alloc("serve", a100, &["GPU-1"], "700 MiB"),
            running_alloc("embed", a100, &["GPU-0"], "700 MiB"),
            running_alloc("train", a100, &["GPU-2"], "900 MiB"),
        ];

        // GPU-0 and GPU-1 both carry 700 MiB
        let (offer, _) = allocator
            .assign_shared(&memory_request(2, "1 GiB"), &allocs)
            .unwrap();
        assert_eq!(offer.device_ids, vec!["GPU-0", "GPU-0"]);
    }

    #[test]
    fn test_assign_shared_collapses_count() {
        let node = create_test_node();
        let allocator = DeviceAllocator::new(&node, SharingConfig::default());
        let allocs = vec![running_alloc("train", &node.devices()[0], &["GPU-0"], "8 GiB")];

        let (offer, _) = allocator
            .assign_shared(&memory_request(3, "1 GiB"), &allocs)
            .unwrap();
        assert_eq!(offer.device_ids, vec!["GPU-1", "GPU-1", "GPU-1"]);
    }

    #[test]
    fn test_assign_shared_no_matching_device() {
        let allocator = create_test_allocator();
        let result = allocator.assign_shared(&RequestedDevice::new("amd/gpu", 1), &[]);
        assert!(matches!(result, Err(DevplaceError::NoMatchingDevice(_))));
    }

    #[test]
    fn test_assign_shared_group_without_instances() {
        let node = node_with(vec![gpu_group(
            "a100",
            Attribute::int(40, Some("GiB")),
            &[("GPU-0", false)],
        )]);
        let allocator = DeviceAllocator::new(&node, SharingConfig::default());

        let result = allocator.assign_shared(&memory_request(1, "1 GiB"), &[]);
        assert!(matches!(result, Err(DevplaceError::UsageComputation(_))));
    }

    #[test]
    fn test_assign_dispatches_by_type() {
        let node = node_with(vec![
            gpu_group("a100", Attribute::int(40, Some("GiB")), &[("GPU-0", true)]),
            NodeDeviceResource {
                vendor: "xilinx".to_string(),
                device_type: "fpga".to_string(),
                name: "u250".to_string(),
                instances: vec![NodeDevice {
                    id: "FPGA-0".to_string(),
                    healthy: true,
                    health_description: String::new(),
                }],
                attributes: Default::default(),
            },
        ]);
        let allocator = DeviceAllocator::new(&node, SharingConfig::default());

        let (offer, _) = allocator.assign(&memory_request(2, "1 GiB"), &[]).unwrap();
        assert_eq!(offer.device_ids, vec!["GPU-0", "GPU-0"]);

        let (offer, _) = allocator
            .assign(&RequestedDevice::new("fpga", 1), &[])
            .unwrap();
        assert_eq!(offer.id(), DeviceIdTuple::new("xilinx", "fpga", "u250"));
    }

    #[test]
    fn test_shared_offer_then_admission() {
        let node = create_test_node();
        let mut allocator = DeviceAllocator::new(&node, SharingConfig::default());
        let t4 = &node.devices()[1];

        let mut allocs = vec![running_alloc("train", t4, &["GPU-2"], "12 GiB")];
        allocator.add_allocs(&allocs);

        let ask = {
            let mut ask = memory_request(1, "3 GiB");
            ask.name = "nvidia/gpu/t4".to_string();
            ask
        };
        let (offer, _) = allocator.assign_shared(&ask, &allocs).unwrap();
        assert_eq!(offer.device_ids, vec!["GPU-2"]);

        allocs.push(Allocation::proposed("serve", &ask, &offer));
        assert!(allocator
            .accounter()
            .check_capacity(&ask.id(), &allocs, "memory"));

        let bigger = {
            let mut ask = memory_request(1, "5 GiB");
            ask.name = "nvidia/gpu/t4".to_string();
            ask
        };
        allocs.pop();
        allocs.push(Allocation::proposed("serve", &bigger, &offer));
        assert!(!allocator
            .accounter()
            .check_capacity(&bigger.id(), &allocs, "memory"));

        assert!(allocator.add_reserved(&offer));
    }

    #[test]
    fn test_exclusive_policy_from_config() {
        let config = SharingConfig {
            collision_policy: CollisionPolicy::Exclusive,
            ..SharingConfig::default()
        };
        let node = create_test_node();
        let mut allocator = DeviceAllocator::new(&node, config);
        let alloc = running_alloc("train", &node.devices()[1], &["GPU-2"], "1 GiB");

        assert!(!allocator.add_allocs(&[alloc.clone()]));
        assert!(allocator.add_allocs(&[alloc]));
    }
}
