//! Fixtures shared by the scheduler tests

use devplace_core::{
    AllocatedDeviceResource, Allocation, Attribute, ClientStatus, Constraint, DeviceIdTuple,
    Node, NodeDevice, NodeDeviceResource, NodeResources, RequestedDevice,
};

pub fn gpu_id(name: &str) -> DeviceIdTuple {
    DeviceIdTuple::new("nvidia", "gpu", name)
}

pub fn gpu_group(name: &str, memory: Attribute, instances: &[(&str, bool)]) -> NodeDeviceResource {
    NodeDeviceResource {
        vendor: "nvidia".to_string(),
        device_type: "gpu".to_string(),
        name: name.to_string(),
        instances: instances
            .iter()
            .map(|(id, healthy)| NodeDevice {
                id: id.to_string(),
                healthy: *healthy,
                health_description: String::new(),
            })
            .collect(),
        attributes: [("memory".to_string(), memory)].into_iter().collect(),
    }
}

pub fn node_with(devices: Vec<NodeDeviceResource>) -> Node {
    Node {
        id: "node-1".to_string(),
        name: "worker-1".to_string(),
        node_resources: Some(NodeResources { devices }),
    }
}

/// Request for `count` GPUs asking for at least `memory` each
pub fn memory_request(count: u64, memory: &str) -> RequestedDevice {
    let mut ask = RequestedDevice::new("nvidia/gpu", count);
    ask.constraints
        .push(Constraint::new("${device.attr.memory}", ">=", memory));
    ask
}

/// Running allocation holding `ids` of `group`, requested with `memory`
pub fn running_alloc(
    task: &str,
    group: &NodeDeviceResource,
    ids: &[&str],
    memory: &str,
) -> Allocation {
    let mut assigned = AllocatedDeviceResource::for_group(&group.id(), ids.len());
    assigned.device_ids = ids.iter().map(|id| id.to_string()).collect();

    let mut alloc = Allocation::new(task, ClientStatus::Running);
    alloc.add_task(
        task,
        vec![assigned],
        vec![memory_request(ids.len() as u64, memory)],
    );
    alloc
}
