//! Device inventory, request and allocation records

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identity of a device group on a node: vendor, type and model name
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIdTuple {
    pub vendor: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub name: String,
}

impl DeviceIdTuple {
    pub fn new(vendor: &str, device_type: &str, name: &str) -> Self {
        Self {
            vendor: vendor.to_string(),
            device_type: device_type.to_string(),
            name: name.to_string(),
        }
    }

    /// Whether this identity satisfies `other`. Empty fields in `other`
    /// match anything.
    pub fn matches(&self, other: &DeviceIdTuple) -> bool {
        (other.vendor.is_empty() || other.vendor == self.vendor)
            && (other.device_type.is_empty() || other.device_type == self.device_type)
            && (other.name.is_empty() || other.name == self.name)
    }
}

impl std::fmt::Display for DeviceIdTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.vendor, self.device_type, self.name)
    }
}

/// Typed value of a device attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeValue {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
}

/// Device attribute, e.g. `memory = 16 GiB`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    #[serde(flatten)]
    pub value: AttributeValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Attribute {
    pub fn int(value: i64, unit: Option<&str>) -> Self {
        Self {
            value: AttributeValue::Int(value),
            unit: unit.map(str::to_string),
        }
    }

    pub fn float(value: f64, unit: Option<&str>) -> Self {
        Self {
            value: AttributeValue::Float(value),
            unit: unit.map(str::to_string),
        }
    }

    pub fn string(value: &str) -> Self {
        Self {
            value: AttributeValue::String(value.to_string()),
            unit: None,
        }
    }

    pub fn bool(value: bool) -> Self {
        Self {
            value: AttributeValue::Bool(value),
            unit: None,
        }
    }

    /// Parse a literal such as `"11 GiB"`, `"4"`, `"1.5"`, `"true"` or
    /// `"a100"`. Anything that is not numeric or boolean becomes a string.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        let parts: Vec<&str> = trimmed.split_whitespace().collect();

        if let [number, unit] = parts.as_slice() {
            if let Some(value) = Self::parse_number(number) {
                return Self {
                    unit: Some((*unit).to_string()),
                    ..value
                };
            }
        }

        if let Some(value) = Self::parse_number(trimmed) {
            return value;
        }

        match trimmed {
            "true" => Self::bool(true),
            "false" => Self::bool(false),
            _ => Self::string(trimmed),
        }
    }

    fn parse_number(input: &str) -> Option<Self> {
        if let Ok(v) = input.parse::<i64>() {
            return Some(Self::int(v, None));
        }
        input.parse::<f64>().ok().map(|v| Self::float(v, None))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.value {
            AttributeValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self.value {
            AttributeValue::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            AttributeValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.value {
            AttributeValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Numeric value regardless of int/float representation
    pub fn as_number(&self) -> Option<f64> {
        match self.value {
            AttributeValue::Int(v) => Some(v as f64),
            AttributeValue::Float(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            AttributeValue::Int(v) => write!(f, "{}", v)?,
            AttributeValue::Float(v) => write!(f, "{}", v)?,
            AttributeValue::String(v) => write!(f, "{}", v)?,
            AttributeValue::Bool(v) => write!(f, "{}", v)?,
        }
        if let Some(unit) = &self.unit {
            write!(f, " {}", unit)?;
        }
        Ok(())
    }
}

/// A single physical device instance reported by a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDevice {
    /// Instance identifier (e.g. a GPU UUID)
    pub id: String,
    /// Whether the instance is healthy and may be allocated
    pub healthy: bool,
    /// Reason for the health state, if any
    #[serde(default)]
    pub health_description: String,
}

/// A device group reported by a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDeviceResource {
    pub vendor: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub name: String,
    #[serde(default)]
    pub instances: Vec<NodeDevice>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
}

impl NodeDeviceResource {
    pub fn id(&self) -> DeviceIdTuple {
        DeviceIdTuple::new(&self.vendor, &self.device_type, &self.name)
    }
}

/// Resources a node advertises
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeResources {
    #[serde(default)]
    pub devices: Vec<NodeDeviceResource>,
}

/// A node as seen by the placement engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Older clients do not report node resources and therefore no devices
    #[serde(default)]
    pub node_resources: Option<NodeResources>,
}

impl Node {
    /// Device groups reported by the node
    pub fn devices(&self) -> &[NodeDeviceResource] {
        self.node_resources
            .as_ref()
            .map(|r| r.devices.as_slice())
            .unwrap_or_default()
    }
}

/// Hard requirement against device attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub l_target: String,
    pub r_target: String,
    pub operand: String,
}

impl Constraint {
    pub fn new(l_target: &str, operand: &str, r_target: &str) -> Self {
        Self {
            l_target: l_target.to_string(),
            r_target: r_target.to_string(),
            operand: operand.to_string(),
        }
    }
}

/// Weighted preference against device attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Affinity {
    pub l_target: String,
    pub r_target: String,
    pub operand: String,
    /// Between -100 and 100; negative weights express anti-affinity
    pub weight: i8,
}

impl Affinity {
    pub fn new(l_target: &str, operand: &str, r_target: &str, weight: i8) -> Self {
        Self {
            l_target: l_target.to_string(),
            r_target: r_target.to_string(),
            operand: operand.to_string(),
            weight,
        }
    }
}

/// A task's request for a number of devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestedDevice {
    /// `type`, `vendor/type` or `vendor/type/name`
    pub name: String,
    pub count: u64,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub affinities: Vec<Affinity>,
}

impl RequestedDevice {
    pub fn new(name: &str, count: u64) -> Self {
        Self {
            name: name.to_string(),
            count,
            constraints: Vec::new(),
            affinities: Vec::new(),
        }
    }

    /// Identity the request targets; omitted parts are wildcards
    pub fn id(&self) -> DeviceIdTuple {
        let parts: Vec<&str> = self.name.splitn(3, '/').collect();
        match parts.as_slice() {
            [device_type] => DeviceIdTuple::new("", device_type, ""),
            [vendor, device_type] => DeviceIdTuple::new(vendor, device_type, ""),
            [vendor, device_type, name] => DeviceIdTuple::new(vendor, device_type, name),
            _ => DeviceIdTuple::default(),
        }
    }
}

/// Device instances assigned from one group. Also used as a placement offer
/// and as a plan-time reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedDeviceResource {
    pub vendor: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub name: String,
    #[serde(default)]
    pub device_ids: Vec<String>,
}

impl AllocatedDeviceResource {
    /// Empty assignment for a device group
    pub fn for_group(id: &DeviceIdTuple, capacity: usize) -> Self {
        Self {
            vendor: id.vendor.clone(),
            device_type: id.device_type.clone(),
            name: id.name.clone(),
            device_ids: Vec::with_capacity(capacity),
        }
    }

    pub fn id(&self) -> DeviceIdTuple {
        DeviceIdTuple::new(&self.vendor, &self.device_type, &self.name)
    }
}

/// Devices assigned to one task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocatedTaskResources {
    #[serde(default)]
    pub devices: Vec<AllocatedDeviceResource>,
}

/// Per-task resource assignment of an allocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocatedResources {
    #[serde(default)]
    pub tasks: BTreeMap<String, AllocatedTaskResources>,
}

/// Resources a task originally asked for
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResources {
    #[serde(default)]
    pub devices: Vec<RequestedDevice>,
}

/// Client-side status of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
}

impl ClientStatus {
    /// Terminal allocations no longer hold their devices
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientStatus::Complete | ClientStatus::Failed | ClientStatus::Lost
        )
    }
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientStatus::Pending => write!(f, "pending"),
            ClientStatus::Running => write!(f, "running"),
            ClientStatus::Complete => write!(f, "complete"),
            ClientStatus::Failed => write!(f, "failed"),
            ClientStatus::Lost => write!(f, "lost"),
        }
    }
}

/// A workload placement occupying a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub client_status: ClientStatus,
    /// Absent for allocations created before per-task device accounting
    #[serde(default)]
    pub allocated_resources: Option<AllocatedResources>,
    /// Originally requested resources, keyed by task name
    #[serde(default)]
    pub task_resources: BTreeMap<String, TaskResources>,
}

impl Allocation {
    /// Create an allocation without any resources
    pub fn new(name: &str, client_status: ClientStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            client_status,
            allocated_resources: None,
            task_resources: BTreeMap::new(),
        }
    }

    /// The running allocation a task would become if `offer` for `ask` were
    /// committed. Used to run admission checks before committing.
    pub fn proposed(task: &str, ask: &RequestedDevice, offer: &AllocatedDeviceResource) -> Self {
        let mut alloc = Self::new(task, ClientStatus::Pending);
        alloc.add_task(task, vec![offer.clone()], vec![ask.clone()]);
        alloc
    }

    /// Record a task's assigned devices together with what it requested
    pub fn add_task(
        &mut self,
        task: &str,
        devices: Vec<AllocatedDeviceResource>,
        requested: Vec<RequestedDevice>,
    ) {
        self.allocated_resources
            .get_or_insert_with(AllocatedResources::default)
            .tasks
            .insert(task.to_string(), AllocatedTaskResources { devices });
        self.task_resources
            .insert(task.to_string(), TaskResources { devices: requested });
    }

    pub fn is_terminal(&self) -> bool {
        self.client_status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_matches_wildcards() {
        let id = DeviceIdTuple::new("nvidia", "gpu", "a100");

        assert!(id.matches(&DeviceIdTuple::new("", "gpu", "")));
        assert!(id.matches(&DeviceIdTuple::new("nvidia", "gpu", "")));
        assert!(id.matches(&DeviceIdTuple::new("nvidia", "gpu", "a100")));
        assert!(id.matches(&DeviceIdTuple::default()));
        assert!(!id.matches(&DeviceIdTuple::new("amd", "gpu", "")));
        assert!(!id.matches(&DeviceIdTuple::new("nvidia", "gpu", "t4")));
    }

    #[test]
    fn test_requested_device_id() {
        assert_eq!(
            RequestedDevice::new("gpu", 1).id(),
            DeviceIdTuple::new("", "gpu", "")
        );
        assert_eq!(
            RequestedDevice::new("nvidia/gpu", 1).id(),
            DeviceIdTuple::new("nvidia", "gpu", "")
        );
        assert_eq!(
            RequestedDevice::new("nvidia/gpu/Tesla K80", 1).id(),
            DeviceIdTuple::new("nvidia", "gpu", "Tesla K80")
        );
    }

    #[test]
    fn test_attribute_parse() {
        let attr = Attribute::parse(" 11 GiB ");
        assert_eq!(attr.as_int(), Some(11));
        assert_eq!(attr.unit.as_deref(), Some("GiB"));

        let attr = Attribute::parse("1.5 GiB");
        assert_eq!(attr.as_float(), Some(1.5));

        assert_eq!(Attribute::parse("4").as_int(), Some(4));
        assert_eq!(Attribute::parse("true").as_bool(), Some(true));
        assert_eq!(Attribute::parse("a100").as_str(), Some("a100"));
        assert_eq!(Attribute::parse("Tesla K80").as_str(), Some("Tesla K80"));
    }

    #[test]
    fn test_attribute_display() {
        assert_eq!(Attribute::int(16, Some("GiB")).to_string(), "16 GiB");
        assert_eq!(Attribute::string("a100").to_string(), "a100");
    }

    #[test]
    fn test_node_without_resources() {
        let node = Node {
            id: "node-1".to_string(),
            ..Default::default()
        };
        assert!(node.devices().is_empty());
    }

    #[test]
    fn test_client_status_terminal() {
        assert!(!ClientStatus::Pending.is_terminal());
        assert!(!ClientStatus::Running.is_terminal());
        assert!(ClientStatus::Complete.is_terminal());
        assert!(ClientStatus::Failed.is_terminal());
        assert!(ClientStatus::Lost.is_terminal());
    }

    #[test]
    fn test_proposed_allocation() {
        let mut ask = RequestedDevice::new("nvidia/gpu", 1);
        ask.constraints
            .push(Constraint::new("${device.attr.memory}", ">=", "2000 MiB"));
        let mut offer = AllocatedDeviceResource::for_group(&DeviceIdTuple::new("nvidia", "gpu", "a100"), 1);
        offer.device_ids.push("GPU-0".to_string());

        let alloc = Allocation::proposed("web", &ask, &offer);
        assert!(!alloc.is_terminal());

        let tasks = &alloc.allocated_resources.as_ref().unwrap().tasks;
        assert_eq!(tasks["web"].devices, vec![offer]);
        assert_eq!(alloc.task_resources["web"].devices[0].constraints.len(), 1);
    }

    #[test]
    fn test_node_parse_toml() {
        let toml_str = r#"
id = "node-1"

[[node_resources.devices]]
vendor = "nvidia"
type = "gpu"
name = "a100"
attributes = { memory = { int = 40, unit = "GiB" }, cuda_cores = { int = 6912 } }
instances = [
    { id = "GPU-0", healthy = true },
    { id = "GPU-1", healthy = false, health_description = "xid 79" },
]
"#;
        let node: Node = toml::from_str(toml_str).unwrap();
        let devices = node.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id(), DeviceIdTuple::new("nvidia", "gpu", "a100"));
        assert_eq!(devices[0].attributes["memory"], Attribute::int(40, Some("GiB")));
        assert_eq!(devices[0].attributes["cuda_cores"].unit, None);
        assert!(!devices[0].instances[1].healthy);
    }
}
