//! CLI commands implementation

use anyhow::{Context, Result};
use devplace_core::{AllocatedDeviceResource, Allocation, Node, PlacementConfig, RequestedDevice};
use devplace_scheduler::{DeviceAllocator, DeviceGroupStatus};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Node inventory, its allocations and the requests to place
#[derive(Debug, Deserialize)]
pub struct Snapshot {
    pub node: Node,
    #[serde(default)]
    pub allocations: Vec<Allocation>,
    /// Plan-time reservations not yet running
    #[serde(default)]
    pub reserved: Vec<AllocatedDeviceResource>,
    #[serde(default)]
    pub requests: Vec<TaskRequest>,
}

/// Device requests of one task
#[derive(Debug, Deserialize)]
pub struct TaskRequest {
    pub task: String,
    pub devices: Vec<RequestedDevice>,
}

impl Snapshot {
    /// Load a snapshot; `.json` files are parsed as JSON, anything else as TOML
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;

        let snapshot = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        Ok(snapshot)
    }
}

/// Result of placing one requested device
#[derive(Debug, Serialize)]
pub struct PlanEntry {
    pub task: String,
    pub request: String,
    #[serde(flatten)]
    pub outcome: PlanOutcome,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum PlanOutcome {
    /// Offer accepted and reserved
    Placed {
        device: String,
        instances: Vec<String>,
        score: f64,
        shared: bool,
    },
    /// Offer vetoed by the capacity admission check
    Rejected { device: String, instances: Vec<String> },
    /// No offer could be made on this node
    Infeasible { reason: String },
}

fn build_allocator(snapshot: &Snapshot, config: &PlacementConfig) -> DeviceAllocator {
    let mut allocator = DeviceAllocator::new(&snapshot.node, config.sharing.clone());
    allocator.add_allocs(&snapshot.allocations);

    for reserved in &snapshot.reserved {
        if allocator.add_reserved(reserved) {
            warn!(device = %reserved.id(), instances = ?reserved.device_ids, "Reservation collides with running allocations");
        }
    }

    allocator
}

/// Usage of every device group after folding in allocations and reservations
pub fn usage_report(snapshot: &Snapshot, config: &PlacementConfig) -> Vec<DeviceGroupStatus> {
    build_allocator(snapshot, config).accounter().usage_report()
}

/// Place every request in order. Accepted offers are reserved and become
/// visible to the requests after them.
pub fn plan_requests(snapshot: &Snapshot, config: &PlacementConfig) -> Vec<PlanEntry> {
    let mut allocator = build_allocator(snapshot, config);
    let mut allocs = snapshot.allocations.clone();
    let mut entries = Vec::new();

    for request in &snapshot.requests {
        for ask in &request.devices {
            let outcome = match allocator.assign(ask, &allocs) {
                Ok((offer, score)) => {
                    let shared = config.sharing.is_shared_type(&ask.id().device_type);
                    let proposed = Allocation::proposed(&request.task, ask, &offer);

                    let admitted = !shared || {
                        allocs.push(proposed.clone());
                        let ok = allocator.accounter().check_capacity(
                            &ask.id(),
                            &allocs,
                            &config.sharing.capacity_attribute,
                        );
                        allocs.pop();
                        ok
                    };

                    if admitted {
                        allocator.add_reserved(&offer);
                        allocs.push(proposed);
                        PlanOutcome::Placed {
                            device: offer.id().to_string(),
                            instances: offer.device_ids,
                            score,
                            shared,
                        }
                    } else {
                        PlanOutcome::Rejected {
                            device: offer.id().to_string(),
                            instances: offer.device_ids,
                        }
                    }
                }
                Err(e) => PlanOutcome::Infeasible {
                    reason: e.to_string(),
                },
            };

            info!(task = %request.task, request = %ask.name, outcome = ?outcome, "Planned request");
            entries.push(PlanEntry {
                task: request.task.clone(),
                request: ask.name.clone(),
                outcome,
            });
        }
    }

    entries
}

/// Show device usage
pub fn usage(snapshot: &Snapshot, config: &PlacementConfig, json: bool) -> Result<()> {
    let report = usage_report(snapshot, config);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.is_empty() {
        println!("No devices found on node {}", snapshot.node.id);
        return Ok(());
    }

    for group in report {
        println!("{} - {}/{} free", group.id, group.free, group.total);
        for (instance, usage) in &group.instances {
            println!(
                "  {:<40} {}",
                instance,
                if *usage == 0 {
                    "free".to_string()
                } else {
                    format!("used by {}", usage)
                }
            );
        }
    }

    Ok(())
}

/// Show the placement plan
pub fn plan(snapshot: &Snapshot, config: &PlacementConfig, json: bool) -> Result<()> {
    let entries = plan_requests(snapshot, config);

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No requests to place");
        return Ok(());
    }

    println!("{:<20} {:<30} {:<12} DETAILS", "TASK", "REQUEST", "OUTCOME");
    println!("{}", "-".repeat(100));
    for entry in entries {
        let (outcome, details) = match entry.outcome {
            PlanOutcome::Placed {
                device,
                instances,
                score,
                ..
            } => (
                "placed",
                format!("{} {:?} (score {})", device, instances, score),
            ),
            PlanOutcome::Rejected { device, instances } => {
                ("rejected", format!("{} {:?} over capacity", device, instances))
            }
            PlanOutcome::Infeasible { reason } => ("infeasible", reason),
        };
        println!(
            "{:<20} {:<30} {:<12} {}",
            entry.task, entry.request, outcome, details
        );
    }

    Ok(())
}
