//! Virtualization engine
//!
//! Turns discovered physical accelerators into a flat list of oversubscribed
//! virtual devices. Each accelerator (or matching hardware partition) is
//! sliced into `usable` units named by a reversible fake id, so the
//! scheduler sees a much larger allocatable pool than physically exists.

use std::collections::HashMap;
use std::sync::Arc;

use derive_more::Display;
use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::debug;
use tracing::info;

use crate::selector::PartitionSelector;
use crate::telemetry::Telemetry;
use crate::telemetry::TelemetryError;
use crate::telemetry::PARTITION_WILDCARD;

/// Separator between the real accelerator id and the slice index. Hardware
/// UUIDs never contain this token, which makes decoding exact.
pub const FAKE_ID_SEPARATOR: &str = "-_-";

const DEVICE_NODE_PREFIX: &str = "/dev/nvidia";

/// Builds the fake id of slice `index` of accelerator `real_id`.
pub fn encode_fake_id(real_id: &str, index: u64) -> String {
    format!("{real_id}{FAKE_ID_SEPARATOR}{index}")
}

/// Recovers the real accelerator id a fake id was derived from. Ids without
/// a separator are returned unchanged.
pub fn decode_real_id(fake_id: &str) -> &str {
    match fake_id.find(FAKE_ID_SEPARATOR) {
        Some(at) => &fake_id[..at],
        None => fake_id,
    }
}

/// Splits a partition-scoped id of the form `MIG-<gpu uuid>/<gi>/<ci>` into
/// its parent uuid and instance ids. `None` when the id is not
/// partition-scoped.
pub fn parse_partition_scoped_id(id: &str) -> Option<(&str, u32, u32)> {
    let rest = id.strip_prefix("MIG-")?;
    let mut parts = rest.split('/');
    let parent = parts.next()?;
    let gpu_instance_id = parts.next()?.parse().ok()?;
    let compute_instance_id = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((parent, gpu_instance_id, compute_instance_id))
}

/// Identifier scope a virtual device matches fault events against: its real
/// accelerator uuid plus partition instance ids, wildcarded for ids that are
/// not partition-scoped.
pub(crate) fn device_id_scope(fake_id: &str) -> (&str, u32, u32) {
    let real_id = decode_real_id(fake_id);
    match parse_partition_scoped_id(real_id) {
        Some(scope) => scope,
        None => (real_id, PARTITION_WILDCARD, PARTITION_WILDCARD),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DeviceHealth {
    #[display("Healthy")]
    Healthy,
    #[display("Unhealthy")]
    Unhealthy,
}

/// One allocatable virtual unit advertised to the scheduler.
///
/// Values are created fresh by an enumeration pass and never mutated; health
/// changes travel as monitor notifications instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDevice {
    /// Fake id, `encode_fake_id(real, index)`.
    pub id: String,
    pub health: DeviceHealth,
    /// Device node of the owning physical accelerator, used for mounts.
    pub node_path: String,
    pub numa_node: Option<i64>,
}

#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error("telemetry query failed during enumeration: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("malformed device node path `{path}`, expected /dev/nvidia<index>")]
    MalformedNodePath { path: String },
    #[error("memory reservation percent must be within (0, 100], got {0}")]
    InvalidReservation(u64),
}

fn parse_node_index(path: &str) -> Result<u32, EnumerationError> {
    path.strip_prefix(DEVICE_NODE_PREFIX)
        .and_then(|rest| rest.parse().ok())
        .ok_or_else(|| EnumerationError::MalformedNodePath {
            path: path.to_string(),
        })
}

/// Runs enumeration passes and owns the process-wide capacity baseline.
///
/// The baseline is latched from the first accelerator the first pass
/// observes and reused for all later arithmetic; the fleet is assumed
/// homogeneous. First write wins, so concurrent callers cannot race the
/// latch.
pub struct DeviceEnumerator {
    telemetry: Arc<dyn Telemetry>,
    reservation_percent: u64,
    capacity_baseline_mib: OnceCell<u64>,
}

impl DeviceEnumerator {
    pub fn new(telemetry: Arc<dyn Telemetry>, reservation_percent: u64) -> Self {
        Self {
            telemetry,
            reservation_percent,
            capacity_baseline_mib: OnceCell::new(),
        }
    }

    fn reservation(&self) -> Result<u64, EnumerationError> {
        if self.reservation_percent == 0 || self.reservation_percent > 100 {
            return Err(EnumerationError::InvalidReservation(self.reservation_percent));
        }
        Ok(self.reservation_percent)
    }

    /// Virtual units carved out of one whole accelerator:
    /// `floor(baseline / 100) * (100 - reservation)`.
    fn usable_per_accelerator(&self, baseline_mib: u64, reservation: u64) -> u64 {
        (baseline_mib / 100) * (100 - reservation)
    }

    /// Virtual units carved out of one matching partition:
    /// `baseline * (1 - reservation / 100)`, truncated.
    ///
    /// Deliberately not the same rounding as the whole-device formula; both
    /// are kept exactly as the accounting contract states them.
    fn usable_per_partition(&self, baseline_mib: u64, reservation: u64) -> u64 {
        (baseline_mib as f64 * (1.0 - reservation as f64 / 100.0)) as u64
    }

    fn slices(&self, accel: &crate::telemetry::AcceleratorInfo, count: u64) -> Vec<VirtualDevice> {
        (0..count)
            .map(|index| VirtualDevice {
                id: encode_fake_id(&accel.uuid, index),
                health: DeviceHealth::Healthy,
                node_path: accel.node_path.clone(),
                numa_node: accel.numa_node,
            })
            .collect()
    }

    /// Enumeration pass over whole accelerators.
    ///
    /// `skip_partition_capable` excludes accelerators that are set up for
    /// hardware partitioning; their capacity belongs to the partitioned
    /// pool.
    pub fn whole_devices(
        &self,
        skip_partition_capable: bool,
    ) -> Result<Vec<VirtualDevice>, EnumerationError> {
        let reservation = self.reservation()?;
        let count = self.telemetry.device_count()?;

        let mut devices = Vec::new();
        let mut local_indices: HashMap<String, u32> = HashMap::new();

        for i in 0..count {
            let accel = self.telemetry.accelerator(i)?;
            local_indices.insert(accel.uuid.clone(), parse_node_index(&accel.node_path)?);

            let baseline = *self.capacity_baseline_mib.get_or_init(|| accel.memory_mib);

            if accel.partition_capable && skip_partition_capable {
                debug!(uuid = %accel.uuid, "skipping partition-capable accelerator in whole-device mode");
                continue;
            }

            let usable = self.usable_per_accelerator(baseline, reservation);
            info!(
                uuid = %accel.uuid,
                baseline_mib = baseline,
                reservation,
                usable,
                "slicing accelerator"
            );
            devices.extend(self.slices(&accel, usable));
        }

        debug!(?local_indices, "device node index map");
        Ok(devices)
    }

    /// Enumeration pass over hardware partitions of partition-capable
    /// accelerators. Partitions the selector does not match contribute
    /// nothing.
    pub fn partitioned_devices(
        &self,
        selector: &dyn PartitionSelector,
        resource_class: &str,
    ) -> Result<Vec<VirtualDevice>, EnumerationError> {
        let reservation = self.reservation()?;
        let count = self.telemetry.device_count()?;

        let mut devices = Vec::new();
        let mut local_indices: HashMap<String, u32> = HashMap::new();

        for i in 0..count {
            let accel = self.telemetry.accelerator(i)?;
            local_indices.insert(accel.uuid.clone(), parse_node_index(&accel.node_path)?);

            let baseline = *self.capacity_baseline_mib.get_or_init(|| accel.memory_mib);

            if !accel.partition_capable {
                continue;
            }

            let usable = self.usable_per_partition(baseline, reservation);
            for partition in self.telemetry.partitions(&accel)? {
                if !selector.matches(&partition, resource_class) {
                    continue;
                }
                info!(
                    uuid = %accel.uuid,
                    profile = %partition.profile_name,
                    partition_uuid = ?partition.uuid,
                    usable,
                    "slicing hardware partition"
                );
                devices.extend(self.slices(&accel, usable));
            }
        }

        debug!(?local_indices, "device node index map");
        Ok(devices)
    }
}
