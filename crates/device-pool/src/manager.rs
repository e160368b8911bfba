//! Resource manager facade
//!
//! One capability set for the RPC layer regardless of the active split
//! mode: enumerate the virtual pool, monitor its health. Both strategies
//! delegate to the same enumeration and monitoring routines.

use std::sync::mpsc;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::DeviceSplitMode;
use crate::config::PoolConfig;
use crate::health;
use crate::health::HealthError;
use crate::selector::PartitionSelector;
use crate::selector::ProfileNameSelector;
use crate::telemetry::Telemetry;
use crate::vdev::DeviceEnumerator;
use crate::vdev::EnumerationError;
use crate::vdev::VirtualDevice;

pub trait ResourceManager: Send + Sync {
    /// Enumerates the virtual device pool. Fatal on telemetry failure: a
    /// pool that cannot be verified must not be advertised.
    fn devices(&self) -> Result<Vec<VirtualDevice>, EnumerationError>;

    /// Monitors `devices` until `stop` fires, reporting retractions on
    /// `unhealthy`. Blocks the calling thread for the session lifetime.
    fn check_health(
        &self,
        stop: &CancellationToken,
        devices: &[VirtualDevice],
        unhealthy: &mpsc::Sender<VirtualDevice>,
    ) -> Result<(), HealthError>;
}

/// Builds the manager variant the configuration selects.
pub fn from_config(telemetry: Arc<dyn Telemetry>, config: &PoolConfig) -> Box<dyn ResourceManager> {
    match config.split_mode {
        DeviceSplitMode::Whole => Box::new(WholeDeviceManager::new(telemetry, config)),
        DeviceSplitMode::Partitioned => {
            let prefix = config
                .resource_class
                .split('/')
                .next()
                .unwrap_or("nvidia.com");
            Box::new(PartitionedDeviceManager::new(
                telemetry,
                Box::new(ProfileNameSelector::new(prefix)),
                config,
            ))
        }
    }
}

pub struct WholeDeviceManager {
    telemetry: Arc<dyn Telemetry>,
    enumerator: DeviceEnumerator,
    skip_partition_capable: bool,
    disable_health_checks: Option<String>,
}

impl WholeDeviceManager {
    pub fn new(telemetry: Arc<dyn Telemetry>, config: &PoolConfig) -> Self {
        Self {
            enumerator: DeviceEnumerator::new(telemetry.clone(), config.reservation_percent),
            telemetry,
            skip_partition_capable: config.skip_partition_capable,
            disable_health_checks: config.disable_health_checks.clone(),
        }
    }
}

impl ResourceManager for WholeDeviceManager {
    fn devices(&self) -> Result<Vec<VirtualDevice>, EnumerationError> {
        self.enumerator.whole_devices(self.skip_partition_capable)
    }

    fn check_health(
        &self,
        stop: &CancellationToken,
        devices: &[VirtualDevice],
        unhealthy: &mpsc::Sender<VirtualDevice>,
    ) -> Result<(), HealthError> {
        health::check_health(
            stop,
            self.telemetry.as_ref(),
            devices,
            unhealthy,
            self.disable_health_checks.as_deref(),
        )
    }
}

pub struct PartitionedDeviceManager {
    telemetry: Arc<dyn Telemetry>,
    enumerator: DeviceEnumerator,
    selector: Box<dyn PartitionSelector>,
    resource_class: String,
    disable_health_checks: Option<String>,
}

impl PartitionedDeviceManager {
    pub fn new(
        telemetry: Arc<dyn Telemetry>,
        selector: Box<dyn PartitionSelector>,
        config: &PoolConfig,
    ) -> Self {
        Self {
            enumerator: DeviceEnumerator::new(telemetry.clone(), config.reservation_percent),
            telemetry,
            selector,
            resource_class: config.resource_class.clone(),
            disable_health_checks: config.disable_health_checks.clone(),
        }
    }
}

impl ResourceManager for PartitionedDeviceManager {
    fn devices(&self) -> Result<Vec<VirtualDevice>, EnumerationError> {
        self.enumerator
            .partitioned_devices(self.selector.as_ref(), &self.resource_class)
    }

    fn check_health(
        &self,
        stop: &CancellationToken,
        devices: &[VirtualDevice],
        unhealthy: &mpsc::Sender<VirtualDevice>,
    ) -> Result<(), HealthError> {
        health::check_health(
            stop,
            self.telemetry.as_ref(),
            devices,
            unhealthy,
            self.disable_health_checks.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::telemetry::mock::MockTelemetry;
    use crate::telemetry::AcceleratorInfo;
    use crate::telemetry::PartitionInfo;

    fn config(split_mode: DeviceSplitMode) -> PoolConfig {
        PoolConfig {
            reservation_percent: 50,
            disable_health_checks: None,
            split_mode,
            resource_class: "nvidia.com/mig-1g.5gb".to_string(),
            skip_partition_capable: false,
        }
    }

    fn accel(uuid: &str, partition_capable: bool) -> AcceleratorInfo {
        AcceleratorInfo {
            uuid: uuid.to_string(),
            node_path: "/dev/nvidia0".to_string(),
            memory_mib: 200,
            partition_capable,
            numa_node: None,
        }
    }

    #[test]
    fn whole_manager_slices_whole_accelerators() {
        let telemetry = Arc::new(MockTelemetry::new(vec![accel("gpu-a", false)]));
        let manager = from_config(telemetry, &config(DeviceSplitMode::Whole));

        let devices = manager.devices().expect("enumeration");
        assert_eq!(devices.len(), 100);
    }

    #[test]
    fn partitioned_manager_slices_matching_partitions() {
        let mut telemetry = MockTelemetry::new(vec![accel("gpu-mig", true)]);
        telemetry.partitions.insert(
            "gpu-mig".to_string(),
            vec![PartitionInfo {
                gpu_instance_id: 1,
                compute_instance_id: 0,
                profile_name: "1g.5gb".to_string(),
                uuid: None,
            }],
        );
        let manager = from_config(Arc::new(telemetry), &config(DeviceSplitMode::Partitioned));

        let devices = manager.devices().expect("enumeration");
        assert_eq!(devices.len(), 100);
    }

    #[test]
    fn managers_share_the_monitoring_routine() {
        let telemetry = Arc::new(MockTelemetry::new(vec![]));
        let mut cfg = config(DeviceSplitMode::Whole);
        cfg.disable_health_checks = Some("all".to_string());
        let manager = WholeDeviceManager::new(telemetry.clone(), &cfg);

        let stop = CancellationToken::new();
        let (tx, rx) = mpsc::channel();
        manager
            .check_health(&stop, &[], &tx)
            .expect("disabled monitor");
        drop(tx);
        assert!(rx.into_iter().next().is_none());
        assert!(!telemetry.subscription_was_opened());
    }
}
