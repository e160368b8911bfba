//! Hardware telemetry boundary
//!
//! The rest of the crate talks to the GPU driver exclusively through the
//! [`Telemetry`] and [`FaultSubscription`] traits defined here. The
//! production implementation lives in [`nvml`]; tests script their own
//! accelerators and fault events against the same contract.

pub mod nvml;

use thiserror::Error;

/// Instance id carried by fault events and device ids that are not scoped to
/// a hardware partition. Matches the driver convention of reporting
/// `0xFFFFFFFF` for whole-GPU events.
pub const PARTITION_WILDCARD: u32 = 0xFFFF_FFFF;

/// Critical error codes raised by a misbehaving workload rather than failing
/// hardware. The accelerator stays healthy when one of these arrives.
/// See https://docs.nvidia.com/deploy/xid-errors/index.html#topic_4
pub const APPLICATION_XIDS: [u64; 3] = [31, 43, 45];

/// One physical accelerator as reported by a single enumeration query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorInfo {
    /// Stable hardware UUID, lowercased.
    pub uuid: String,
    /// Device node path, e.g. `/dev/nvidia0`.
    pub node_path: String,
    /// Total memory capacity in MiB.
    pub memory_mib: u64,
    /// Whether the accelerator supports hardware partitioning (MIG).
    pub partition_capable: bool,
    /// NUMA locality hint, when the driver exposes one.
    pub numa_node: Option<i64>,
}

/// A hardware partition scoped to its parent accelerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub gpu_instance_id: u32,
    pub compute_instance_id: u32,
    /// Vendor profile name, e.g. `1g.5gb`.
    pub profile_name: String,
    /// Partition-scoped UUID when the driver exposes one.
    pub uuid: Option<String>,
}

/// A single fault event delivered by the telemetry subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultEvent {
    /// Numeric critical-error code; 0 when the driver reports it as unknown.
    pub xid: u64,
    /// Originating accelerator UUID. `None` or empty means the event applies
    /// to every monitored device.
    pub uuid: Option<String>,
    /// Partition scope, [`PARTITION_WILDCARD`] for whole-accelerator events.
    pub gpu_instance_id: u32,
    pub compute_instance_id: u32,
    /// Whether the event belongs to the critical-error class at all.
    pub is_critical: bool,
}

impl FaultEvent {
    /// True when the event carries no originating accelerator and therefore
    /// applies to the whole fleet.
    pub fn is_fleet_wide(&self) -> bool {
        self.uuid.as_deref().map_or(true, str::is_empty)
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize the telemetry library: {0}")]
    Init(String),
    #[error("telemetry query failed: {0}")]
    Query(String),
    #[error("not supported by this device or driver")]
    NotSupported,
    #[error("timed out waiting for a fault event")]
    WaitTimeout,
}

impl TelemetryError {
    pub fn is_not_supported(&self) -> bool {
        matches!(self, TelemetryError::NotSupported)
    }
}

/// Read side of the hardware telemetry service.
///
/// Enumeration queries are the single source of truth per call; nothing is
/// cached across calls by implementations.
pub trait Telemetry: Send + Sync {
    fn device_count(&self) -> Result<u32, TelemetryError>;

    fn accelerator(&self, index: u32) -> Result<AcceleratorInfo, TelemetryError>;

    /// Hardware partitions of one accelerator. Only meaningful when
    /// [`AcceleratorInfo::partition_capable`] is set.
    fn partitions(&self, accelerator: &AcceleratorInfo)
        -> Result<Vec<PartitionInfo>, TelemetryError>;

    /// Opens a fault-event subscription. The underlying event resource is
    /// released when the returned handle is dropped, on every exit path.
    fn open_fault_subscription(&self)
        -> Result<Box<dyn FaultSubscription + '_>, TelemetryError>;
}

/// A live fault-event subscription.
pub trait FaultSubscription {
    /// Registers interest in critical errors of one accelerator.
    ///
    /// Returns [`TelemetryError::NotSupported`] when the device predates
    /// health-event reporting; any other error leaves the subscription in an
    /// unusable state.
    fn register_critical_errors(&mut self, uuid: &str) -> Result<(), TelemetryError>;

    /// Waits up to `timeout_ms` for the next fault event.
    /// [`TelemetryError::WaitTimeout`] when nothing arrived in time.
    fn wait_for_event(&mut self, timeout_ms: u32) -> Result<FaultEvent, TelemetryError>;
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::HashMap;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::sync::Mutex;

    use tokio_util::sync::CancellationToken;

    use super::*;

    /// Scripted telemetry backend for tests.
    ///
    /// Events are handed out in order; once the script is drained, waits time
    /// out and, when configured, `stop_when_drained` is cancelled so a
    /// monitoring loop under test terminates deterministically.
    #[derive(Default)]
    pub(crate) struct MockTelemetry {
        pub accelerators: Vec<AcceleratorInfo>,
        pub partitions: HashMap<String, Vec<PartitionInfo>>,
        pub events: Mutex<VecDeque<FaultEvent>>,
        pub stop_when_drained: Option<CancellationToken>,
        /// UUIDs whose event registration reports not-supported.
        pub unsupported_uuids: Vec<String>,
        /// Force every registration to fail with a hard error.
        pub fail_registration: bool,
        pub subscription_opened: AtomicBool,
        pub subscription_closed: Arc<AtomicBool>,
        pub registered: Mutex<Vec<String>>,
    }

    impl MockTelemetry {
        pub(crate) fn new(accelerators: Vec<AcceleratorInfo>) -> Self {
            Self {
                accelerators,
                ..Default::default()
            }
        }

        pub(crate) fn with_events(
            accelerators: Vec<AcceleratorInfo>,
            events: Vec<FaultEvent>,
            stop_when_drained: CancellationToken,
        ) -> Self {
            Self {
                accelerators,
                events: Mutex::new(events.into()),
                stop_when_drained: Some(stop_when_drained),
                ..Default::default()
            }
        }

        pub(crate) fn subscription_was_opened(&self) -> bool {
            self.subscription_opened.load(Ordering::SeqCst)
        }

        pub(crate) fn subscription_was_closed(&self) -> bool {
            self.subscription_closed.load(Ordering::SeqCst)
        }
    }

    impl Telemetry for MockTelemetry {
        fn device_count(&self) -> Result<u32, TelemetryError> {
            Ok(self.accelerators.len() as u32)
        }

        fn accelerator(&self, index: u32) -> Result<AcceleratorInfo, TelemetryError> {
            self.accelerators
                .get(index as usize)
                .cloned()
                .ok_or_else(|| TelemetryError::Query(format!("no accelerator at index {index}")))
        }

        fn partitions(
            &self,
            accelerator: &AcceleratorInfo,
        ) -> Result<Vec<PartitionInfo>, TelemetryError> {
            Ok(self
                .partitions
                .get(&accelerator.uuid)
                .cloned()
                .unwrap_or_default())
        }

        fn open_fault_subscription(
            &self,
        ) -> Result<Box<dyn FaultSubscription + '_>, TelemetryError> {
            self.subscription_opened.store(true, Ordering::SeqCst);
            Ok(Box::new(MockSubscription {
                telemetry: self,
                closed: self.subscription_closed.clone(),
            }))
        }
    }

    pub(crate) struct MockSubscription<'a> {
        telemetry: &'a MockTelemetry,
        closed: Arc<AtomicBool>,
    }

    impl Drop for MockSubscription<'_> {
        fn drop(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    impl FaultSubscription for MockSubscription<'_> {
        fn register_critical_errors(&mut self, uuid: &str) -> Result<(), TelemetryError> {
            if self.telemetry.fail_registration {
                return Err(TelemetryError::Query("registration rejected".into()));
            }
            if self.telemetry.unsupported_uuids.iter().any(|u| u == uuid) {
                return Err(TelemetryError::NotSupported);
            }
            self.telemetry
                .registered
                .lock()
                .expect("poisoned")
                .push(uuid.to_string());
            Ok(())
        }

        fn wait_for_event(&mut self, _timeout_ms: u32) -> Result<FaultEvent, TelemetryError> {
            let next = self.telemetry.events.lock().expect("poisoned").pop_front();
            match next {
                Some(event) => Ok(event),
                None => {
                    if let Some(token) = &self.telemetry.stop_when_drained {
                        token.cancel();
                    }
                    Err(TelemetryError::WaitTimeout)
                }
            }
        }
    }
}
