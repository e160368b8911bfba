//! NVML-backed telemetry
//!
//! Production implementation of the telemetry boundary over `nvml-wrapper`.
//! The binding does not expose MIG enumeration, so partition-capable is
//! always reported as false here; partitioned pools require a backend that
//! can list partitions.

use nvml_wrapper::bitmasks::event::EventTypes;
use nvml_wrapper::enums::event::XidError;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::EventSet;
use nvml_wrapper::Nvml;
use tracing::info;
use tracing::warn;

use super::AcceleratorInfo;
use super::FaultEvent;
use super::FaultSubscription;
use super::PartitionInfo;
use super::Telemetry;
use super::TelemetryError;
use super::PARTITION_WILDCARD;

const BYTES_PER_MIB: u64 = 1024 * 1024;

pub struct NvmlTelemetry {
    nvml: Nvml,
}

impl NvmlTelemetry {
    /// Initializes NVML, falling back to an explicit library path for
    /// driver installs that do not ship the unversioned symlink.
    pub fn init() -> Result<Self, TelemetryError> {
        let nvml = match Nvml::init() {
            Ok(nvml) => nvml,
            Err(_) => {
                warn!("standard NVML init failed, trying with explicit library path");
                Nvml::builder()
                    .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                    .init()
                    .map_err(|e| TelemetryError::Init(e.to_string()))?
            }
        };
        info!("NVML initialized");
        Ok(Self { nvml })
    }
}

fn query_err(error: NvmlError) -> TelemetryError {
    match error {
        NvmlError::NotSupported => TelemetryError::NotSupported,
        other => TelemetryError::Query(other.to_string()),
    }
}

impl Telemetry for NvmlTelemetry {
    fn device_count(&self) -> Result<u32, TelemetryError> {
        self.nvml.device_count().map_err(query_err)
    }

    fn accelerator(&self, index: u32) -> Result<AcceleratorInfo, TelemetryError> {
        let device = self.nvml.device_by_index(index).map_err(query_err)?;
        let uuid = device.uuid().map_err(query_err)?.to_lowercase();
        let minor = device.minor_number().map_err(query_err)?;
        let memory = device.memory_info().map_err(query_err)?;

        Ok(AcceleratorInfo {
            uuid,
            node_path: format!("/dev/nvidia{minor}"),
            memory_mib: memory.total / BYTES_PER_MIB,
            // nvml-wrapper has no MIG surface; see module docs.
            partition_capable: false,
            numa_node: None,
        })
    }

    fn partitions(
        &self,
        _accelerator: &AcceleratorInfo,
    ) -> Result<Vec<PartitionInfo>, TelemetryError> {
        Err(TelemetryError::NotSupported)
    }

    fn open_fault_subscription(
        &self,
    ) -> Result<Box<dyn FaultSubscription + '_>, TelemetryError> {
        let set = self.nvml.create_event_set().map_err(query_err)?;
        Ok(Box::new(NvmlFaultSubscription {
            nvml: &self.nvml,
            set: Some(set),
        }))
    }
}

/// Wraps an NVML event set. The set is freed when this value drops, which
/// covers every exit path of a monitoring session.
pub struct NvmlFaultSubscription<'nvml> {
    nvml: &'nvml Nvml,
    // `register_events` consumes the set and hands it back on success; the
    // Option covers the window in between.
    set: Option<EventSet<'nvml>>,
}

impl FaultSubscription for NvmlFaultSubscription<'_> {
    fn register_critical_errors(&mut self, uuid: &str) -> Result<(), TelemetryError> {
        let device = self.nvml.device_by_uuid(uuid).map_err(query_err)?;

        // Probe support first: a failed register_events destroys the set and
        // with it every prior registration.
        let supported = device.supported_event_types().map_err(query_err)?;
        if !supported.contains(EventTypes::CRITICAL_XID_ERROR) {
            return Err(TelemetryError::NotSupported);
        }

        let set = self
            .set
            .take()
            .ok_or_else(|| TelemetryError::Query("event set already destroyed".into()))?;
        match device.register_events(EventTypes::CRITICAL_XID_ERROR, set) {
            Ok(set) => {
                self.set = Some(set);
                Ok(())
            }
            Err(e) => Err(query_err(e.error)),
        }
    }

    fn wait_for_event(&mut self, timeout_ms: u32) -> Result<FaultEvent, TelemetryError> {
        let set = self
            .set
            .as_ref()
            .ok_or_else(|| TelemetryError::Query("event set already destroyed".into()))?;

        let data = set.wait(timeout_ms).map_err(|e| match e {
            NvmlError::Timeout => TelemetryError::WaitTimeout,
            other => TelemetryError::Query(other.to_string()),
        })?;

        let xid = match data.event_data {
            Some(XidError::Value(value)) => value,
            // Unknown code or none at all; still a critical event if the
            // type says so.
            _ => 0,
        };

        Ok(FaultEvent {
            xid,
            // A fleet-wide event carries no usable device handle.
            uuid: data.device.uuid().ok().map(|u| u.to_lowercase()),
            gpu_instance_id: PARTITION_WILDCARD,
            compute_instance_id: PARTITION_WILDCARD,
            is_critical: data.event_type.contains(EventTypes::CRITICAL_XID_ERROR),
        })
    }
}
