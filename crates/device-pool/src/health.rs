//! Health monitor
//!
//! Consumes the hardware fault-event stream and resolves every critical
//! fault to the virtual devices it affects. Runs until the stop token is
//! cancelled; cancellation is cooperative, so the worst-case exit latency is
//! one event-wait timeout. The fault subscription is released on every exit
//! path by dropping the handle.

use std::sync::mpsc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::telemetry::FaultEvent;
use crate::telemetry::Telemetry;
use crate::telemetry::TelemetryError;
use crate::telemetry::APPLICATION_XIDS;
use crate::telemetry::PARTITION_WILDCARD;
use crate::vdev::decode_real_id;
use crate::vdev::device_id_scope;
use crate::vdev::parse_partition_scoped_id;
use crate::vdev::VirtualDevice;

/// Bounded wait per loop iteration; also the cancellation-polling
/// granularity.
pub const EVENT_WAIT_TIMEOUT_MS: u32 = 5000;

/// The only named health check. Disabling `"all"` is equivalent.
pub const XID_CHECK_NAME: &str = "xids";

const DISABLE_ALL: &str = "all";

/// Whether a disable directive suppresses critical-error monitoring.
pub fn health_checks_disabled(directive: Option<&str>) -> bool {
    let Some(directive) = directive else {
        return false;
    };
    let directive = directive.to_lowercase();
    if directive == DISABLE_ALL {
        return true;
    }
    directive.contains(XID_CHECK_NAME)
}

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("failed to open a fault-event subscription: {0}")]
    Subscribe(#[source] TelemetryError),
    #[error("failed to register {uuid} for critical-error events: {source}")]
    Register {
        uuid: String,
        #[source]
        source: TelemetryError,
    },
}

/// Monitors `devices` until `stop` is cancelled, writing every device a
/// critical fault resolves to into `unhealthy`.
///
/// Returns early as a no-op when checks are disabled by configuration.
/// `Err` is reserved for unrecoverable causes the caller should escalate to
/// process exit; registration reporting not-supported degrades to marking
/// the device unhealthy instead.
pub fn check_health(
    stop: &CancellationToken,
    telemetry: &dyn Telemetry,
    devices: &[VirtualDevice],
    unhealthy: &mpsc::Sender<VirtualDevice>,
    disable_directive: Option<&str>,
) -> Result<(), HealthError> {
    if health_checks_disabled(disable_directive) {
        info!("health checks disabled by configuration, not monitoring");
        return Ok(());
    }

    let mut subscription = telemetry
        .open_fault_subscription()
        .map_err(HealthError::Subscribe)?;

    for device in devices {
        let real_id = decode_real_id(&device.id);
        // partition-scoped ids register against their parent accelerator
        let gpu_uuid = match parse_partition_scoped_id(real_id) {
            Some((parent, _, _)) => parent,
            None => real_id,
        };

        match subscription.register_critical_errors(gpu_uuid) {
            Ok(()) => {}
            Err(e) if e.is_not_supported() => {
                warn!(
                    id = real_id,
                    "accelerator is too old to support health checks, marking it unhealthy"
                );
                if notify(unhealthy, device).is_err() {
                    return Ok(());
                }
            }
            Err(source) => {
                return Err(HealthError::Register {
                    uuid: gpu_uuid.to_string(),
                    source,
                });
            }
        }
    }

    loop {
        if stop.is_cancelled() {
            info!("health monitor stop requested");
            return Ok(());
        }

        let event = match subscription.wait_for_event(EVENT_WAIT_TIMEOUT_MS) {
            Ok(event) => event,
            Err(TelemetryError::WaitTimeout) => continue,
            Err(e) => {
                debug!("transient fault-event wait failure: {e}");
                continue;
            }
        };

        if !event.is_critical {
            continue;
        }

        if APPLICATION_XIDS.contains(&event.xid) {
            debug!(xid = event.xid, "ignoring application-level critical error");
            continue;
        }

        if event.is_fleet_wide() {
            warn!(
                xid = event.xid,
                "critical error without an originating accelerator, all devices go unhealthy"
            );
            for device in devices {
                if notify(unhealthy, device).is_err() {
                    return Ok(());
                }
            }
            continue;
        }

        for device in devices {
            if !device_matches_event(device, &event) {
                continue;
            }
            info!(
                xid = event.xid,
                id = %device.id,
                "critical error, device goes unhealthy"
            );
            if notify(unhealthy, device).is_err() {
                return Ok(());
            }
        }
    }
}

/// Sends one unhealthy notification; a closed channel means the watch
/// session is gone and the monitor should wind down gracefully.
fn notify(unhealthy: &mpsc::Sender<VirtualDevice>, device: &VirtualDevice) -> Result<(), ()> {
    unhealthy.send(device.clone()).map_err(|_| {
        tracing::error!("unhealthy notification channel closed, stopping health monitor");
    })
}

fn device_matches_event(device: &VirtualDevice, event: &FaultEvent) -> bool {
    let Some(event_uuid) = event.uuid.as_deref() else {
        return false;
    };
    let (gpu_uuid, gpu_instance_id, compute_instance_id) = device_id_scope(&device.id);

    gpu_uuid == event_uuid
        && instance_matches(gpu_instance_id, event.gpu_instance_id)
        && instance_matches(compute_instance_id, event.compute_instance_id)
}

/// A device whose id is not partition-scoped carries wildcard instance ids
/// and matches on uuid equality alone.
fn instance_matches(device_instance: u32, event_instance: u32) -> bool {
    device_instance == PARTITION_WILDCARD || device_instance == event_instance
}
