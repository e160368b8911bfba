//! Oversubscribed GPU device pool
//!
//! Presents the GPUs of one machine to a cluster scheduler as a larger set
//! of independently health-tracked virtual devices. Two engines make up the
//! core: [`vdev`] slices physical capacity into virtual units with
//! reversible fake ids, and [`health`] watches the hardware fault stream and
//! retracts affected units. [`manager`] wraps both behind one capability set
//! per split mode; [`telemetry`] is the driver boundary.

pub mod config;
pub mod health;
pub mod logging;
pub mod manager;
pub mod selector;
pub mod telemetry;
pub mod vdev;
