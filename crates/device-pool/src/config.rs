//! Configuration surface
//!
//! All knobs arrive through CLI flags with environment-variable bindings.
//! Range errors are rejected at parse time: the pool cannot be computed from
//! a bad reservation, so startup fails before any telemetry is touched.

use clap::Parser;
use clap::Subcommand;
use derive_more::Display;

#[derive(Parser)]
#[command(about = "Oversubscribed GPU device pool", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device pool daemon
    Daemon(DaemonArgs),
}

/// How physical accelerators are turned into virtual devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Display)]
pub enum DeviceSplitMode {
    /// Slice whole accelerators.
    #[display("whole")]
    Whole,
    /// Slice matching hardware partitions of partition-capable accelerators.
    #[display("partitioned")]
    Partitioned,
}

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "GPU_MEMORY_RESERVED_PERCENT",
        value_parser = clap::value_parser!(u64).range(1..=100),
        help = "Percentage of each accelerator's memory withheld from the virtual pool, within (0, 100]"
    )]
    pub reservation_percent: u64,

    #[arg(
        long,
        env = "DP_DISABLE_HEALTHCHECKS",
        help = "Disable health checks: `xids` or `all`"
    )]
    pub disable_health_checks: Option<String>,

    #[arg(
        long,
        env = "DEVICE_SPLIT_MODE",
        value_enum,
        default_value_t = DeviceSplitMode::Whole,
        help = "Slice whole accelerators or hardware partitions"
    )]
    pub split_mode: DeviceSplitMode,

    #[arg(
        long,
        env = "DEVICE_RESOURCE_CLASS",
        default_value = "nvidia.com/gpu",
        help = "Resource class hardware partitions are matched against"
    )]
    pub resource_class: String,

    #[arg(
        long,
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "In whole-device mode, exclude accelerators that have partitioning enabled"
    )]
    pub skip_partition_capable: bool,
}

/// Validated configuration handed to the pool components.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub reservation_percent: u64,
    pub disable_health_checks: Option<String>,
    pub split_mode: DeviceSplitMode,
    pub resource_class: String,
    pub skip_partition_capable: bool,
}

impl From<&DaemonArgs> for PoolConfig {
    fn from(args: &DaemonArgs) -> Self {
        Self {
            reservation_percent: args.reservation_percent,
            disable_health_checks: args.disable_health_checks.clone(),
            split_mode: args.split_mode,
            resource_class: args.resource_class.clone(),
            skip_partition_capable: args.skip_partition_capable,
        }
    }
}
