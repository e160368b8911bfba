//! Partition selection policy
//!
//! Decides which hardware partitions satisfy a requested resource class.

use crate::telemetry::PartitionInfo;

pub trait PartitionSelector: Send + Sync {
    fn matches(&self, partition: &PartitionInfo, resource_class: &str) -> bool;
}

/// Matches partitions by vendor profile name.
///
/// A partition satisfies either the profile-scoped class
/// `<prefix>/mig-<profile>` or the plain `<prefix>/gpu` class under which
/// every partition is advertised uniformly.
pub struct ProfileNameSelector {
    resource_prefix: String,
}

impl ProfileNameSelector {
    pub fn new(resource_prefix: impl Into<String>) -> Self {
        Self {
            resource_prefix: resource_prefix.into(),
        }
    }
}

impl PartitionSelector for ProfileNameSelector {
    fn matches(&self, partition: &PartitionInfo, resource_class: &str) -> bool {
        resource_class == format!("{}/gpu", self.resource_prefix)
            || resource_class
                == format!("{}/mig-{}", self.resource_prefix, partition.profile_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(profile: &str) -> PartitionInfo {
        PartitionInfo {
            gpu_instance_id: 1,
            compute_instance_id: 0,
            profile_name: profile.to_string(),
            uuid: None,
        }
    }

    #[test]
    fn matches_profile_scoped_class() {
        let selector = ProfileNameSelector::new("nvidia.com");
        assert!(selector.matches(&partition("1g.5gb"), "nvidia.com/mig-1g.5gb"));
        assert!(!selector.matches(&partition("2g.10gb"), "nvidia.com/mig-1g.5gb"));
    }

    #[test]
    fn matches_plain_class_for_any_profile() {
        let selector = ProfileNameSelector::new("nvidia.com");
        assert!(selector.matches(&partition("1g.5gb"), "nvidia.com/gpu"));
        assert!(selector.matches(&partition("2g.10gb"), "nvidia.com/gpu"));
    }

    #[test]
    fn rejects_foreign_prefix() {
        let selector = ProfileNameSelector::new("nvidia.com");
        assert!(!selector.matches(&partition("1g.5gb"), "amd.com/gpu"));
    }
}
