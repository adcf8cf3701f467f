pub mod ci_job;
pub mod managed_cluster;

pub const GROUP_VERSION: &str = "convoy.io/v1alpha1";

/// Finalizer token both controllers claim their objects with.
pub const FINALIZER: &str = "convoy.io/finalizer";

/// Label every child carries, valued with the owner's name.
pub const OWNER_LABEL: &str = "convoy.io/owner";
