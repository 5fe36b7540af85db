pub mod container;
pub mod deployment_stamp;
pub mod drift_cache;
pub mod enrollment;
pub mod host;
pub mod iac_file;
pub mod iac_repo;
pub mod iac_service;
pub mod iac_stack;
pub mod runtime_stack;
pub mod settings;

pub use container::Container;
pub use deployment_stamp::{DeploymentMethod, DeploymentStamp, DeploymentStatus};
pub use drift_cache::StackDriftCache;
pub use enrollment::ServiceEnrollment;
pub use host::Host;
pub use iac_file::{IacFile, IacFileRole};
pub use iac_repo::IacRepo;
pub use iac_service::IacService;
pub use iac_stack::{DeployKind, IacStack, ScopeKind, SopsStatus};
pub use runtime_stack::RuntimeStack;
pub use settings::{AutoDevopsValue, SettingsOverride};
