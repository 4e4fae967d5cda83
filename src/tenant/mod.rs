//! Multi-tenant plumbing: directory lookups and the store registry.

pub mod directory;
pub mod registry;

pub use directory::{AccountInfo, DetailInfo, TenantDirectory, TenantInfo};
pub use registry::{LocalConnector, StoreConnector, TenantConnectionRegistry};
