//! Warden: local multi-service platform supervisor
//!
//! Starts native processes, container stacks and externally managed services
//! in phases, gates each phase on health checks, watches configuration files
//! for drift, and keeps restorable backups of the platform's config.

pub mod api;
pub mod backup;
pub mod config;
pub mod descriptors;
pub mod drift;
pub mod health;
pub mod phases;
pub mod probe;
pub mod process;
pub mod remediation;
pub mod stack;
pub mod status;
pub mod supervisor;
pub mod telemetry;

pub use config::{load_config, WardenConfig};
pub use supervisor::Supervisor;
