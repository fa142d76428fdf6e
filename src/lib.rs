//! Keel - dependency-ordered startup for multi-service projects
//!
//! Keel reads a compose-style deployment descriptor, checks it for
//! dangling references, dependency cycles and resource conflicts, and
//! derives the waves in which services can be started. It provides:
//!
//! - Descriptor parsing with multi-file overlays and variable interpolation
//! - Validation of references, cycles, ports and mount targets
//! - Deterministic wave planning
//! - A wave executor with readiness polling and cancellation

pub mod descriptor;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod plan;

pub use descriptor::{Descriptor, DescriptorParser, DescriptorValidator};
pub use error::{KeelError, Result};
pub use orchestrator::{Orchestrator, ReadinessPolicy, StartupReport};
pub use plan::{StartupPlan, StartupPlanner, Wave};
