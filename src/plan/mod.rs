//! Startup planning
//!
//! Turns a validated descriptor into ordered waves of services that can be
//! started together.

pub mod planner;

pub use planner::{StartupPlan, StartupPlanner, Wave};
