//! Background services

pub mod maintenance;

pub use maintenance::{CycleReport, MaintenanceHandle, MaintenanceService};
