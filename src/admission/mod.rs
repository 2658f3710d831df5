//! Admission control: resource-aware dispatch of claimable tasks.

pub mod controller;
pub mod policy;

pub use controller::{
    AdmissionConfig, AdmissionController, AdmissionDecision, InFlightWorker, spawn_admission_loop,
};
pub use policy::{Ceilings, Pressure, ResourceDimension};
