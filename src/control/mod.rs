mod controller;
mod inputs;

pub use controller::{Controller, Pacing, RunSummary, StepController};
pub use inputs::{ControlCommand, ControllerHandle};
