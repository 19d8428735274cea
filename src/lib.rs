/// Stepper Panel Library
///
/// Control logic for a serial stepper-motor driver board: command pacing,
/// speed limits, telemetry history and the session controller.

pub mod protocol;
pub mod rpm_limit;
pub mod command_pacer;
pub mod telemetry;
pub mod serial_link;
pub mod intents;
pub mod controller;
pub mod config_loader;
