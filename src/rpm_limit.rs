/// Speed ceiling derived from the microstep setting
///
/// The driver can emit at most `STEP_S_LIMIT` step pulses per second, so the
/// finer the microstepping the lower the reachable RPM.

use crate::protocol::Microstep;

pub const FULL_STEPS_PER_REV: u32 = 200;
/// Maximum step pulses per second the driver board sustains.
pub const STEP_S_LIMIT: f64 = 5000.0;
pub const MIN_RPM: u32 = 5;
/// Limits are reported in multiples of this many RPM.
const RPM_GRANULARITY: f64 = 5.0;

/// Highest speed the operator may request at the given microstep, rounded to
/// the nearest 5 RPM (ties to even) and never below `MIN_RPM`.
pub fn max_rpm(microstep: Microstep) -> u32 {
    let steps_per_rev = f64::from(FULL_STEPS_PER_REV * microstep.value());
    let raw = (STEP_S_LIMIT / steps_per_rev) * 60.0;
    let rounded = (raw / RPM_GRANULARITY).round_ties_even() * RPM_GRANULARITY;
    rounded.max(f64::from(MIN_RPM)) as u32
}
