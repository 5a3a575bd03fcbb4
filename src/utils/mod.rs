//! Small shared helpers.

pub mod clock;

pub use clock::{system_clock, Clock, ManualClock, SystemClock};
