//! Abstractions over the environment the engine runs in

pub mod time;

pub use time::{micros_to_datetime, Clock, MockClock, SystemClock};
