//! Software timers driven by one shared scheduler thread

pub mod list;
pub mod scheduler;

pub use list::{is_expired, Tick};
pub use scheduler::{Timer, TimerScheduler};
