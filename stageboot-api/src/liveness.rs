//! Watchdog servicing

/// Liveness signal for a hardware watchdog.
///
/// `kick` must be callable at any point and have no side effect beyond
/// restarting the watchdog timer.
pub trait Liveness {
    fn kick(&mut self);
}

/// Platforms without a watchdog
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWatchdog;

impl Liveness for NoWatchdog {
    fn kick(&mut self) {}
}

