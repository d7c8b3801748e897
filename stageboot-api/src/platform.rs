//! Platform hooks around the final handoff

/// Low-level platform services the boot core needs at its edges.
pub trait Platform {
    /// Quiesce the machine for the next stage: mask interrupts, clean and
    /// invalidate caches, stop DMA. Called once, immediately before the jump.
    fn cleanup_before_handoff(&mut self);

    /// Stop with an operator-visible message. Never resets silently.
    fn halt(&mut self, message: &str) -> !;
}
