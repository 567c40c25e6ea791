//! Frame-driven update contract

use std::time::Duration;

/// Something the host application advances once per frame
pub trait Updatable {
    /// Advance by `delta`, the time since the previous call
    fn update(&mut self, delta: Duration);
}
