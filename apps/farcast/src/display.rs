//! Seam for host display mutation.
//!
//! Resizing the capture display and adjusting DPI/cursor size belong to the
//! desktop integration layer, not the negotiation layer; the supervisor only
//! decides *when* they happen (before the first frame of a new session) and
//! talks to whatever implementation was injected.

use tracing::debug;

pub trait DisplayControl: Send + Sync {
    /// Applies a `WIDTHxHEIGHT` resolution. Returns whether the display
    /// actually changed, which gates the remote-resolution notification.
    fn resize(&self, res: &str) -> bool;

    fn set_dpi(&self, dpi: u32) -> bool;

    fn set_cursor_size(&self, size: u32) -> bool;
}

/// Installed when no desktop integration is attached; acknowledges every
/// request so session startup proceeds.
pub struct NoopDisplay;

impl DisplayControl for NoopDisplay {
    fn resize(&self, res: &str) -> bool {
        debug!(target: "display", res, "no display integration; resize acknowledged");
        true
    }

    fn set_dpi(&self, dpi: u32) -> bool {
        debug!(target: "display", dpi, "no display integration; DPI change acknowledged");
        true
    }

    fn set_cursor_size(&self, size: u32) -> bool {
        debug!(target: "display", size, "no display integration; cursor size acknowledged");
        true
    }
}
