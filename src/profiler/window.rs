//! Time-window allocation.
//!
//! Windows are fixed-width, contiguous, and strictly ordered per profile.
//! The allocator only ever consults the profile's latest window: flows inside
//! it are returned unchanged, flows past its end open exactly one new window
//! whose start is a width-aligned step forward from the previous start, and
//! flows before its start reuse it (the documented late-flow policy — see
//! DESIGN.md). Nothing here is wall-clock driven; every decision is a
//! function of (latest window, flow timestamp).

use crate::store::{ProfileStore, TimeWindow};

use super::config::DEFAULT_WIDTH_SECS;

/// Result of a window lookup: the window the flow belongs to, whether this
/// call created it, and the key of the window it closed in doing so.
pub struct Allocation {
    pub window: TimeWindow,
    pub opened: bool,
    /// Combined `profileid_twid` key of the previously-latest window, set
    /// only when this call moved the profile onto a new window.
    pub closed: Option<String>,
}

pub struct WindowAllocator {
    width: f64,
}

impl WindowAllocator {
    pub fn new(width: f64) -> Self {
        Self {
            width: if width > 0.0 { width } else { DEFAULT_WIDTH_SECS },
        }
    }

    /// Resolves the window a flow timestamp belongs to, creating or extending
    /// as needed. Idempotent: absent intervening flows, the same
    /// (profile, timestamp) resolves to the same window identity.
    pub fn window_for(&self, store: &dyn ProfileStore, profile: &str, ts: f64) -> Allocation {
        let last = match store.latest_window(profile) {
            None => {
                // First flow of the profile anchors its window grid.
                let window = store.create_window(profile, ts, self.width, 1);
                return Allocation { window, opened: true, closed: None };
            }
            Some(last) => last,
        };

        if last.contains(ts) {
            return Allocation { window: last, opened: false, closed: None };
        }

        if ts >= last.end() {
            // Advance in whole width steps from the previous start so the
            // grid stays aligned; the ordinal advances by the same count, so
            // numbering tracks the time axis without materialising the empty
            // windows in between.
            let steps = ((ts - last.start) / self.width).floor() as u64;
            let start = last.start + steps as f64 * self.width;
            let window = store.create_window(profile, start, self.width, last.ordinal + steps);
            let closed = last.key();
            return Allocation { window, opened: true, closed: Some(closed) };
        }

        // Late flow: earlier than the latest window. Reuse it (legacy policy).
        Allocation { window: last, opened: false, closed: None }
    }
}
