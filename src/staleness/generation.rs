use serde::{Deserialize, Serialize};

/// A pair of monotonic generation counters.
///
/// `dirty` counts generations produced (every change to the source data),
/// `update` is the newest generation a completed recomputation has consumed.
/// The derived data is stale while `dirty > update`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationCounter {
    dirty: i64,
    update: i64,
}

impl GenerationCounter {
    /// Restores a counter from stored values. `update` is clamped to `dirty`.
    pub fn from_parts(dirty: i64, update: i64) -> Self {
        Self {
            dirty,
            update: update.min(dirty),
        }
    }

    pub fn dirty_token(&self) -> i64 {
        self.dirty
    }

    pub fn update_token(&self) -> i64 {
        self.update
    }

    pub fn is_stale(&self) -> bool {
        self.dirty > self.update
    }

    /// Produces a new generation. Returns true when this call moved the
    /// counter from clean to stale.
    pub fn mark_dirty(&mut self) -> bool {
        let was_clean = !self.is_stale();
        self.dirty += 1;
        was_clean
    }

    /// Records that a recomputation started at generation `observed` has
    /// finished. Never moves `update` backwards or past `dirty`. Returns
    /// whether the counter is still stale, which happens when newer
    /// generations were produced while the recomputation ran.
    pub fn consume(&mut self, observed: i64) -> bool {
        self.update = self.update.max(observed.min(self.dirty));
        self.is_stale()
    }
}
