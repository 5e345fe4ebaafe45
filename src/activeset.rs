//! Active set: process-wide membership map used for ingest-time dedup.
//!
//! Consistency is relaxed by design — the authoritative guard against two
//! workers touching the same site concurrently is the coordinator's per-site
//! serialization, not this map. This is purely a fast, cheap filter to
//! avoid re-enqueuing a URL that's already in flight.

use dashmap::DashSet;

/// Tracks normalized URLs currently in flight somewhere in the pipeline.
#[derive(Debug, Default)]
pub struct ActiveSet {
    present: DashSet<String>,
}

impl ActiveSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `url`, returning `true` if it was newly added (i.e. it was
    /// not already present).
    pub fn insert(&self, url: impl Into<String>) -> bool {
        self.present.insert(url.into())
    }

    #[must_use]
    pub fn contains(&self, url: &str) -> bool {
        self.present.contains(url)
    }

    pub fn remove(&self, url: &str) {
        self.present.remove(url);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.present.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_reports_whether_entry_was_new() {
        let set = ActiveSet::new();
        assert!(set.insert("https://example.com/1"));
        assert!(!set.insert("https://example.com/1"));
    }

    #[test]
    fn remove_clears_membership() {
        let set = ActiveSet::new();
        set.insert("https://example.com/1");
        set.remove("https://example.com/1");
        assert!(!set.contains("https://example.com/1"));
    }
}
