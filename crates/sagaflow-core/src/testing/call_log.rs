use std::sync::{Arc, Mutex, MutexGuard};

/// Shared, ordered record of invocations.
///
/// Clone it into step closures and call [`record`](Self::record) from
/// forward and compensation functions.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// How many times `entry` was recorded.
    pub fn count(&self, entry: &str) -> usize {
        self.lock().iter().filter(|e| *e == entry).count()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.count(entry) > 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Assert the exact sequence of recorded entries.
    pub fn assert_order(&self, expected: &[&str]) {
        let entries = self.entries();
        assert_eq!(
            entries, expected,
            "Unexpected call order. Recorded: {:?}",
            entries
        );
    }

    /// Assert that `entry` was never recorded.
    pub fn assert_not_called(&self, entry: &str) {
        let entries = self.entries();
        assert!(
            !entries.iter().any(|e| e == entry),
            "Expected '{}' not to be called, but it was. Recorded: {:?}",
            entry,
            entries
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_entries() {
        let log = CallLog::new();
        let writer = log.clone();
        writer.record("a");
        writer.record("b");
        writer.record("a");

        log.assert_order(&["a", "b", "a"]);
        assert_eq!(log.count("a"), 2);
        log.assert_not_called("c");

        log.clear();
        assert!(log.entries().is_empty());
    }

    #[test]
    #[should_panic(expected = "not to be called")]
    fn test_assert_not_called_fails() {
        let log = CallLog::new();
        log.record("refund");
        log.assert_not_called("refund");
    }
}
