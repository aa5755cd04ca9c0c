use std::collections::HashMap;

/// How long a typing indicator stays armed without a refresh or an
/// explicit `typing:stop`.
pub const DEFAULT_TYPING_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, Clone)]
struct TypingEntry {
    name: String,
    deadline_ms: u64,
}

/// Per-user typing indicators. Ephemeral by contract: entries never touch
/// the message cache and expire on their own once `deadline_ms` passes.
#[derive(Debug)]
pub struct TypingTracker {
    timeout_ms: u64,
    entries: HashMap<String, TypingEntry>,
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_TIMEOUT_MS)
    }
}

impl TypingTracker {
    #[must_use]
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            entries: HashMap::new(),
        }
    }

    /// Arm (or refresh) the indicator for a user.
    pub fn start(&mut self, user_id: &str, name: &str, now_ms: u64) {
        self.entries.insert(
            user_id.to_owned(),
            TypingEntry {
                name: name.to_owned(),
                deadline_ms: now_ms.saturating_add(self.timeout_ms),
            },
        );
    }

    /// Explicit stop clears the indicator immediately.
    pub fn stop(&mut self, user_id: &str) {
        self.entries.remove(user_id);
    }

    /// Users currently typing, pruning anything past its deadline.
    /// Sorted by user id so render order is stable.
    pub fn active(&mut self, now_ms: u64) -> Vec<(String, String)> {
        self.entries.retain(|_, entry| entry.deadline_ms > now_ms);
        let mut active: Vec<(String, String)> = self
            .entries
            .iter()
            .map(|(user_id, entry)| (user_id.clone(), entry.name.clone()))
            .collect();
        active.sort();
        active
    }
}

#[cfg(test)]
mod tests {
    use super::TypingTracker;

    #[test]
    fn indicator_expires_after_timeout() {
        let mut tracker = TypingTracker::new(3000);
        tracker.start("u1", "Alice", 10_000);

        assert_eq!(tracker.active(12_000).len(), 1);
        assert!(tracker.active(13_000).is_empty());
    }

    #[test]
    fn explicit_stop_clears_immediately() {
        let mut tracker = TypingTracker::new(3000);
        tracker.start("u1", "Alice", 10_000);
        tracker.stop("u1");
        assert!(tracker.active(10_001).is_empty());
    }

    #[test]
    fn restart_refreshes_the_deadline() {
        let mut tracker = TypingTracker::new(3000);
        tracker.start("u1", "Alice", 10_000);
        tracker.start("u1", "Alice", 12_000);
        assert_eq!(tracker.active(14_000), vec![(
            String::from("u1"),
            String::from("Alice"),
        )]);
    }
}
