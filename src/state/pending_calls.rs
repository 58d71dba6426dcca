use indexmap::IndexSet;
use parking_lot::Mutex;

/// Tool-call ids that were announced to the caller and still await a result.
///
/// Has its own lock so registration never waits on the message log.
#[derive(Debug, Default)]
pub struct PendingCalls {
    ids: Mutex<IndexSet<String>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id was already pending.
    pub fn register(&self, id: &str) -> bool {
        self.ids.lock().insert(id.to_string())
    }

    /// Returns false if the id was not pending.
    pub fn resolve(&self, id: &str) -> bool {
        self.ids.lock().shift_remove(id)
    }

    /// Empties the set and returns its ids in issue order.
    pub fn drain_all(&self) -> Vec<String> {
        self.ids.lock().drain(..).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.ids.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_register_resolve_lifecycle() {
        let pending = PendingCalls::new();
        assert!(pending.register("c1"));
        assert!(!pending.register("c1"));
        assert!(pending.contains("c1"));

        assert!(pending.resolve("c1"));
        assert!(!pending.resolve("c1"));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_drain_all_keeps_issue_order_and_empties() {
        let pending = PendingCalls::new();
        for id in ["c3", "c1", "c2"] {
            pending.register(id);
        }
        pending.resolve("c1");

        assert_eq!(pending.drain_all(), vec!["c3".to_string(), "c2".to_string()]);
        assert!(pending.is_empty());
        assert!(pending.drain_all().is_empty());
    }

    #[test]
    fn test_concurrent_registration_is_not_lost() {
        let pending = Arc::new(PendingCalls::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let pending = Arc::clone(&pending);
                std::thread::spawn(move || {
                    for n in 0..50 {
                        pending.register(&format!("w{worker}-{n}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pending.len(), 400);
        assert_eq!(pending.snapshot().len(), 400);
    }
}
