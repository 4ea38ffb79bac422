//! Append-only, version-numbered operation log for a single document.

use std::collections::VecDeque;

use uuid::Uuid;

use crate::operation::{transform, Operation};

/// In-memory history of accepted operations for one document.
#[derive(Debug)]
pub struct History {
    operations: VecDeque<Operation>,
    current_version: u64,
    /// Oldest version still present in `operations`. Versions below this
    /// floor require a full resync from a snapshot.
    retained_floor: u64,
    retention_window: u64,
}

impl History {
    pub fn new(retention_window: u64) -> Self {
        Self {
            operations: VecDeque::new(),
            current_version: 0,
            retained_floor: 0,
            retention_window,
        }
    }

    /// Rehydrate from persisted operations, e.g. on Hub restart (S6).
    pub fn from_operations(operations: Vec<Operation>, retention_window: u64) -> Self {
        let current_version = operations.last().map(|op| op.version).unwrap_or(0);
        let retained_floor = operations.first().map(|op| op.version - 1).unwrap_or(0);
        Self {
            operations: operations.into(),
            current_version,
            retained_floor,
            retention_window,
        }
    }

    pub fn current_version(&self) -> u64 {
        self.current_version
    }

    pub fn retained_floor(&self) -> u64 {
        self.retained_floor
    }

    /// Assign the next version and append. Does not transform; callers must
    /// pass an operation already folded through `transform_against_new`.
    pub fn append(&mut self, mut op: Operation) -> Operation {
        self.current_version += 1;
        op.version = self.current_version;
        self.operations.push_back(op.clone());
        self.maybe_truncate();
        op
    }

    fn maybe_truncate(&mut self) {
        if self.current_version <= self.retention_window {
            return;
        }
        let target_floor = self.current_version - self.retention_window;
        // Truncate in batches of one quartile-window of slack, rather than
        // trimming a single entry on every append.
        if target_floor < self.retained_floor + self.retention_window / 4 {
            return;
        }
        self.truncate_up_to(target_floor);
    }

    pub fn truncate_up_to(&mut self, version: u64) {
        while let Some(front) = self.operations.front() {
            if front.version > version {
                break;
            }
            self.operations.pop_front();
        }
        self.retained_floor = self.retained_floor.max(version);
    }

    /// Operations with `version > v`, in ascending version order.
    pub fn since(&self, v: u64) -> Vec<Operation> {
        self.operations
            .iter()
            .filter(|op| op.version > v)
            .cloned()
            .collect()
    }

    pub fn is_stale(&self, base_version: u64) -> bool {
        base_version < self.retained_floor
    }

    /// Fold `op` forward through every operation accepted since
    /// `base_version`, producing the fragment(s) that should actually be
    /// appended. A DELETE whose range a later INSERT split produces two
    /// fragments, each of which is then folded independently through any
    /// remaining history.
    pub fn transform_against_new(&self, op: Operation, base_version: u64) -> Vec<Operation> {
        let mut pending = vec![op];
        for existing in self.since(base_version) {
            let mut next = Vec::with_capacity(pending.len());
            for candidate in pending {
                next.extend(transform(&candidate, &existing));
            }
            pending = next;
        }
        pending
    }

    /// Replay `operations[snapshot_version..current]` onto `snapshot`.
    pub fn text_from(&self, snapshot: &str, snapshot_version: u64) -> Result<String, crate::error::OtError> {
        let mut text = snapshot.to_string();
        for op in self.since(snapshot_version) {
            text = op.apply(&text)?;
        }
        Ok(text)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn get_by_id(&self, id: Uuid) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use uuid::Uuid;

    #[test]
    fn append_assigns_monotonic_versions() {
        let mut history = History::new(1000);
        let author = Uuid::new_v4();

        let a = history.append(Operation::insert(0, "a".to_string(), author, 0));
        let b = history.append(Operation::insert(1, "b".to_string(), author, 0));

        assert_eq!(a.version, 1);
        assert_eq!(b.version, 2);
        assert_eq!(history.current_version(), 2);
    }

    #[test]
    fn since_returns_suffix_in_order() {
        let mut history = History::new(1000);
        let author = Uuid::new_v4();
        history.append(Operation::insert(0, "a".to_string(), author, 0));
        history.append(Operation::insert(1, "b".to_string(), author, 0));
        history.append(Operation::insert(2, "c".to_string(), author, 0));

        let ops = history.since(1);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].version, 2);
        assert_eq!(ops[1].version, 3);
    }

    #[test]
    fn transform_against_new_folds_through_intervening_ops() {
        let mut history = History::new(1000);
        let author_a = Uuid::new_v4();
        let author_b = Uuid::new_v4();

        history.append(Operation::insert(0, "Hello".to_string(), author_a, 0));

        // S1: B submitted at base_version=0, concurrently with A.
        let pending = Operation::insert(0, "World".to_string(), author_b, 0);
        let fragments = history.transform_against_new(pending, 0);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].position, 5);
    }

    #[test]
    fn replay_matches_current_text() {
        let mut history = History::new(1000);
        let author = Uuid::new_v4();
        history.append(Operation::insert(0, "ab".to_string(), author, 0));
        history.append(Operation::insert(2, "cd".to_string(), author, 0));

        assert_eq!(history.text_from("", 0).unwrap(), "abcd");
    }
}
