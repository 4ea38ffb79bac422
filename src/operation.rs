//! Operations and Operational Transformation.
//!
//! Implements operational transformation for real-time collaborative editing
//! over the `{Insert, Delete, Retain}` operation set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OtError;

/// The kind of edit an `Operation` carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    /// Insert `content` at `position`.
    Insert { content: String },
    /// Delete `length` code points starting at `position`.
    Delete { length: u64 },
    /// No-op placeholder, kept for version bookkeeping and round-trip.
    Retain,
}

/// An accepted or in-flight edit intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub op_type: OpType,
    /// Unicode code-point offset in the pre-operation document.
    pub position: u64,
    pub author: Uuid,
    /// Version of the document *after* applying this operation. Assigned by
    /// the Hub on acceptance; callers constructing a pending operation set it
    /// to their `base_version`.
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

impl Operation {
    pub fn insert(position: u64, content: String, author: Uuid, version: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            op_type: OpType::Insert { content },
            position,
            author,
            version,
            timestamp: Utc::now(),
        }
    }

    pub fn delete(position: u64, length: u64, author: Uuid, version: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            op_type: OpType::Delete { length },
            position,
            author,
            version,
            timestamp: Utc::now(),
        }
    }

    pub fn retain(author: Uuid, version: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            op_type: OpType::Retain,
            position: 0,
            author,
            version,
            timestamp: Utc::now(),
        }
    }

    /// Length of text this operation affects.
    pub fn len(&self) -> u64 {
        match &self.op_type {
            OpType::Insert { content } => content.chars().count() as u64,
            OpType::Delete { length } => *length,
            OpType::Retain => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_retain(&self) -> bool {
        matches!(self.op_type, OpType::Retain)
    }

    /// Apply this operation to `text`, indexing by Unicode code point.
    pub fn apply(&self, text: &str) -> Result<String, OtError> {
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len() as u64;

        match &self.op_type {
            OpType::Insert { content } => {
                if self.position > len {
                    return Err(OtError::InvalidPosition {
                        position: self.position,
                        len,
                    });
                }
                let pos = self.position as usize;
                let mut result = String::with_capacity(text.len() + content.len());
                result.extend(&chars[..pos]);
                result.push_str(content);
                result.extend(&chars[pos..]);
                Ok(result)
            }
            OpType::Delete { length } => {
                let end = self.position + length;
                if end > len {
                    return Err(OtError::InvalidRange {
                        position: self.position,
                        end,
                        len,
                    });
                }
                let pos = self.position as usize;
                let end = end as usize;
                let mut result = String::with_capacity(text.len());
                result.extend(&chars[..pos]);
                result.extend(&chars[end..]);
                Ok(result)
            }
            OpType::Retain => Ok(text.to_string()),
        }
    }

    fn with_position(&self, position: u64) -> Self {
        Self {
            id: self.id,
            op_type: self.op_type.clone(),
            position,
            author: self.author,
            version: self.version,
            timestamp: self.timestamp,
        }
    }

    fn with_delete_at(&self, position: u64, length: u64) -> Self {
        Self {
            id: self.id,
            op_type: OpType::Delete { length },
            position,
            author: self.author,
            version: self.version,
            timestamp: self.timestamp,
        }
    }

    fn into_retain(self) -> Self {
        Self {
            id: self.id,
            op_type: OpType::Retain,
            position: self.position,
            author: self.author,
            version: self.version,
            timestamp: self.timestamp,
        }
    }

    /// Clip this operation's position/length against the current text
    /// length, so a transformed operation that would otherwise violate the
    /// data-model invariants degrades to a valid, if inert, RETAIN rather
    /// than being rejected outright.
    pub fn clipped(&self, text_len: u64) -> Self {
        match &self.op_type {
            OpType::Insert { .. } => {
                if self.position > text_len {
                    self.with_position(text_len)
                } else {
                    self.clone()
                }
            }
            OpType::Delete { length } => {
                if self.position >= text_len {
                    self.clone().into_retain()
                } else {
                    let clipped_len = (*length).min(text_len - self.position);
                    if clipped_len == 0 {
                        self.clone().into_retain()
                    } else {
                        self.with_delete_at(self.position, clipped_len)
                    }
                }
            }
            OpType::Retain => self.clone(),
        }
    }
}

/// Transform `op_a` against `op_b`, which is assumed already applied to the
/// shared state. Most cases produce exactly one rewritten operation; a
/// DELETE whose range is split by a concurrent INSERT produces two. Since
/// `op_a` may fragment, the result is always `Vec<Operation>` so callers
/// (`History::transform_against_new`) can fold each fragment independently
/// through the rest of history.
pub fn transform(op_a: &Operation, op_b: &Operation) -> Vec<Operation> {
    match (&op_a.op_type, &op_b.op_type) {
        (OpType::Insert { .. }, OpType::Insert { content: b_content }) => {
            let b_len = b_content.chars().count() as u64;
            if op_a.position < op_b.position
                || (op_a.position == op_b.position && op_a.author.to_string() < op_b.author.to_string())
            {
                vec![op_a.clone()]
            } else {
                vec![op_a.with_position(op_a.position + b_len)]
            }
        }

        (OpType::Insert { .. }, OpType::Delete { length: b_len }) => {
            let b_end = op_b.position + b_len;
            if op_a.position <= op_b.position {
                vec![op_a.clone()]
            } else if op_a.position > b_end {
                vec![op_a.with_position(op_a.position - b_len)]
            } else {
                vec![op_a.with_position(op_b.position)]
            }
        }

        (OpType::Delete { length: a_len }, OpType::Insert { content: b_content }) => {
            let b_len = b_content.chars().count() as u64;
            let a_end = op_a.position + a_len;
            if a_end <= op_b.position {
                vec![op_a.clone()]
            } else if op_a.position >= op_b.position {
                vec![op_a.with_position(op_a.position + b_len)]
            } else {
                // The insert lands strictly inside [position, a_end): split
                // the delete around the text that was just inserted so its
                // net effect still removes exactly the originally-targeted
                // characters.
                let first_len = op_b.position - op_a.position;
                let second_pos = op_b.position + b_len;
                let second_len = a_end - op_b.position;
                let mut fragments = Vec::with_capacity(2);
                if first_len > 0 {
                    fragments.push(op_a.with_delete_at(op_a.position, first_len));
                }
                if second_len > 0 {
                    fragments.push(op_a.with_delete_at(second_pos, second_len));
                }
                if fragments.is_empty() {
                    fragments.push(op_a.clone().into_retain());
                }
                fragments
            }
        }

        (OpType::Delete { length: a_len }, OpType::Delete { length: b_len }) => {
            let a_end = op_a.position + a_len;
            let b_end = op_b.position + b_len;
            if a_end <= op_b.position {
                vec![op_a.clone()]
            } else if op_a.position >= b_end {
                vec![op_a.with_position(op_a.position - b_len)]
            } else {
                let overlap = a_end.min(b_end) - op_a.position.max(op_b.position);
                let new_pos = op_a.position.min(op_b.position);
                let new_len = a_len.saturating_sub(overlap);
                if new_len == 0 {
                    vec![op_a.with_delete_at(new_pos, 0).into_retain()]
                } else {
                    vec![op_a.with_delete_at(new_pos, new_len)]
                }
            }
        }

        // RETAIN carries no positional information that affects peers.
        _ => vec![op_a.clone()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn insert_applies_at_position() {
        let op = Operation::insert(0, "hello".to_string(), author(1), 1);
        assert_eq!(op.apply("").unwrap(), "hello");
        assert_eq!(op.apply("world").unwrap(), "helloworld");
    }

    #[test]
    fn delete_applies_by_code_point() {
        let op = Operation::delete(0, 5, author(1), 1);
        assert_eq!(op.apply("hello world").unwrap(), " world");
    }

    #[test]
    fn insert_insert_tie_break_is_lexicographic_on_author() {
        let low = author(1);
        let high = author(2);
        let a = Operation::insert(0, "A".to_string(), low, 1);
        let b = Operation::insert(0, "B".to_string(), high, 1);

        let a_prime = transform(&a, &b);
        let b_prime = transform(&b, &a);

        // S1: lower author keeps position 0, the other shifts past it.
        assert_eq!(a_prime[0].position, 0);
        assert_eq!(b_prime[0].position, 1);
    }

    #[test]
    fn convergence_holds_for_insert_insert() {
        let a = Operation::insert(0, "a".to_string(), author(1), 1);
        let b = Operation::insert(0, "b".to_string(), author(2), 1);

        let a_prime = &transform(&a, &b)[0];
        let b_prime = &transform(&b, &a)[0];

        let left = a.apply("").unwrap();
        let left = b_prime.apply(&left).unwrap();

        let right = b.apply("").unwrap();
        let right = a_prime.apply(&right).unwrap();

        assert_eq!(left, right);
    }

    #[test]
    fn convergence_holds_for_insert_delete_overlap() {
        // S2: delete "bcd" from "abcdef" while a concurrent insert lands
        // inside the deleted range.
        let del = Operation::delete(1, 3, author(1), 1);
        let ins = Operation::insert(2, "X".to_string(), author(2), 1);

        let del_prime = &transform(&del, &ins)[0];
        let ins_prime = &transform(&ins, &del)[0];

        let left = del.apply("abcdef").unwrap();
        let left = ins_prime.apply(&left).unwrap();

        let right = ins.apply("abcdef").unwrap();
        let right = del_prime.apply(&right).unwrap();

        assert_eq!(left, right);
        assert_eq!(left, "aXef");
    }

    #[test]
    fn delete_over_insert_splits_into_two_fragments() {
        // S7: a delete targeting "bcde" in "abcdef" is split by a concurrent
        // insert landing inside its range, rather than just shifted.
        let del = Operation::delete(1, 4, author(1), 1);
        let ins = Operation::insert(3, "XY".to_string(), author(2), 1);

        let mut fragments = transform(&del, &ins);
        assert_eq!(fragments.len(), 2);

        // Fragments share one coordinate frame computed before either is
        // applied; a consumer folding them against mutating text (as the Hub
        // does) must apply the rightmost one first so the earlier fragment's
        // position is still valid afterward.
        fragments.sort_by(|a, b| b.position.cmp(&a.position));

        let base = ins.apply("abcdef").unwrap();
        let mut text = base;
        for frag in &fragments {
            text = frag.apply(&text).unwrap();
        }
        assert_eq!(text, "aXYf");
    }

    #[test]
    fn clipped_degrades_out_of_range_delete_to_retain() {
        let op = Operation::delete(10, 5, author(1), 1);
        let clipped = op.clipped(3);
        assert!(clipped.is_retain());
    }

    #[test]
    fn clipped_shrinks_delete_that_partially_overruns() {
        let op = Operation::delete(2, 10, author(1), 1);
        let clipped = op.clipped(5);
        assert_eq!(clipped.len(), 3);
    }

    #[test]
    fn overlapping_deletes_reduce_to_retain_when_fully_consumed() {
        let a = Operation::delete(0, 5, author(1), 1);
        let b = Operation::delete(0, 5, author(2), 1);

        let a_prime = &transform(&a, &b)[0];
        assert!(a_prime.is_retain());
    }
}
