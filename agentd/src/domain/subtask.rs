//! Subtask (Node) and Plan: the ordered work queue the Dispatcher drains.

use serde::{Deserialize, Serialize};

/// A single unit of plan work. Belongs to exactly one of a [`Plan`]'s three
/// ordered lists at any given time (spec §3 invariant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub name: String,
    pub info: String,
}

impl Subtask {
    pub fn new(name: impl Into<String>, info: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            info: info.into(),
        }
    }
}

/// The subtask queue for a task, derived from a DAG topological sort.
/// Replanning discards `remaining` and rebuilds it; `completed`/`failed` are
/// history and survive a replan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub remaining: Vec<Subtask>,
    pub completed: Vec<Subtask>,
    pub failed: Vec<Subtask>,
}

impl Plan {
    pub fn new(remaining: Vec<Subtask>) -> Self {
        Self {
            remaining,
            completed: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Pop the next subtask to work, if any remain.
    pub fn pop_front(&mut self) -> Option<Subtask> {
        if self.remaining.is_empty() {
            None
        } else {
            Some(self.remaining.remove(0))
        }
    }

    pub fn mark_completed(&mut self, subtask: Subtask) {
        self.completed.push(subtask);
    }

    pub fn mark_failed(&mut self, subtask: Subtask) {
        self.failed.push(subtask);
    }

    /// Replace `remaining` with a freshly planned queue, preserving history.
    pub fn replan(&mut self, remaining: Vec<Subtask>) {
        self.remaining = remaining;
    }

    pub fn is_drained(&self) -> bool {
        self.remaining.is_empty()
    }
}
