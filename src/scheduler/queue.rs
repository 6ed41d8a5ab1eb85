//! Ready queue: priority descending, arrival order within a priority.

use crate::task::{Task, TaskId, TaskMeta};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct Entry {
    priority: i32,
    seq: u64,
    task: Task,
}

impl Entry {
    fn key(&self) -> (i32, std::cmp::Reverse<u64>) {
        (self.priority, std::cmp::Reverse(self.seq))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Pending tasks awaiting admission.
#[derive(Default)]
pub struct ReadyQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task and return its arrival sequence.
    pub fn push(&mut self, task: Task) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            priority: task.meta().priority,
            seq,
            task,
        });
        seq
    }

    /// Remove the most urgent task (earliest arrival among equals).
    pub fn pop(&mut self) -> Option<Task> {
        self.heap.pop().map(|e| e.task)
    }

    pub fn peek_priority(&self) -> Option<i32> {
        self.heap.peek().map(|e| e.priority)
    }

    /// Remove a task by id, wherever it sits.
    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        if !self.heap.iter().any(|e| e.task.id() == id) {
            return None;
        }
        let mut removed = None;
        let entries = std::mem::take(&mut self.heap).into_vec();
        for entry in entries {
            if entry.task.id() == id {
                removed = Some(entry.task);
            } else {
                self.heap.push(entry);
            }
        }
        removed
    }

    /// Remove every task matching `pred`.
    pub fn remove_where(&mut self, pred: impl Fn(&TaskMeta) -> bool) -> Vec<Task> {
        let entries = std::mem::take(&mut self.heap).into_vec();
        let mut removed = Vec::new();
        for entry in entries {
            if pred(entry.task.meta()) {
                removed.push(entry.task);
            } else {
                self.heap.push(entry);
            }
        }
        removed
    }

    /// Metadata in admission order.
    pub fn metas(&self) -> Vec<TaskMeta> {
        let mut entries: Vec<&Entry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.task.meta().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.heap.iter().any(|e| e.task.id() == id)
    }
}
