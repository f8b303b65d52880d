//! The structural edit queue
//!
//! Pending layer edits are explicit records in queue order. Queuing an edit
//! at an index that already has one overwrites it (last writer wins).
//! Application walks the records most-recently-queued first. Strategies that
//! scan the chain queue their edits in ascending index order, so application
//! runs descending-index and original indices stay valid while layers are
//! removed and inserted. The dense-factorization strategies instead queue
//! the downstream replacement first and the insertion second; the insertion
//! then shifts the target right before the replacement lands on it.

use crate::error::{CompressError, Result};
use crate::nn::Layer;

/// A pending structural change at one chain position.
#[derive(Debug, Clone)]
pub enum EditAction {
    /// Remove the layer at the index.
    Delete,
    /// Insert the layer before the index.
    Insert(Layer),
    /// Replace the layer at the index.
    Replace(Layer),
}

impl EditAction {
    /// Short tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            EditAction::Delete => "delete",
            EditAction::Insert(_) => "insert",
            EditAction::Replace(_) => "replace",
        }
    }
}

/// One queued edit.
#[derive(Debug, Clone)]
pub struct EditRecord {
    /// Chain position the edit applies to.
    pub index: usize,
    /// What to do there.
    pub action: EditAction,
}

/// Ordered queue of pending edits.
#[derive(Debug, Clone, Default)]
pub struct EditQueue {
    records: Vec<EditRecord>,
}

impl EditQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an edit, overwriting any earlier edit at the same index.
    pub fn queue(&mut self, index: usize, action: EditAction) {
        self.records.retain(|r| r.index != index);
        self.records.push(EditRecord { index, action });
    }

    /// Number of pending edits.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop all pending edits.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// The queued records, in queue order.
    pub fn records(&self) -> &[EditRecord] {
        &self.records
    }

    /// Apply all pending edits to `layers`, most-recently-queued first.
    /// The queue keeps its records; the caller clears it once the rebuilt
    /// model is accepted.
    pub fn apply(&self, layers: &mut Vec<Layer>) -> Result<()> {
        for record in self.records.iter().rev() {
            let index = record.index;
            match &record.action {
                EditAction::Delete => {
                    if index >= layers.len() {
                        return Err(out_of_range(index, layers.len()));
                    }
                    layers.remove(index);
                }
                EditAction::Insert(layer) => {
                    if index > layers.len() {
                        return Err(out_of_range(index, layers.len()));
                    }
                    layers.insert(index, layer.clone());
                }
                EditAction::Replace(layer) => {
                    if index >= layers.len() {
                        return Err(out_of_range(index, layers.len()));
                    }
                    layers[index] = layer.clone();
                }
            }
        }
        Ok(())
    }
}

fn out_of_range(index: usize, len: usize) -> CompressError {
    CompressError::InvalidTarget {
        layer: format!("#{index}"),
        reason: format!("edit index out of range for a {len}-layer chain"),
    }
}
