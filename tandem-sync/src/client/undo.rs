//! Undo and redo history of one document handle.
//!
//! Both stacks hold edits that apply to the current local data, most recent
//! last. Every other edit applied to the document (remote ops, rollbacks,
//! local edits that are not undoable) is transformed into them, so an undo
//! never reverts somebody else's work.

use std::sync::Arc;

use serde_json::Value;
use tandem_ot::{OtError, OtType, Side};

/// How a local edit relates to the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Record {
    /// Not recorded; the stacks are transformed past it.
    Skip,
    /// A new undoable change. Clears the redo stack.
    Undoable,
    /// Folded into the most recent change.
    FixUp,
    /// Produced by `undo`; its inverse becomes redoable.
    Undo,
    /// Produced by `redo`; its inverse becomes undoable again.
    Redo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stack {
    Undo,
    Redo,
}

#[derive(Debug, Default)]
pub(crate) struct UndoStack {
    undo: Vec<Value>,
    redo: Vec<Value>,
    /// Stack that received the latest recorded change, for fix-ups.
    last: Option<Stack>,
    limit: usize,
}

impl UndoStack {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub(crate) fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub(crate) fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub(crate) fn pop_undo(&mut self) -> Option<Value> {
        self.undo.pop()
    }

    pub(crate) fn pop_redo(&mut self) -> Option<Value> {
        self.redo.pop()
    }

    pub(crate) fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.last = None;
    }

    /// Files `inverse`, the edit undoing a local edit just applied.
    pub(crate) fn record(&mut self, record: Record, inverse: Value, ty: &Arc<dyn OtType>) {
        match record {
            Record::Skip => {}
            Record::Undoable => {
                self.redo.clear();
                self.push(Stack::Undo, inverse);
            }
            Record::Undo => self.push(Stack::Redo, inverse),
            Record::Redo => self.push(Stack::Undo, inverse),
            Record::FixUp => {
                let target = match self.last {
                    Some(Stack::Undo) => self.undo.last_mut(),
                    Some(Stack::Redo) => self.redo.last_mut(),
                    None => None,
                };
                let Some(top) = target else {
                    return;
                };
                // The fix-up is undone first, then the change it fixed.
                match ty.compose(&inverse, top) {
                    Ok(composed) => *top = composed,
                    Err(e) => {
                        log::debug!("Dropping undo history, cannot fold fix-up: {e}");
                        self.clear();
                    }
                }
            }
        }
    }

    /// Moves both stacks past an edit that was applied to the document
    /// without being recorded.
    pub(crate) fn transform(&mut self, op: &Value, ty: &Arc<dyn OtType>) {
        if self.undo.is_empty() && self.redo.is_empty() {
            return;
        }
        let undo = transform_stack(&mut self.undo, op, ty);
        let redo = transform_stack(&mut self.redo, op, ty);
        if let Err(e) = undo.and(redo) {
            log::debug!("Dropping undo history: {e}");
            self.clear();
        }
    }

    fn push(&mut self, stack: Stack, op: Value) {
        let ops = match stack {
            Stack::Undo => &mut self.undo,
            Stack::Redo => &mut self.redo,
        };
        ops.push(op);
        if self.limit > 0 && ops.len() > self.limit {
            ops.remove(0);
        }
        self.last = Some(stack);
    }
}

/// The top entry applies to the current data, and each entry below it to
/// the data the entry above it produces; `op` walks down the stack.
fn transform_stack(stack: &mut [Value], op: &Value, ty: &Arc<dyn OtType>) -> Result<(), OtError> {
    let mut op = op.clone();
    for entry in stack.iter_mut().rev() {
        let next_entry = ty.transform(entry, &op, Side::Left)?;
        op = ty.transform(&op, entry, Side::Right)?;
        *entry = next_entry;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_ot::{Json0, Text};

    fn text() -> Arc<dyn OtType> {
        Arc::new(Text)
    }

    #[test]
    fn test_undoable_clears_redo() {
        let ty = text();
        let mut stack = UndoStack::new(10);
        stack.record(Record::Undoable, json!([{ "d": "a" }]), &ty);
        stack.record(Record::Undo, json!(["a"]), &ty);
        assert!(stack.can_redo());

        stack.record(Record::Undoable, json!([{ "d": "b" }]), &ty);
        assert!(!stack.can_redo());
        assert_eq!(stack.pop_undo(), Some(json!([{ "d": "b" }])));
    }

    #[test]
    fn test_limit_drops_oldest() {
        let ty = text();
        let mut stack = UndoStack::new(2);
        for s in ["a", "b", "c"] {
            stack.record(Record::Undoable, json!([{ "d": s }]), &ty);
        }
        assert_eq!(stack.pop_undo(), Some(json!([{ "d": "c" }])));
        assert_eq!(stack.pop_undo(), Some(json!([{ "d": "b" }])));
        assert_eq!(stack.pop_undo(), None);
    }

    #[test]
    fn test_remote_edit_shifts_history() {
        let ty = text();
        let mut stack = UndoStack::new(10);
        // "ab" typed into an empty document, as two changes.
        stack.record(Record::Undoable, json!([{ "d": "a" }]), &ty);
        stack.record(Record::Undoable, json!([1, { "d": "b" }]), &ty);

        // A peer prepends "X": "Xab".
        stack.transform(&json!(["X"]), &ty);
        let undo_b = stack.pop_undo().unwrap();
        assert_eq!(undo_b, json!([2, { "d": "b" }]));
        let after = ty.apply(&json!("Xab"), &undo_b).unwrap();
        assert_eq!(after, json!("Xa"));
        let undo_a = stack.pop_undo().unwrap();
        assert_eq!(ty.apply(&after, &undo_a).unwrap(), json!("X"));
    }

    #[test]
    fn test_fix_up_folds_into_last_change() {
        let ty: Arc<dyn OtType> = Arc::new(Json0);
        let mut stack = UndoStack::new(10);
        stack.record(Record::Undoable, json!([{ "p": ["n"], "od": 1 }]), &ty);
        stack.record(Record::FixUp, json!([{ "p": ["m"], "od": 2 }]), &ty);

        let undo = stack.pop_undo().unwrap();
        assert!(!stack.can_undo());
        let data = ty.apply(&json!({ "n": 1, "m": 2 }), &undo).unwrap();
        assert_eq!(data, json!({}));
    }

    #[test]
    fn test_fix_up_without_history_is_ignored() {
        let ty = text();
        let mut stack = UndoStack::new(10);
        stack.record(Record::FixUp, json!([{ "d": "a" }]), &ty);
        assert!(!stack.can_undo());
        assert!(!stack.can_redo());
    }
}
