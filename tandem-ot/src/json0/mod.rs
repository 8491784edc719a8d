//! JSON document type.
//!
//! An op is a list of components, each editing the value at a path:
//!
//! | Wire form          | Edit                                  |
//! |--------------------|---------------------------------------|
//! | `{p, na}`          | add to a number                       |
//! | `{p, si}` `{p, sd}`| insert / delete text at `p`'s offset  |
//! | `{p, li}` `{p, ld}`| insert / delete a list element        |
//! | `{p, ld, li}`      | replace a list element                |
//! | `{p, lm}`          | move a list element to index `lm`     |
//! | `{p, oi}` `{p, od}`| insert / delete an object key         |
//! | `{p, od, oi}`      | replace an object value               |
//!
//! Deletes carry the deleted value, so every op can be inverted.

mod component;
mod transform;

use serde_json::Value;

use crate::{OtError, OtType, Side};

pub use component::{op_to_value, parse_op, Component, Edit, PathSegment};

pub const URI: &str = "http://sharejs.org/types/JSONv0";

/// Applies one component to `data`, returning the new value.
pub fn apply_component(mut data: Value, c: &Component) -> Result<Value, OtError> {
    let Some((last, parents)) = c.path.split_last() else {
        return match &c.edit {
            Edit::ObjectInsert(v) | Edit::ObjectReplace { after: v, .. } => Ok(v.clone()),
            Edit::ObjectDelete(_) => Ok(Value::Null),
            Edit::NumberAdd(n) => match &data {
                Value::Number(current) => Ok(Value::Number(component::add_numbers(current, n)?)),
                _ => Err(OtError::Apply("Referenced element not a number".into())),
            },
            _ => Err(OtError::Apply("Path invalid".into())),
        };
    };

    let container = navigate(&mut data, parents)?;
    match &c.edit {
        Edit::NumberAdd(n) => {
            let slot = child(container, last)?;
            let sum = match &*slot {
                Value::Number(current) => component::add_numbers(current, n)?,
                _ => return Err(OtError::Apply("Referenced element not a number".into())),
            };
            *slot = Value::Number(sum);
        }
        Edit::StringInsert(s) => {
            let text = string_at(container)?;
            let offset = byte_offset(text, index(last)?)?;
            text.insert_str(offset, s);
        }
        Edit::StringDelete(s) => {
            let text = string_at(container)?;
            let start = byte_offset(text, index(last)?)?;
            if !text[start..].starts_with(s.as_str()) {
                return Err(OtError::Apply("Deleted string does not match".into()));
            }
            text.replace_range(start..start + s.len(), "");
        }
        Edit::ListInsert(v) => {
            let list = list_at(container)?;
            let i = index(last)?;
            if i > list.len() {
                return Err(OtError::Apply(format!("List index {i} out of range")));
            }
            list.insert(i, v.clone());
        }
        Edit::ListDelete(_) => {
            let list = list_at(container)?;
            let i = index(last)?;
            if i >= list.len() {
                return Err(OtError::Apply(format!("List index {i} out of range")));
            }
            list.remove(i);
        }
        Edit::ListReplace { after, .. } => {
            let list = list_at(container)?;
            let i = index(last)?;
            let slot = list
                .get_mut(i)
                .ok_or_else(|| OtError::Apply(format!("List index {i} out of range")))?;
            *slot = after.clone();
        }
        Edit::ListMove(to) => {
            let list = list_at(container)?;
            let from = index(last)?;
            if from >= list.len() || *to >= list.len() {
                return Err(OtError::Apply(format!("List move {from} -> {to} out of range")));
            }
            if from != *to {
                let item = list.remove(from);
                list.insert(*to, item);
            }
        }
        Edit::ObjectInsert(v) | Edit::ObjectReplace { after: v, .. } => {
            object_at(container)?.insert(key(last)?.to_string(), v.clone());
        }
        Edit::ObjectDelete(_) => {
            object_at(container)?.remove(key(last)?);
        }
    }
    Ok(data)
}

fn navigate<'a>(mut value: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value, OtError> {
    for segment in path {
        value = child(value, segment)?;
    }
    Ok(value)
}

fn child<'a>(value: &'a mut Value, segment: &PathSegment) -> Result<&'a mut Value, OtError> {
    let found = match (value, segment) {
        (Value::Object(map), PathSegment::Key(k)) => map.get_mut(k),
        (Value::Array(list), PathSegment::Index(i)) => list.get_mut(*i),
        _ => None,
    };
    found.ok_or_else(|| OtError::Apply(format!("Path invalid at {segment:?}")))
}

fn index(segment: &PathSegment) -> Result<usize, OtError> {
    segment
        .as_index()
        .ok_or_else(|| OtError::Apply(format!("Expected a list index, got {segment:?}")))
}

fn key(segment: &PathSegment) -> Result<&str, OtError> {
    match segment {
        PathSegment::Key(k) => Ok(k),
        PathSegment::Index(i) => Err(OtError::Apply(format!("Expected an object key, got {i}"))),
    }
}

fn list_at(value: &mut Value) -> Result<&mut Vec<Value>, OtError> {
    value
        .as_array_mut()
        .ok_or_else(|| OtError::Apply("Referenced element not a list".into()))
}

fn object_at(value: &mut Value) -> Result<&mut serde_json::Map<String, Value>, OtError> {
    value
        .as_object_mut()
        .ok_or_else(|| OtError::Apply("Referenced element not an object".into()))
}

fn string_at(value: &mut Value) -> Result<&mut String, OtError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(OtError::Apply(format!("Referenced element not a string (it was {other})"))),
    }
}

/// Converts a character offset into a byte offset.
fn byte_offset(text: &str, chars: usize) -> Result<usize, OtError> {
    if chars == text.chars().count() {
        return Ok(text.len());
    }
    text.char_indices()
        .nth(chars)
        .map(|(byte, _)| byte)
        .ok_or_else(|| OtError::Apply(format!("String offset {chars} out of range")))
}

/// Appends `c` to `dest`, merging it with the last component when both
/// edit the same path.
pub(crate) fn append(dest: &mut Vec<Component>, c: Component) {
    let action = match dest.last() {
        Some(last) if last.path == c.path => merge(&last.edit, &c),
        _ => Merge::Push,
    };
    match action {
        Merge::Push => dest.push(c),
        Merge::Cancel => {
            dest.pop();
        }
        Merge::Replace(edit) => {
            if let Some(last) = dest.last_mut() {
                last.edit = edit;
            }
        }
        Merge::Skip => {}
    }
}

enum Merge {
    Push,
    /// The two edits cancel out.
    Cancel,
    Replace(Edit),
    /// `c` is a no-op.
    Skip,
}

fn merge(last: &Edit, c: &Component) -> Merge {
    match (last, &c.edit) {
        (Edit::NumberAdd(a), Edit::NumberAdd(b)) => match component::add_numbers(a, b) {
            Ok(sum) => Merge::Replace(Edit::NumberAdd(sum)),
            Err(_) => Merge::Push,
        },
        (Edit::ListInsert(inserted), Edit::ListDelete(deleted)) if inserted == deleted => Merge::Cancel,
        (Edit::ListReplace { before, after }, Edit::ListDelete(deleted)) if after == deleted => {
            Merge::Replace(Edit::ListDelete(before.clone()))
        }
        (Edit::ObjectDelete(before), Edit::ObjectInsert(after)) => Merge::Replace(Edit::ObjectReplace {
            before: before.clone(),
            after: after.clone(),
        }),
        (
            Edit::ObjectInsert(_) | Edit::ObjectReplace { .. },
            Edit::ObjectDelete(_) | Edit::ObjectReplace { .. },
        ) => match (last.od(), c.edit.oi()) {
            (Some(before), Some(after)) => Merge::Replace(Edit::ObjectReplace {
                before: before.clone(),
                after: after.clone(),
            }),
            (None, Some(after)) => Merge::Replace(Edit::ObjectInsert(after.clone())),
            (Some(before), None) => Merge::Replace(Edit::ObjectDelete(before.clone())),
            (None, None) => Merge::Cancel,
        },
        (_, Edit::ListMove(to)) if Some(*to) == c.last_index() => Merge::Skip,
        _ => Merge::Push,
    }
}

pub fn invert_component(c: &Component) -> Component {
    let path = c.path.clone();
    let edit = match &c.edit {
        Edit::NumberAdd(n) => Edit::NumberAdd(component::negate(n)),
        Edit::StringInsert(s) => Edit::StringDelete(s.clone()),
        Edit::StringDelete(s) => Edit::StringInsert(s.clone()),
        Edit::ListInsert(v) => Edit::ListDelete(v.clone()),
        Edit::ListDelete(v) => Edit::ListInsert(v.clone()),
        Edit::ListReplace { before, after } => Edit::ListReplace {
            before: after.clone(),
            after: before.clone(),
        },
        Edit::ObjectInsert(v) => Edit::ObjectDelete(v.clone()),
        Edit::ObjectDelete(v) => Edit::ObjectInsert(v.clone()),
        Edit::ObjectReplace { before, after } => Edit::ObjectReplace {
            before: after.clone(),
            after: before.clone(),
        },
        Edit::ListMove(to) => {
            let mut path = path;
            let from = c.last_index().unwrap_or(*to);
            if let Some(last) = path.last_mut() {
                *last = PathSegment::Index(*to);
            }
            return Component::new(path, Edit::ListMove(from));
        }
    };
    Component::new(path, edit)
}

/// The JSON type.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json0;

impl OtType for Json0 {
    fn name(&self) -> &'static str {
        "json0"
    }

    fn uri(&self) -> &'static str {
        URI
    }

    fn create(&self, initial: Option<Value>) -> Result<Value, OtError> {
        Ok(initial.unwrap_or(Value::Null))
    }

    fn normalize(&self, op: Value) -> Result<Value, OtError> {
        let mut out = Vec::new();
        for c in parse_op(&op)? {
            append(&mut out, c);
        }
        Ok(op_to_value(&out))
    }

    fn apply(&self, data: &Value, op: &Value) -> Result<Value, OtError> {
        parse_op(op)?
            .iter()
            .try_fold(data.clone(), |value, c| apply_component(value, c))
    }

    fn transform(&self, op: &Value, other: &Value, side: Side) -> Result<Value, OtError> {
        let op = parse_op(op)?;
        let other = parse_op(other)?;
        Ok(op_to_value(&transform::transform(op, other, side)?))
    }

    fn can_compose(&self) -> bool {
        true
    }

    fn compose(&self, first: &Value, second: &Value) -> Result<Value, OtError> {
        let mut out = parse_op(first)?;
        for c in parse_op(second)? {
            append(&mut out, c);
        }
        Ok(op_to_value(&out))
    }

    fn can_invert(&self) -> bool {
        true
    }

    fn invert(&self, op: &Value) -> Result<Value, OtError> {
        let op = parse_op(op)?;
        Ok(op_to_value(
            &op.iter().rev().map(invert_component).collect::<Vec<_>>(),
        ))
    }

    fn can_diff(&self) -> bool {
        true
    }

    /// Whole-document replacement; json0 has no structural diff.
    fn diff(&self, old: &Value, new: &Value) -> Result<Value, OtError> {
        if old == new {
            return Ok(Value::Array(Vec::new()));
        }
        Ok(op_to_value(&[Component::new(
            Vec::new(),
            Edit::ObjectReplace {
                before: old.clone(),
                after: new.clone(),
            },
        )]))
    }

    fn is_noop(&self, op: &Value) -> bool {
        op.as_array().is_some_and(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply(data: Value, op: Value) -> Value {
        Json0.apply(&data, &op).unwrap()
    }

    // ── apply ──

    #[test]
    fn test_object_edits() {
        let doc = apply(json!({}), json!([{ "p": ["color"], "oi": "white" }]));
        assert_eq!(doc, json!({ "color": "white" }));
        let doc = apply(doc, json!([{ "p": ["color"], "od": "white", "oi": "gray" }]));
        assert_eq!(doc, json!({ "color": "gray" }));
        let doc = apply(doc, json!([{ "p": ["color"], "od": "gray" }]));
        assert_eq!(doc, json!({}));
    }

    #[test]
    fn test_bare_component_is_accepted() {
        let doc = apply(json!({}), json!({ "p": ["weight"], "oi": 40 }));
        assert_eq!(doc, json!({ "weight": 40 }));
    }

    #[test]
    fn test_list_edits() {
        let doc = apply(json!({ "l": [1, 2, 3] }), json!([{ "p": ["l", 1], "ld": 2 }]));
        assert_eq!(doc, json!({ "l": [1, 3] }));
        let doc = apply(doc, json!([{ "p": ["l", 0], "li": 0 }]));
        assert_eq!(doc, json!({ "l": [0, 1, 3] }));
        let doc = apply(doc, json!([{ "p": ["l", 0], "lm": 2 }]));
        assert_eq!(doc, json!({ "l": [1, 3, 0] }));
        let doc = apply(doc, json!([{ "p": ["l", 1], "ld": 3, "li": "x" }]));
        assert_eq!(doc, json!({ "l": [1, "x", 0] }));
    }

    #[test]
    fn test_number_and_string_edits() {
        let doc = apply(json!({ "n": 1, "s": "héllo" }), json!([
            { "p": ["n"], "na": 41 },
            { "p": ["s", 2], "si": "!" },
            { "p": ["s", 0], "sd": "h" }
        ]));
        assert_eq!(doc, json!({ "n": 42, "s": "é!llo" }));
    }

    #[test]
    fn test_list_delete_on_scalar_is_rejected() {
        let err = Json0
            .apply(&json!({ "name": "Scooby" }), &json!([{ "p": ["name", 0], "ld": "S" }]))
            .unwrap_err();
        assert!(matches!(err, OtError::Apply(_)));
        let err = Json0
            .apply(&json!({ "name": "Scooby" }), &json!([{ "p": ["name"], "ld": "Scooby" }]))
            .unwrap_err();
        assert!(matches!(err, OtError::InvalidOp(_)));
    }

    #[test]
    fn test_mismatched_string_delete() {
        let err = Json0
            .apply(&json!({ "s": "abc" }), &json!([{ "p": ["s", 0], "sd": "x" }]))
            .unwrap_err();
        assert_eq!(err, OtError::Apply("Deleted string does not match".into()));
    }

    #[test]
    fn test_root_replace() {
        let doc = apply(json!({ "a": 1 }), json!([{ "p": [], "od": { "a": 1 }, "oi": [1] }]));
        assert_eq!(doc, json!([1]));
    }

    // ── compose / invert ──

    #[test]
    fn test_compose_merges_number_adds() {
        let op = Json0
            .compose(&json!([{ "p": ["n"], "na": 1 }]), &json!([{ "p": ["n"], "na": 2 }]))
            .unwrap();
        assert_eq!(op, json!([{ "p": ["n"], "na": 3 }]));
    }

    #[test]
    fn test_compose_insert_then_delete_cancels() {
        let op = Json0
            .compose(&json!([{ "p": ["k"], "oi": 1 }]), &json!([{ "p": ["k"], "od": 1 }]))
            .unwrap();
        assert_eq!(op, json!([]));
        let op = Json0
            .compose(&json!([{ "p": [0], "li": "a" }]), &json!([{ "p": [0], "ld": "a" }]))
            .unwrap();
        assert_eq!(op, json!([]));
    }

    #[test]
    fn test_compose_law() {
        let doc = json!({ "a": "x", "l": [1, 2] });
        let a = json!([{ "p": ["a"], "od": "x", "oi": "y" }, { "p": ["l", 0], "li": 0 }]);
        let b = json!([{ "p": ["a"], "od": "y", "oi": "z" }, { "p": ["l", 2], "ld": 2 }]);
        let composed = Json0.compose(&a, &b).unwrap();
        assert_eq!(apply(doc.clone(), composed), apply(apply(doc, a), b));
    }

    #[test]
    fn test_invert_undoes() {
        let doc = json!({ "l": [1, 2, 3], "n": 5, "s": "abc", "o": { "k": true } });
        let op = json!([
            { "p": ["l", 0], "lm": 2 },
            { "p": ["n"], "na": -2 },
            { "p": ["s", 1], "sd": "b" },
            { "p": ["o", "k"], "od": true, "oi": false },
            { "p": ["l", 1], "ld": 3 }
        ]);
        let inverse = Json0.invert(&op).unwrap();
        assert_eq!(apply(apply(doc.clone(), op), inverse), doc);
    }

    #[test]
    fn test_diff_replaces_root() {
        let op = Json0.diff(&json!({ "a": 1 }), &json!({ "b": 2 })).unwrap();
        assert_eq!(apply(json!({ "a": 1 }), op), json!({ "b": 2 }));
        assert!(Json0.is_noop(&Json0.diff(&json!(1), &json!(1)).unwrap()));
    }

    #[test]
    fn test_no_presence() {
        assert!(!Json0.supports_presence());
        assert!(Json0.create_presence(json!({})).is_err());
    }
}
