//! Plain-text OT type.
//!
//! An op walks the document from the start: `Retain(n)` skips `n`
//! characters, `Insert(s)` inserts `s` at the cursor, `Delete` removes
//! the next characters. On the wire these are a number, a string and
//! `{"d": n}` or `{"d": "removed"}`. Lengths count Unicode scalar values.
//!
//! A delete that carries the removed text is checked against the document
//! and can be inverted; one that carries only a length cannot. Presence is
//! a selection `{"start": n, "end": n}`.

use serde_json::{json, Map, Value};

use crate::{OtError, OtType, Side};

pub const URI: &str = "http://sharejs.org/types/textv1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextComponent {
    Retain(usize),
    Insert(String),
    Delete(Deleted),
}

/// What a delete knows about the characters it removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deleted {
    Len(usize),
    Text(String),
}

impl Deleted {
    pub fn len(&self) -> usize {
        match self {
            Deleted::Len(n) => *n,
            Deleted::Text(s) => char_len(s),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `count` characters starting at `offset`.
    fn slice(&self, offset: usize, count: usize) -> Deleted {
        match self {
            Deleted::Len(_) => Deleted::Len(count),
            Deleted::Text(s) => Deleted::Text(s.chars().skip(offset).take(count).collect()),
        }
    }

    /// Joins a delete that directly follows this one. The text survives
    /// only when both sides carry it.
    fn append(&mut self, next: Deleted) {
        match (&mut *self, next) {
            (Deleted::Text(s), Deleted::Text(t)) => s.push_str(&t),
            (this, next) => *this = Deleted::Len(this.len() + next.len()),
        }
    }
}

impl TextComponent {
    /// Length of the component in the document it applies to, or in the
    /// case of inserts, the length it adds.
    fn len(&self) -> usize {
        match self {
            TextComponent::Retain(n) => *n,
            TextComponent::Delete(d) => d.len(),
            TextComponent::Insert(s) => char_len(s),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_value(&self) -> Value {
        match self {
            TextComponent::Retain(n) => json!(n),
            TextComponent::Insert(s) => json!(s),
            TextComponent::Delete(Deleted::Len(n)) => json!({ "d": n }),
            TextComponent::Delete(Deleted::Text(s)) => json!({ "d": s }),
        }
    }

    fn from_value(value: &Value) -> Result<Self, OtError> {
        match value {
            Value::Number(n) => match n.as_u64() {
                Some(n) if n > 0 => Ok(TextComponent::Retain(n as usize)),
                _ => Err(OtError::InvalidOp(format!("Invalid retain: {n}"))),
            },
            Value::String(s) if !s.is_empty() => Ok(TextComponent::Insert(s.clone())),
            Value::Object(map) => match map.get("d") {
                Some(Value::Number(n)) => match n.as_u64() {
                    Some(d) if d > 0 => Ok(TextComponent::Delete(Deleted::Len(d as usize))),
                    _ => Err(OtError::InvalidOp(format!("Invalid delete: {value}"))),
                },
                Some(Value::String(s)) if !s.is_empty() => {
                    Ok(TextComponent::Delete(Deleted::Text(s.clone())))
                }
                _ => Err(OtError::InvalidOp(format!("Invalid delete: {value}"))),
            },
            other => Err(OtError::InvalidOp(format!("Invalid text component: {other}"))),
        }
    }
}

/// A parsed text op.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextOp(pub Vec<TextComponent>);

impl TextOp {
    pub fn from_value(value: &Value) -> Result<Self, OtError> {
        let items = value
            .as_array()
            .ok_or_else(|| OtError::InvalidOp("Text op must be an array".into()))?;
        let components = items
            .iter()
            .map(TextComponent::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(TextComponent::Retain(_)) = components.last() {
            return Err(OtError::InvalidOp("Op has a trailing retain".into()));
        }
        Ok(TextOp(components))
    }

    pub fn to_value(&self) -> Value {
        Value::Array(self.0.iter().map(TextComponent::to_value).collect())
    }

    /// Appends a component, merging it into the previous one when both
    /// are the same kind.
    fn push(&mut self, component: TextComponent) {
        if component.is_empty() {
            return;
        }
        match (self.0.last_mut(), component) {
            (Some(TextComponent::Retain(last)), TextComponent::Retain(n)) => *last += n,
            (Some(TextComponent::Delete(last)), TextComponent::Delete(d)) => last.append(d),
            (Some(TextComponent::Insert(last)), TextComponent::Insert(s)) => last.push_str(&s),
            (_, component) => self.0.push(component),
        }
    }

    fn trim(mut self) -> Self {
        if let Some(TextComponent::Retain(_)) = self.0.last() {
            self.0.pop();
        }
        self
    }

    pub fn apply(&self, doc: &str) -> Result<String, OtError> {
        let chars: Vec<char> = doc.chars().collect();
        let mut out = String::with_capacity(doc.len());
        let mut pos = 0;
        for component in &self.0 {
            match component {
                TextComponent::Retain(n) => {
                    if pos + n > chars.len() {
                        return Err(OtError::Apply("The op is too long for this document".into()));
                    }
                    out.extend(&chars[pos..pos + n]);
                    pos += n;
                }
                TextComponent::Insert(s) => out.push_str(s),
                TextComponent::Delete(d) => {
                    let n = d.len();
                    if pos + n > chars.len() {
                        return Err(OtError::Apply("The op deletes past the end of the document".into()));
                    }
                    if let Deleted::Text(s) = d {
                        if !chars[pos..pos + n].iter().copied().eq(s.chars()) {
                            return Err(OtError::Apply(format!(
                                "Deleted text {s:?} does not match the document"
                            )));
                        }
                    }
                    pos += n;
                }
            }
        }
        out.extend(&chars[pos..]);
        Ok(out)
    }

    /// The same op with every delete carrying the text it removes from
    /// `doc`.
    pub fn with_deleted_text(&self, doc: &str) -> Result<TextOp, OtError> {
        let chars: Vec<char> = doc.chars().collect();
        let mut out = TextOp::default();
        let mut pos = 0;
        for component in &self.0 {
            match component {
                TextComponent::Delete(d) => {
                    let n = d.len();
                    if pos + n > chars.len() {
                        return Err(OtError::Apply("The op deletes past the end of the document".into()));
                    }
                    out.push(TextComponent::Delete(Deleted::Text(chars[pos..pos + n].iter().collect())));
                    pos += n;
                }
                TextComponent::Retain(n) => {
                    out.push(TextComponent::Retain(*n));
                    pos += n;
                }
                insert @ TextComponent::Insert(_) => out.push(insert.clone()),
            }
        }
        Ok(out)
    }

    /// The op that undoes this one. Every delete must carry its text.
    pub fn invert(&self) -> Result<TextOp, OtError> {
        let mut out = TextOp::default();
        for component in &self.0 {
            out.push(match component {
                TextComponent::Retain(n) => TextComponent::Retain(*n),
                TextComponent::Insert(s) => TextComponent::Delete(Deleted::Text(s.clone())),
                TextComponent::Delete(Deleted::Text(s)) => TextComponent::Insert(s.clone()),
                TextComponent::Delete(Deleted::Len(_)) => {
                    return Err(OtError::InvalidOp(
                        "Cannot invert a delete that does not carry the deleted text".into(),
                    ))
                }
            });
        }
        Ok(out.trim())
    }

    pub fn transform(&self, other: &TextOp, side: Side) -> TextOp {
        let mut out = TextOp::default();
        let mut take = Taker::new(&self.0);

        for component in &other.0 {
            match component {
                TextComponent::Retain(n) => {
                    let mut remaining = *n;
                    while remaining > 0 {
                        let Some(chunk) = take.take(Some(remaining), Unit::Insert) else { break };
                        if !matches!(chunk, TextComponent::Insert(_)) {
                            remaining -= chunk.len();
                        }
                        out.push(chunk);
                    }
                }
                TextComponent::Insert(s) => {
                    if side == Side::Left && matches!(take.peek(), Some(TextComponent::Insert(_))) {
                        if let Some(chunk) = take.take(None, Unit::None) {
                            out.push(chunk);
                        }
                    }
                    out.push(TextComponent::Retain(char_len(s)));
                }
                TextComponent::Delete(d) => {
                    let mut remaining = d.len();
                    while remaining > 0 {
                        let Some(chunk) = take.take(Some(remaining), Unit::Insert) else { break };
                        match chunk {
                            insert @ TextComponent::Insert(_) => out.push(insert),
                            skipped => remaining -= skipped.len(),
                        }
                    }
                }
            }
        }
        while let Some(chunk) = take.take(None, Unit::None) {
            out.push(chunk);
        }
        out.trim()
    }

    pub fn compose(&self, second: &TextOp) -> TextOp {
        let mut out = TextOp::default();
        let mut take = Taker::new(&self.0);

        for component in &second.0 {
            match component {
                TextComponent::Retain(n) => {
                    let mut remaining = *n;
                    while remaining > 0 {
                        let Some(chunk) = take.take(Some(remaining), Unit::Delete) else { break };
                        if !matches!(chunk, TextComponent::Delete(_)) {
                            remaining -= chunk.len();
                        }
                        out.push(chunk);
                    }
                }
                TextComponent::Insert(s) => out.push(TextComponent::Insert(s.clone())),
                TextComponent::Delete(d) => {
                    let mut consumed = 0;
                    while consumed < d.len() {
                        let Some(chunk) = take.take(Some(d.len() - consumed), Unit::Delete) else { break };
                        match chunk {
                            TextComponent::Retain(k) => {
                                out.push(TextComponent::Delete(d.slice(consumed, k)));
                                consumed += k;
                            }
                            TextComponent::Insert(s) => consumed += char_len(&s),
                            delete @ TextComponent::Delete(_) => out.push(delete),
                        }
                    }
                }
            }
        }
        while let Some(chunk) = take.take(None, Unit::None) {
            out.push(chunk);
        }
        out.trim()
    }
}

/// Which component kind `Taker::take` must hand out whole.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Unit {
    Insert,
    Delete,
    None,
}

/// Cursor over an op that hands out components in slices.
struct Taker<'a> {
    op: &'a [TextComponent],
    index: usize,
    offset: usize,
}

impl<'a> Taker<'a> {
    fn new(op: &'a [TextComponent]) -> Self {
        Self { op, index: 0, offset: 0 }
    }

    fn peek(&self) -> Option<&TextComponent> {
        self.op.get(self.index)
    }

    /// Takes up to `max` characters of the next component; `None` takes
    /// the rest of it. Past the end of the op, the implicit trailing
    /// retain is returned.
    fn take(&mut self, max: Option<usize>, whole: Unit) -> Option<TextComponent> {
        let Some(component) = self.op.get(self.index) else {
            return max.map(TextComponent::Retain);
        };
        let remaining = component.len() - self.offset;
        let take_all = match (max, component) {
            (None, _) => true,
            (Some(_), TextComponent::Insert(_)) if whole == Unit::Insert => true,
            (Some(_), TextComponent::Delete(_)) if whole == Unit::Delete => true,
            (Some(max), _) => remaining <= max,
        };
        let count = match max {
            Some(max) if !take_all => max,
            _ => remaining,
        };
        let part = match component {
            TextComponent::Retain(_) => TextComponent::Retain(count),
            TextComponent::Delete(d) => TextComponent::Delete(d.slice(self.offset, count)),
            TextComponent::Insert(s) => {
                TextComponent::Insert(s.chars().skip(self.offset).take(count).collect())
            }
        };
        if take_all {
            self.index += 1;
            self.offset = 0;
        } else {
            self.offset += count;
        }
        Some(part)
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Moves a cursor through an op. An insert exactly at the cursor pushes
/// it forward only when the op is the cursor owner's own edit.
pub fn transform_position(mut cursor: usize, op: &TextOp, is_own_op: bool) -> usize {
    let mut pos = 0;
    for component in &op.0 {
        if cursor < pos || (cursor == pos && !is_own_op) {
            break;
        }
        match component {
            TextComponent::Retain(n) => {
                if cursor < pos + n || (cursor == pos + n && !is_own_op) {
                    break;
                }
                pos += n;
            }
            TextComponent::Insert(s) => {
                let len = char_len(s);
                pos += len;
                cursor += len;
            }
            TextComponent::Delete(d) => cursor -= d.len().min(cursor - pos),
        }
    }
    cursor
}

/// The plain-text type.
#[derive(Debug, Clone, Copy, Default)]
pub struct Text;

impl Text {
    fn parse_data(data: &Value) -> Result<&str, OtError> {
        data.as_str()
            .ok_or_else(|| OtError::Apply(format!("Text document must be a string, got {data}")))
    }

    fn parse_selection(presence: &Value) -> Result<(usize, usize), OtError> {
        let field = |name: &str| {
            presence
                .get(name)
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .ok_or_else(|| OtError::InvalidPresence(format!("Missing or invalid `{name}`: {presence}")))
        };
        Ok((field("start")?, field("end")?))
    }

    fn selection(start: usize, end: usize) -> Value {
        let mut map = Map::new();
        map.insert("start".into(), json!(start));
        map.insert("end".into(), json!(end));
        Value::Object(map)
    }
}

impl OtType for Text {
    fn name(&self) -> &'static str {
        "text"
    }

    fn uri(&self) -> &'static str {
        URI
    }

    fn create(&self, initial: Option<Value>) -> Result<Value, OtError> {
        match initial {
            None | Some(Value::Null) => Ok(Value::String(String::new())),
            Some(Value::String(s)) => Ok(Value::String(s)),
            Some(other) => Err(OtError::InvalidOp(format!(
                "Text documents are created from a string, got {other}"
            ))),
        }
    }

    fn normalize(&self, op: Value) -> Result<Value, OtError> {
        let parsed = TextOp::from_value(&op)?;
        let mut out = TextOp::default();
        for component in parsed.0 {
            out.push(component);
        }
        Ok(out.trim().to_value())
    }

    fn apply(&self, data: &Value, op: &Value) -> Result<Value, OtError> {
        let doc = Self::parse_data(data)?;
        Ok(Value::String(TextOp::from_value(op)?.apply(doc)?))
    }

    fn transform(&self, op: &Value, other: &Value, side: Side) -> Result<Value, OtError> {
        let op = TextOp::from_value(op)?;
        let other = TextOp::from_value(other)?;
        Ok(op.transform(&other, side).to_value())
    }

    fn can_compose(&self) -> bool {
        true
    }

    fn compose(&self, first: &Value, second: &Value) -> Result<Value, OtError> {
        let first = TextOp::from_value(first)?;
        let second = TextOp::from_value(second)?;
        Ok(first.compose(&second).to_value())
    }

    fn can_invert(&self) -> bool {
        true
    }

    fn invert(&self, op: &Value) -> Result<Value, OtError> {
        Ok(TextOp::from_value(op)?.invert()?.to_value())
    }

    fn apply_and_invert(&self, data: &Value, op: &Value) -> Result<(Value, Value), OtError> {
        let doc = Self::parse_data(data)?;
        let op = TextOp::from_value(op)?.with_deleted_text(doc)?;
        Ok((Value::String(op.apply(doc)?), op.invert()?.to_value()))
    }

    fn can_diff(&self) -> bool {
        true
    }

    fn diff(&self, old: &Value, new: &Value) -> Result<Value, OtError> {
        let old: Vec<char> = Self::parse_data(old)?.chars().collect();
        let new: Vec<char> = Self::parse_data(new)?.chars().collect();

        let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
        let max_suffix = old.len().min(new.len()) - prefix;
        let suffix = old
            .iter()
            .rev()
            .zip(new.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        let mut op = TextOp::default();
        op.push(TextComponent::Retain(prefix));
        op.push(TextComponent::Delete(Deleted::Text(
            old[prefix..old.len() - suffix].iter().collect(),
        )));
        op.push(TextComponent::Insert(new[prefix..new.len() - suffix].iter().collect()));
        Ok(op.trim().to_value())
    }

    fn supports_presence(&self) -> bool {
        true
    }

    fn create_presence(&self, presence: Value) -> Result<Value, OtError> {
        let (start, end) = Self::parse_selection(&presence)?;
        Ok(Self::selection(start, end))
    }

    fn transform_presence(
        &self,
        presence: &Value,
        op: &Value,
        is_own_op: bool,
    ) -> Result<Value, OtError> {
        let (start, end) = Self::parse_selection(presence)?;
        let op = TextOp::from_value(op)?;
        Ok(Self::selection(
            transform_position(start, &op, is_own_op),
            transform_position(end, &op, is_own_op),
        ))
    }

    fn is_noop(&self, op: &Value) -> bool {
        op.as_array().is_some_and(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(doc: &str, op: Value) -> String {
        Text.apply(&json!(doc), &op).unwrap().as_str().unwrap().to_string()
    }

    // ── apply ──

    #[test]
    fn test_apply_insert_and_delete() {
        assert_eq!(apply("", json!(["hi"])), "hi");
        assert_eq!(apply("hello world", json!([5, { "d": 6 }])), "hello");
        assert_eq!(apply("abc", json!([1, "X", { "d": 1 }])), "aXc");
    }

    #[test]
    fn test_apply_counts_characters_not_bytes() {
        assert_eq!(apply("héllo", json!([2, "!"])), "hé!llo");
    }

    #[test]
    fn test_apply_rejects_long_op() {
        let err = Text.apply(&json!("ab"), &json!([3, "x"])).unwrap_err();
        assert!(matches!(err, OtError::Apply(_)));
        let err = Text.apply(&json!("ab"), &json!([{ "d": 3 }])).unwrap_err();
        assert!(matches!(err, OtError::Apply(_)));
    }

    #[test]
    fn test_invalid_components() {
        assert!(Text.normalize(json!([0])).is_err());
        assert!(Text.normalize(json!([""])).is_err());
        assert!(Text.normalize(json!([{ "d": 0 }])).is_err());
        assert!(Text.normalize(json!([{ "d": "" }])).is_err());
        assert!(Text.normalize(json!([2])).is_err());
        assert!(Text.normalize(json!("abc")).is_err());
    }

    #[test]
    fn test_normalize_merges_adjacent() {
        let op = Text.normalize(json!([1, 2, "a", "b", { "d": 1 }, { "d": 2 }])).unwrap();
        assert_eq!(op, json!([3, "ab", { "d": 3 }]));
    }

    // ── transform ──

    fn assert_converges(doc: &str, a: Value, b: Value) -> String {
        let left = Text.transform(&a, &b, Side::Left).unwrap();
        let right = Text.transform(&b, &a, Side::Right).unwrap();
        let via_b = apply(&apply(doc, b), left);
        let via_a = apply(&apply(doc, a), right);
        assert_eq!(via_a, via_b);
        via_a
    }

    #[test]
    fn test_concurrent_inserts_converge() {
        assert_eq!(assert_converges("abc", json!([1, "X"]), json!([2, "Y"])), "aXbYc");
    }

    #[test]
    fn test_insert_tie_left_wins() {
        assert_eq!(assert_converges("", json!(["L"]), json!(["R"])), "LR");
    }

    #[test]
    fn test_insert_inside_deleted_range() {
        let result = assert_converges("abcdef", json!([1, { "d": 4 }]), json!([3, "X"]));
        assert_eq!(result, "aXf");
    }

    #[test]
    fn test_overlapping_deletes() {
        let result = assert_converges("abcdef", json!([1, { "d": 3 }]), json!([2, { "d": 3 }]));
        assert_eq!(result, "af");
    }

    #[test]
    fn test_transform_drops_trailing_retain() {
        let op = Text.transform(&json!(["a"]), &json!([{ "d": 2 }]), Side::Left).unwrap();
        assert_eq!(op, json!(["a"]));
    }

    // ── compose ──

    #[test]
    fn test_compose_matches_sequential_apply() {
        let doc = "hello world";
        let a = json!([5, " there", { "d": 6 }]);
        let b = json!([2, { "d": 3 }, 6, "!"]);
        let composed = Text.compose(&a, &b).unwrap();
        assert_eq!(apply(doc, composed), apply(&apply(doc, a), b));
    }

    #[test]
    fn test_compose_insert_then_delete_cancels() {
        let composed = Text.compose(&json!(["abc"]), &json!([{ "d": 3 }])).unwrap();
        assert_eq!(composed, json!([]));
    }

    // ── diff ──

    #[test]
    fn test_diff_replaces_middle() {
        let op = Text.diff(&json!("the cat sat"), &json!("the dog sat")).unwrap();
        assert_eq!(op, json!([4, { "d": "cat" }, "dog"]));
        assert_eq!(apply("the cat sat", op), "the dog sat");
    }

    #[test]
    fn test_diff_of_equal_strings_is_noop() {
        let op = Text.diff(&json!("same"), &json!("same")).unwrap();
        assert!(Text.is_noop(&op));
    }

    #[test]
    fn test_diff_repeated_characters() {
        let op = Text.diff(&json!("aaa"), &json!("aaaa")).unwrap();
        assert_eq!(apply("aaa", op), "aaaa");
    }

    // ── presence ──

    #[test]
    fn test_cursor_moves_past_remote_insert_before_it() {
        let op = TextOp::from_value(&json!([1, "xy"])).unwrap();
        assert_eq!(transform_position(3, &op, false), 5);
        assert_eq!(transform_position(0, &op, false), 0);
    }

    #[test]
    fn test_insert_at_cursor_depends_on_owner() {
        let op = TextOp::from_value(&json!([2, "xy"])).unwrap();
        assert_eq!(transform_position(2, &op, false), 2);
        assert_eq!(transform_position(2, &op, true), 4);
    }

    #[test]
    fn test_cursor_inside_deleted_range_collapses() {
        let op = TextOp::from_value(&json!([1, { "d": 4 }])).unwrap();
        assert_eq!(transform_position(3, &op, false), 1);
        assert_eq!(transform_position(6, &op, false), 2);
    }

    #[test]
    fn test_transform_presence_selection() {
        let presence = Text.create_presence(json!({ "start": 1, "end": 4 })).unwrap();
        let moved = Text.transform_presence(&presence, &json!(["ab"]), false).unwrap();
        assert_eq!(moved, json!({ "start": 3, "end": 6 }));
        assert!(Text.create_presence(json!({ "start": 1 })).is_err());
    }

    // ── invert ──

    #[test]
    fn test_delete_text_must_match() {
        assert_eq!(apply("abcdef", json!([1, { "d": "bc" }])), "adef");
        let err = Text.apply(&json!("abcdef"), &json!([1, { "d": "xy" }])).unwrap_err();
        assert!(matches!(err, OtError::Apply(_)));
    }

    #[test]
    fn test_invert_restores_document() {
        let doc = "hello world";
        let op = json!([2, { "d": "llo" }, "y", 1, "big "]);
        let after = apply(doc, op.clone());
        assert_eq!(after, "hey big world");
        let inverse = Text.invert(&op).unwrap();
        assert_eq!(apply(&after, inverse), doc);
    }

    #[test]
    fn test_invert_needs_deleted_text() {
        assert!(Text.can_invert());
        assert!(matches!(Text.invert(&json!([{ "d": 1 }])), Err(OtError::InvalidOp(_))));
    }

    #[test]
    fn test_apply_and_invert_fills_in_deletes() {
        let (after, inverse) = Text.apply_and_invert(&json!("abcdef"), &json!([1, { "d": 3 }, "X"])).unwrap();
        assert_eq!(after, json!("aXef"));
        assert_eq!(inverse, json!([1, "bcd", { "d": "X" }]));
        assert_eq!(apply("aXef", inverse), "abcdef");
    }

    #[test]
    fn test_deleted_text_survives_transform_and_compose() {
        let delete = json!([1, { "d": "bcd" }]);
        let insert = json!([2, "X"]);
        let moved = Text.transform(&delete, &insert, Side::Left).unwrap();
        assert_eq!(moved, json!([1, { "d": "b" }, 1, { "d": "cd" }]));
        let after = apply("abXcdef", moved.clone());
        assert_eq!(after, "aXef");
        assert_eq!(apply(&after, Text.invert(&moved).unwrap()), "abXcdef");

        let composed = Text.compose(&json!(["Z"]), &json!([2, { "d": "bc" }])).unwrap();
        assert_eq!(composed, json!(["Z", 1, { "d": "bc" }]));
        assert_eq!(apply("abcd", composed.clone()), "Zad");
        assert_eq!(apply("Zad", Text.invert(&composed).unwrap()), "abcd");
    }
}
