//! Typed json0 components and their wire form.

use serde_json::{Map, Number, Value};

use crate::OtError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl PathSegment {
    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathSegment::Index(i) => Some(*i),
            PathSegment::Key(_) => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            PathSegment::Key(k) => Value::String(k.clone()),
            PathSegment::Index(i) => Value::from(*i),
        }
    }

    fn from_value(value: &Value) -> Result<Self, OtError> {
        match value {
            Value::String(s) => Ok(PathSegment::Key(s.clone())),
            Value::Number(n) => n
                .as_u64()
                .map(|i| PathSegment::Index(i as usize))
                .ok_or_else(|| OtError::InvalidOp(format!("Invalid path index: {n}"))),
            other => Err(OtError::InvalidOp(format!("Invalid path segment: {other}"))),
        }
    }
}

/// One edit at one path. Replace variants carry both sides so that every
/// component can be inverted.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    NumberAdd(Number),
    StringInsert(String),
    StringDelete(String),
    ListInsert(Value),
    ListDelete(Value),
    ListReplace { before: Value, after: Value },
    ListMove(usize),
    ObjectInsert(Value),
    ObjectDelete(Value),
    ObjectReplace { before: Value, after: Value },
}

impl Edit {
    pub fn li(&self) -> Option<&Value> {
        match self {
            Edit::ListInsert(v) | Edit::ListReplace { after: v, .. } => Some(v),
            _ => None,
        }
    }

    pub fn ld(&self) -> Option<&Value> {
        match self {
            Edit::ListDelete(v) | Edit::ListReplace { before: v, .. } => Some(v),
            _ => None,
        }
    }

    pub fn oi(&self) -> Option<&Value> {
        match self {
            Edit::ObjectInsert(v) | Edit::ObjectReplace { after: v, .. } => Some(v),
            _ => None,
        }
    }

    pub fn od(&self) -> Option<&Value> {
        match self {
            Edit::ObjectDelete(v) | Edit::ObjectReplace { before: v, .. } => Some(v),
            _ => None,
        }
    }

    pub fn lm(&self) -> Option<usize> {
        match self {
            Edit::ListMove(to) => Some(*to),
            _ => None,
        }
    }

    pub fn is_number_add(&self) -> bool {
        matches!(self, Edit::NumberAdd(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Edit::StringInsert(_) | Edit::StringDelete(_))
    }

    /// Sets the list-deleted value, turning an insert into a replace.
    pub(crate) fn set_ld(&mut self, value: Value) {
        *self = match std::mem::replace(self, Edit::ListMove(0)) {
            Edit::ListInsert(after) | Edit::ListReplace { after, .. } => Edit::ListReplace { before: value, after },
            Edit::ListDelete(_) => Edit::ListDelete(value),
            other => other,
        };
    }

    /// Drops the list-deleted value, turning a replace into an insert.
    pub(crate) fn drop_ld(&mut self) {
        if let Edit::ListReplace { after, .. } = self {
            *self = Edit::ListInsert(std::mem::take(after));
        }
    }

    pub(crate) fn set_od(&mut self, value: Value) {
        *self = match std::mem::replace(self, Edit::ListMove(0)) {
            Edit::ObjectInsert(after) | Edit::ObjectReplace { after, .. } => Edit::ObjectReplace { before: value, after },
            Edit::ObjectDelete(_) => Edit::ObjectDelete(value),
            other => other,
        };
    }

    pub(crate) fn drop_od(&mut self) {
        if let Edit::ObjectReplace { after, .. } = self {
            *self = Edit::ObjectInsert(std::mem::take(after));
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub path: Vec<PathSegment>,
    pub edit: Edit,
}

impl Component {
    pub fn new(path: Vec<PathSegment>, edit: Edit) -> Self {
        Self { path, edit }
    }

    /// Path length as seen by transform: a number add counts as one
    /// level deeper than its path, since it edits the value itself.
    pub(crate) fn operand_len(&self) -> usize {
        self.path.len() + usize::from(self.edit.is_number_add())
    }

    pub(crate) fn last_index(&self) -> Option<usize> {
        self.path.last().and_then(PathSegment::as_index)
    }

    pub fn from_value(value: &Value) -> Result<Self, OtError> {
        let map = value
            .as_object()
            .ok_or_else(|| OtError::InvalidOp(format!("Component must be an object: {value}")))?;

        let path = match map.get("p") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(PathSegment::from_value)
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => return Err(OtError::InvalidOp(format!("Path must be an array: {other}"))),
        };

        if map.contains_key("t") {
            return Err(OtError::InvalidOp("Embedded subtypes are not supported".into()));
        }

        let string = |key: &str| -> Result<String, OtError> {
            map.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| OtError::InvalidOp(format!("`{key}` must be a string")))
        };

        let edit = if let Some(na) = map.get("na") {
            match na {
                Value::Number(n) => Edit::NumberAdd(n.clone()),
                _ => return Err(OtError::InvalidOp("`na` must be a number".into())),
            }
        } else if map.contains_key("si") {
            Edit::StringInsert(string("si")?)
        } else if map.contains_key("sd") {
            Edit::StringDelete(string("sd")?)
        } else if let (Some(li), Some(ld)) = (map.get("li"), map.get("ld")) {
            Edit::ListReplace { before: ld.clone(), after: li.clone() }
        } else if let Some(li) = map.get("li") {
            Edit::ListInsert(li.clone())
        } else if let Some(ld) = map.get("ld") {
            Edit::ListDelete(ld.clone())
        } else if let Some(lm) = map.get("lm") {
            let to = lm
                .as_u64()
                .ok_or_else(|| OtError::InvalidOp("`lm` must be a list index".into()))?;
            Edit::ListMove(to as usize)
        } else if let (Some(oi), Some(od)) = (map.get("oi"), map.get("od")) {
            Edit::ObjectReplace { before: od.clone(), after: oi.clone() }
        } else if let Some(oi) = map.get("oi") {
            Edit::ObjectInsert(oi.clone())
        } else if let Some(od) = map.get("od") {
            Edit::ObjectDelete(od.clone())
        } else {
            return Err(OtError::InvalidOp(format!("Invalid or missing instruction in {value}")));
        };

        let component = Component { path, edit };
        component.check()?;
        Ok(component)
    }

    /// Verifies the last path segment has the kind the edit needs.
    fn check(&self) -> Result<(), OtError> {
        let last = self.path.last();
        let wants_index = matches!(
            self.edit,
            Edit::StringInsert(_)
                | Edit::StringDelete(_)
                | Edit::ListInsert(_)
                | Edit::ListDelete(_)
                | Edit::ListReplace { .. }
                | Edit::ListMove(_)
        );
        let ok = match (&self.edit, last) {
            (Edit::NumberAdd(_), _) => true,
            (Edit::ObjectInsert(_) | Edit::ObjectDelete(_) | Edit::ObjectReplace { .. }, None) => true,
            (_, None) => false,
            (_, Some(PathSegment::Index(_))) => wants_index,
            (_, Some(PathSegment::Key(_))) => !wants_index,
        };
        if ok {
            Ok(())
        } else {
            Err(OtError::InvalidOp(format!(
                "Path {:?} does not fit {:?}",
                self.path, self.edit
            )))
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "p".into(),
            Value::Array(self.path.iter().map(PathSegment::to_value).collect()),
        );
        match &self.edit {
            Edit::NumberAdd(n) => {
                map.insert("na".into(), Value::Number(n.clone()));
            }
            Edit::StringInsert(s) => {
                map.insert("si".into(), Value::String(s.clone()));
            }
            Edit::StringDelete(s) => {
                map.insert("sd".into(), Value::String(s.clone()));
            }
            Edit::ListInsert(v) => {
                map.insert("li".into(), v.clone());
            }
            Edit::ListDelete(v) => {
                map.insert("ld".into(), v.clone());
            }
            Edit::ListReplace { before, after } => {
                map.insert("ld".into(), before.clone());
                map.insert("li".into(), after.clone());
            }
            Edit::ListMove(to) => {
                map.insert("lm".into(), Value::from(*to));
            }
            Edit::ObjectInsert(v) => {
                map.insert("oi".into(), v.clone());
            }
            Edit::ObjectDelete(v) => {
                map.insert("od".into(), v.clone());
            }
            Edit::ObjectReplace { before, after } => {
                map.insert("od".into(), before.clone());
                map.insert("oi".into(), after.clone());
            }
        }
        Value::Object(map)
    }
}

/// Parses an op: an array of components, or a single bare component.
pub fn parse_op(value: &Value) -> Result<Vec<Component>, OtError> {
    match value {
        Value::Array(items) => items.iter().map(Component::from_value).collect(),
        Value::Object(_) => Ok(vec![Component::from_value(value)?]),
        other => Err(OtError::InvalidOp(format!("json0 op must be an array: {other}"))),
    }
}

pub fn op_to_value(op: &[Component]) -> Value {
    Value::Array(op.iter().map(Component::to_value).collect())
}

pub(crate) fn add_numbers(a: &Number, b: &Number) -> Result<Number, OtError> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(Number::from(sum));
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).ok_or_else(|| OtError::Apply(format!("Number add produced {sum}")))
}

pub(crate) fn negate(n: &Number) -> Number {
    if let Some(i) = n.as_i64().and_then(i64::checked_neg) {
        return Number::from(i);
    }
    Number::from_f64(-n.as_f64().unwrap_or(0.0)).unwrap_or_else(|| Number::from(0))
}
