//! Projections: named views of a collection that expose a subset of its
//! documents' top-level fields.
//!
//! A projection is addressed like any collection. Reads go to the target
//! collection and come back filtered; writes through a projection may only
//! touch the fields it exposes. Only `json0` documents can be projected.

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use tandem_ot::Json0;
use tandem_ot::OtType;

use crate::error::SyncError;
use crate::op::{Op, OpKind, Snapshot};

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub name: String,
    /// Collection the documents live in.
    pub target: String,
    pub fields: BTreeSet<String>,
}

impl Projection {
    pub fn new<I, S>(name: impl Into<String>, target: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            target: target.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn project_snapshot(&self, snapshot: &mut Snapshot) -> Result<(), SyncError> {
        let Some(type_uri) = snapshot.type_uri.as_deref() else {
            return Ok(());
        };
        self.require_json0(type_uri)?;
        snapshot.data = self.project_data(&snapshot.data);
        Ok(())
    }

    /// The op as a reader of the projection sees it.
    pub fn project_op(&self, op: &mut Op) -> Result<(), SyncError> {
        match &mut op.kind {
            OpKind::Create(create) => {
                self.require_json0(&create.type_uri)?;
                if let Some(data) = &create.data {
                    create.data = Some(self.project_data(data));
                }
            }
            OpKind::Edit(edit) => *edit = self.project_edit(edit)?,
            OpKind::Del | OpKind::Noop => {}
        }
        Ok(())
    }

    /// Refuses a submission that reaches outside the projected fields.
    /// `type_uri` is the document's current type.
    pub fn check_op(&self, type_uri: Option<&str>, kind: &OpKind) -> Result<(), SyncError> {
        match kind {
            OpKind::Create(create) => {
                self.require_json0(&create.type_uri)?;
                let data = create.data.as_ref().unwrap_or(&Value::Null);
                match data {
                    Value::Null => Ok(()),
                    Value::Object(map) => match map.keys().find(|k| !self.fields.contains(*k)) {
                        Some(key) => Err(self.outside(key)),
                        None => Ok(()),
                    },
                    _ => Err(SyncError::Projection(format!(
                        "{} can only create objects",
                        self.name
                    ))),
                }
            }
            OpKind::Edit(edit) => {
                if let Some(type_uri) = type_uri {
                    self.require_json0(type_uri)?;
                }
                for component in components(edit)? {
                    let root = component
                        .get("p")
                        .and_then(Value::as_array)
                        .and_then(|p| p.first())
                        .ok_or_else(|| {
                            SyncError::Projection(format!("{} cannot replace the whole document", self.name))
                        })?;
                    if !root.as_str().is_some_and(|f| self.fields.contains(f)) {
                        return Err(self.outside(&root.to_string()));
                    }
                }
                Ok(())
            }
            OpKind::Del | OpKind::Noop => Ok(()),
        }
    }

    /// Keeps the projected keys of an object. Anything else projects to
    /// `null`.
    pub fn project_data(&self, data: &Value) -> Value {
        let Value::Object(map) = data else {
            return Value::Null;
        };
        let projected: Map<String, Value> = map
            .iter()
            .filter(|(key, _)| self.fields.contains(key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Value::Object(projected)
    }

    fn project_edit(&self, edit: &Value) -> Result<Value, SyncError> {
        let mut projected = Vec::new();
        for component in components(edit)? {
            let path = component.get("p").and_then(Value::as_array);
            match path.and_then(|p| p.first()) {
                None => {
                    let mut replaced = Map::new();
                    replaced.insert("p".into(), Value::Array(Vec::new()));
                    for key in ["od", "oi"] {
                        if let Some(value) = component.get(key) {
                            let value = self.project_data(value);
                            if !value.is_null() {
                                replaced.insert(key.into(), value);
                            }
                        }
                    }
                    projected.push(Value::Object(replaced));
                }
                Some(root) => {
                    if root.as_str().is_some_and(|f| self.fields.contains(f)) {
                        projected.push(component.clone());
                    }
                }
            }
        }
        Ok(Value::Array(projected))
    }

    fn require_json0(&self, type_uri: &str) -> Result<(), SyncError> {
        if type_uri == Json0.uri() || type_uri == Json0.name() {
            Ok(())
        } else {
            Err(SyncError::Projection(format!(
                "{} cannot project documents of type {type_uri}",
                self.name
            )))
        }
    }

    fn outside(&self, field: &str) -> SyncError {
        SyncError::Projection(format!("{field} is not a field of {}", self.name))
    }
}

fn components(edit: &Value) -> Result<&Vec<Value>, SyncError> {
    edit.as_array()
        .filter(|c| c.iter().all(Value::is_object))
        .ok_or_else(|| SyncError::Projection("only json0 ops can be projected".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::CreateOp;
    use serde_json::json;

    const JSON0: &str = "http://sharejs.org/types/JSONv0";

    fn names() -> Projection {
        Projection::new("dog_names", "dogs", ["name"])
    }

    fn edit_op(edit: Value) -> Op {
        Op {
            src: "a".into(),
            seq: 1,
            v: 1,
            kind: OpKind::Edit(edit),
            ts: 0,
        }
    }

    #[test]
    fn test_snapshot_keeps_projected_fields() {
        let mut snapshot = Snapshot {
            id: "fido".into(),
            v: 3,
            type_uri: Some(JSON0.into()),
            data: json!({ "name": "Fido", "owner": "Ann" }),
        };
        names().project_snapshot(&mut snapshot).unwrap();
        assert_eq!(snapshot.data, json!({ "name": "Fido" }));

        let mut missing = Snapshot::empty("rex");
        names().project_snapshot(&mut missing).unwrap();
        assert_eq!(missing.data, Value::Null);
    }

    #[test]
    fn test_only_json0_projects() {
        let mut snapshot = Snapshot {
            id: "notes".into(),
            v: 1,
            type_uri: Some("http://sharejs.org/types/textv1".into()),
            data: json!("hello"),
        };
        assert!(matches!(
            names().project_snapshot(&mut snapshot),
            Err(SyncError::Projection(_))
        ));
        assert!(matches!(
            names().project_op(&mut edit_op(json!([2, "x"]))),
            Err(SyncError::Projection(_))
        ));
    }

    #[test]
    fn test_op_drops_hidden_components() {
        let mut op = edit_op(json!([
            { "p": ["name"], "od": "Fido", "oi": "Rex" },
            { "p": ["owner"], "oi": "Bob" },
            { "p": [], "od": { "name": "Rex", "owner": "Bob" }, "oi": 5 },
        ]));
        names().project_op(&mut op).unwrap();
        assert_eq!(
            op.kind,
            OpKind::Edit(json!([
                { "p": ["name"], "od": "Fido", "oi": "Rex" },
                { "p": [], "od": { "name": "Rex" } },
            ]))
        );

        let mut create = Op {
            kind: OpKind::Create(CreateOp {
                type_uri: JSON0.into(),
                data: Some(json!({ "name": "Fido", "owner": "Ann" })),
            }),
            ..edit_op(Value::Null)
        };
        names().project_op(&mut create).unwrap();
        let OpKind::Create(create) = create.kind else {
            panic!("expected create");
        };
        assert_eq!(create.data, Some(json!({ "name": "Fido" })));
    }

    #[test]
    fn test_writes_must_stay_inside_fields() {
        let projection = names();
        let create = |data: Value| {
            OpKind::Create(CreateOp {
                type_uri: "json0".into(),
                data: Some(data),
            })
        };
        assert!(projection.check_op(None, &create(json!({ "name": "Fido" }))).is_ok());
        assert!(projection.check_op(None, &create(json!({ "owner": "Ann" }))).is_err());
        assert!(projection.check_op(None, &create(json!("Fido"))).is_err());

        let edit = |edit: Value| OpKind::Edit(edit);
        assert!(projection
            .check_op(Some(JSON0), &edit(json!([{ "p": ["name", 0], "si": "a" }])))
            .is_ok());
        assert!(matches!(
            projection.check_op(Some(JSON0), &edit(json!([{ "p": ["owner"], "oi": "Bob" }]))),
            Err(SyncError::Projection(_))
        ));
        assert!(projection
            .check_op(Some(JSON0), &edit(json!([{ "p": [], "oi": { "name": "Rex" } }])))
            .is_err());
        assert!(projection.check_op(Some(JSON0), &OpKind::Del).is_ok());
    }
}
