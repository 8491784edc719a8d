//! JSON wire protocol spoken between client connections and agents.
//!
//! Every frame is one JSON object tagged by its action `a`:
//!
//! ```text
//! ┌──────┬───────────────────────────────┬──────────────────────────────┐
//! │ a    │ client → authority            │ authority → client           │
//! ├──────┼───────────────────────────────┼──────────────────────────────┤
//! │ hs   │ -                             │ session id, protocol version │
//! │ f/s  │ fetch / subscribe {c, d, v?}  │ reply {data?} or {error}     │
//! │ u    │ unsubscribe {c, d}            │ reply                        │
//! │ op   │ submit {c, d, v, src, seq, …} │ broadcast op, ack, {error}   │
//! │ p    │ presence {c, d, seq, v, p, r} │ broadcast presence, ack      │
//! │ qf/qs│ query fetch / subscribe       │ reply {results}              │
//! │ q    │ -                             │ live query results changed   │
//! │ qu   │ query unsubscribe             │ reply                        │
//! │ pp   │ ping                          │ ping                         │
//! └──────┴───────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Errors travel in the `error` field of the reply as `{code, message}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorPayload, SyncError};
use crate::op::{Op, OpKind, Snapshot};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "a")]
pub enum Message {
    #[serde(rename = "hs")]
    Handshake(Handshake),
    #[serde(rename = "f")]
    Fetch(DocRequest),
    #[serde(rename = "s")]
    Subscribe(DocRequest),
    #[serde(rename = "u")]
    Unsubscribe(DocRequest),
    #[serde(rename = "op")]
    Op(OpMessage),
    #[serde(rename = "p")]
    Presence(PresenceMessage),
    #[serde(rename = "qf")]
    QueryFetch(QueryMessage),
    #[serde(rename = "qs")]
    QuerySubscribe(QueryMessage),
    /// Pushed when a live query's result set changes.
    #[serde(rename = "q")]
    QueryUpdate(QueryMessage),
    #[serde(rename = "qu")]
    QueryUnsubscribe(QueryMessage),
    #[serde(rename = "pp")]
    Ping,
}

impl Message {
    pub fn encode(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, SyncError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Short action name for logging.
    pub fn action(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "hs",
            Message::Fetch(_) => "f",
            Message::Subscribe(_) => "s",
            Message::Unsubscribe(_) => "u",
            Message::Op(_) => "op",
            Message::Presence(_) => "p",
            Message::QueryFetch(_) => "qf",
            Message::QuerySubscribe(_) => "qs",
            Message::QueryUpdate(_) => "q",
            Message::QueryUnsubscribe(_) => "qu",
            Message::Ping => "pp",
        }
    }

    /// Document the message refers to, if any.
    pub fn doc_key(&self) -> Option<(&str, &str)> {
        match self {
            Message::Fetch(r) | Message::Subscribe(r) | Message::Unsubscribe(r) => Some((&r.c, &r.d)),
            Message::Op(m) => Some((&m.c, &m.d)),
            Message::Presence(m) => Some((&m.c, &m.d)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub protocol: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Fetch, subscribe and unsubscribe requests and their replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocRequest {
    pub c: String,
    pub d: String,
    /// Version the client already holds; the reply then carries ops
    /// instead of a snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Snapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl DocRequest {
    pub fn new(c: impl Into<String>, d: impl Into<String>, v: Option<u64>) -> Self {
        Self {
            c: c.into(),
            d: d.into(),
            v,
            data: None,
            error: None,
        }
    }

    pub fn reply(&self, data: Option<Snapshot>) -> Self {
        Self {
            c: self.c.clone(),
            d: self.d.clone(),
            v: None,
            data,
            error: None,
        }
    }

    pub fn reply_error(&self, err: &SyncError) -> Self {
        Self {
            error: Some(err.to_payload()),
            ..self.reply(None)
        }
    }
}

/// Op submission, broadcast, acknowledgement or rejection.
///
/// An acknowledgement carries `src`/`seq`/`v` and no op body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpMessage {
    pub c: String,
    pub d: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub kind: OpKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl OpMessage {
    pub fn from_op(c: &str, d: &str, op: &Op) -> Self {
        Self {
            c: c.to_string(),
            d: d.to_string(),
            v: Some(op.v),
            src: Some(op.src.clone()),
            seq: Some(op.seq),
            kind: op.kind.clone(),
            error: None,
        }
    }

    pub fn ack(c: &str, d: &str, src: &str, seq: u64, v: u64) -> Self {
        Self {
            c: c.to_string(),
            d: d.to_string(),
            v: Some(v),
            src: Some(src.to_string()),
            seq: Some(seq),
            kind: OpKind::Noop,
            error: None,
        }
    }

    pub fn rejection(c: &str, d: &str, src: &str, seq: u64, err: &SyncError) -> Self {
        Self {
            c: c.to_string(),
            d: d.to_string(),
            v: None,
            src: Some(src.to_string()),
            seq: Some(seq),
            kind: OpKind::Noop,
            error: Some(err.to_payload()),
        }
    }

    /// The broadcast op record, when the message has everything one needs.
    pub fn to_op(&self) -> Option<Op> {
        Some(Op {
            src: self.src.clone()?,
            seq: self.seq?,
            v: self.v?,
            kind: self.kind.clone(),
            ts: 0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMessage {
    pub c: String,
    pub d: String,
    /// Stamped by the authority; absent on the submitter's acknowledgement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    pub seq: u64,
    /// Document version the presence refers to; `null` when clearing.
    #[serde(default)]
    pub v: Option<u64>,
    /// Presence payload; `null` clears the entry.
    #[serde(default)]
    pub p: Value,
    /// Ask peers to re-send their own presence.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub r: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMessage {
    pub id: u64,
    pub c: String,
    #[serde(default)]
    pub q: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Snapshot>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl QueryMessage {
    pub fn reply(&self, results: Vec<Snapshot>) -> Self {
        Self {
            id: self.id,
            c: self.c.clone(),
            q: Value::Null,
            results: Some(results),
            error: None,
        }
    }

    pub fn reply_error(&self, err: &SyncError) -> Self {
        Self {
            id: self.id,
            c: self.c.clone(),
            q: Value::Null,
            results: None,
            error: Some(err.to_payload()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::CreateOp;
    use serde_json::json;

    #[test]
    fn test_op_message_wire_format() {
        let msg = Message::Op(OpMessage {
            c: "dogs".into(),
            d: "fido".into(),
            v: Some(1),
            src: Some("abc".into()),
            seq: Some(2),
            kind: OpKind::Edit(json!([{ "p": ["color"], "oi": "white" }])),
            error: None,
        });
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "a": "op", "c": "dogs", "d": "fido", "v": 1, "src": "abc", "seq": 2,
                "op": [{ "p": ["color"], "oi": "white" }]
            })
        );
        assert_eq!(Message::decode(&value.to_string()).unwrap(), msg);
    }

    #[test]
    fn test_create_message_decodes() {
        let text = r#"{"a":"op","c":"dogs","d":"fido","v":0,"src":"abc","seq":1,
            "create":{"type":"http://sharejs.org/types/JSONv0","data":{}}}"#;
        let Message::Op(msg) = Message::decode(text).unwrap() else {
            panic!("expected op message");
        };
        assert_eq!(
            msg.kind,
            OpKind::Create(CreateOp {
                type_uri: "http://sharejs.org/types/JSONv0".into(),
                data: Some(json!({})),
            })
        );
        let op = msg.to_op().unwrap();
        assert_eq!((op.v, op.seq), (0, 1));
    }

    #[test]
    fn test_ack_has_no_body() {
        let ack = OpMessage::ack("dogs", "fido", "abc", 3, 7);
        let value = serde_json::to_value(Message::Op(ack)).unwrap();
        assert!(value.get("op").is_none());
        assert!(value.get("create").is_none());
        assert!(value.get("del").is_none());
        assert_eq!(value["v"], 7);
    }

    #[test]
    fn test_presence_null_clears() {
        let text = r#"{"a":"p","c":"dogs","d":"fido","src":"abc","seq":4,"v":null,"p":null}"#;
        let Message::Presence(msg) = Message::decode(text).unwrap() else {
            panic!("expected presence message");
        };
        assert!(msg.p.is_null());
        assert_eq!(msg.v, None);
        assert!(!msg.r);
    }

    #[test]
    fn test_error_reply() {
        let request = DocRequest::new("dogs", "fido", None);
        let reply = request.reply_error(&SyncError::NotFound("dogs.fido".into()));
        let value = serde_json::to_value(Message::Fetch(reply)).unwrap();
        assert_eq!(value["error"]["code"], 4015);
        assert_eq!(value["a"], "f");
    }

    #[test]
    fn test_ping_and_garbage() {
        assert_eq!(Message::Ping.encode().unwrap(), r#"{"a":"pp"}"#);
        assert!(matches!(
            Message::decode(r#"{"a":"zz"}"#),
            Err(SyncError::InvalidMessage(_))
        ));
    }
}
