//! JSON-RPC 2.0 envelopes and the text codec.
//!
//! One envelope per transport message. `params`, `result` and `meta` are kept
//! as raw JSON ([`Payload`]) until a consumer asks for a concrete type.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;

use crate::errors::ProtocolError;
use crate::errors::rpc::ErrorObject;
use crate::ids::RequestId;

/// Protocol version string emitted on every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

// ── Payload ─────────────────────────────────────────────────────────

/// Raw JSON text, decoded on demand.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Box<RawValue>);

impl Payload {
    /// Encode any serializable value.
    pub fn from_value<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::value::to_raw_value(value).map(Self)
    }

    /// Wrap already-encoded JSON text, validating it.
    pub fn from_raw(json: String) -> Result<Self, serde_json::Error> {
        RawValue::from_string(json).map(Self)
    }

    /// The JSON `null` literal.
    pub fn null() -> Self {
        Self(RawValue::NULL.to_owned())
    }

    /// Decode into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.0.get())
    }

    /// The raw JSON text.
    pub fn get(&self) -> &str {
        self.0.get()
    }

    /// Whether the payload is the `null` literal.
    pub fn is_null(&self) -> bool {
        self.get().trim() == "null"
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({})", self.get())
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.get())
    }
}

// ── Envelopes ───────────────────────────────────────────────────────

/// A call expecting a response.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    /// Correlation id.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Method parameters.
    pub params: Option<Payload>,
    /// Caller metadata.
    pub meta: Option<Payload>,
}

impl Request {
    /// Create a request without metadata.
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Payload>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
            meta: None,
        }
    }

    /// Decode `params` into `T`; absent params decode from `null`.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        decode_optional(self.params.as_ref())
    }
}

/// A one-way message.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    /// Method name.
    pub method: String,
    /// Method parameters.
    pub params: Option<Payload>,
    /// Caller metadata.
    pub meta: Option<Payload>,
}

impl Notification {
    /// Create a notification without metadata.
    pub fn new(method: impl Into<String>, params: Option<Payload>) -> Self {
        Self {
            method: method.into(),
            params,
            meta: None,
        }
    }

    /// Decode `params` into `T`; absent params decode from `null`.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        decode_optional(self.params.as_ref())
    }
}

/// The answer to a [`Request`].
///
/// `id` is `None` only for error responses the peer could not correlate
/// (it failed to parse what we sent).
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    /// Id of the request being answered.
    pub id: Option<RequestId>,
    /// `result` or `error`.
    pub result: Result<Payload, ErrorObject>,
}

impl Response {
    /// Successful response.
    pub fn success(id: RequestId, result: Payload) -> Self {
        Self {
            id: Some(id),
            result: Ok(result),
        }
    }

    /// Error response.
    pub fn error(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }
}

/// Any JSON-RPC message.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    /// Call expecting a response.
    Request(Request),
    /// One-way message.
    Notification(Notification),
    /// Answer to a call.
    Response(Response),
}

impl Envelope {
    /// The method name, for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    /// The correlation id, for requests and responses.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => r.id.as_ref(),
            Self::Notification(_) => None,
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Notification(_) => "notification",
            Self::Response(r) if r.result.is_err() => "error",
            Self::Response(_) => "response",
        }
    }
}

impl From<Request> for Envelope {
    fn from(r: Request) -> Self {
        Self::Request(r)
    }
}

impl From<Notification> for Envelope {
    fn from(n: Notification) -> Self {
        Self::Notification(n)
    }
}

impl From<Response> for Envelope {
    fn from(r: Response) -> Self {
        Self::Response(r)
    }
}

fn decode_optional<T: DeserializeOwned>(payload: Option<&Payload>) -> Result<T, serde_json::Error> {
    match payload {
        Some(p) => p.decode(),
        None => serde_json::from_str("null"),
    }
}

// ── Encoding ────────────────────────────────────────────────────────

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        match self {
            Self::Request(r) => {
                map.serialize_entry("id", &r.id)?;
                map.serialize_entry("method", &r.method)?;
                if let Some(params) = &r.params {
                    map.serialize_entry("params", params)?;
                }
                if let Some(meta) = &r.meta {
                    map.serialize_entry("meta", meta)?;
                }
            }
            Self::Notification(n) => {
                map.serialize_entry("method", &n.method)?;
                if let Some(params) = &n.params {
                    map.serialize_entry("params", params)?;
                }
                if let Some(meta) = &n.meta {
                    map.serialize_entry("meta", meta)?;
                }
            }
            Self::Response(r) => {
                map.serialize_entry("id", &r.id)?;
                match &r.result {
                    Ok(result) => map.serialize_entry("result", result)?,
                    Err(error) => map.serialize_entry("error", error)?,
                }
            }
        }
        map.end()
    }
}

/// Encode an envelope as one JSON text.
pub fn encode(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

// ── Decoding ────────────────────────────────────────────────────────

/// Every member any envelope may carry. `id` and `result` keep `null`
/// distinct from absent.
#[derive(Deserialize)]
struct WireIn {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default, deserialize_with = "present")]
    id: Option<Option<RequestId>>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Payload>,
    #[serde(default)]
    meta: Option<Payload>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Payload>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Decode one JSON text into an envelope.
pub fn decode(raw: &str) -> Result<Envelope, ProtocolError> {
    if !raw.trim_start().starts_with('{') {
        return Err(ProtocolError::malformed("expected a JSON object", raw));
    }
    let wire: WireIn =
        serde_json::from_str(raw).map_err(|e| ProtocolError::malformed(e.to_string(), raw))?;

    if let Some(version) = wire.jsonrpc.as_deref() {
        if version != JSONRPC_VERSION {
            return Err(ProtocolError::malformed(
                format!("unsupported jsonrpc version {version:?}"),
                raw,
            ));
        }
    }

    if let Some(method) = wire.method {
        if wire.result.is_some() || wire.error.is_some() {
            return Err(ProtocolError::malformed(
                "request carries result or error",
                raw,
            ));
        }
        return match wire.id {
            None => Ok(Envelope::Notification(Notification {
                method,
                params: wire.params,
                meta: wire.meta,
            })),
            Some(Some(id)) => Ok(Envelope::Request(Request {
                id,
                method,
                params: wire.params,
                meta: wire.meta,
            })),
            Some(None) => Err(ProtocolError::malformed("request id is null", raw)),
        };
    }

    match (wire.result, wire.error, wire.id) {
        (Some(_), Some(_), _) => Err(ProtocolError::malformed(
            "response has both result and error",
            raw,
        )),
        (Some(result), None, Some(Some(id))) => Ok(Envelope::Response(Response::success(id, result))),
        (Some(_), None, _) => Err(ProtocolError::malformed("result without id", raw)),
        (None, Some(error), Some(id)) => Ok(Envelope::Response(Response::error(id, error))),
        (None, Some(_), None) => Err(ProtocolError::malformed("error without id", raw)),
        (None, None, _) => Err(ProtocolError::malformed(
            "no method and no result or error",
            raw,
        )),
    }
}

/// Decode one UTF-8 encoded JSON text.
pub fn decode_slice(raw: &[u8]) -> Result<Envelope, ProtocolError> {
    match std::str::from_utf8(raw) {
        Ok(text) => decode(text),
        Err(e) => Err(ProtocolError::malformed(
            format!("invalid UTF-8: {e}"),
            &String::from_utf8_lossy(raw),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::rpc::{INVALID_PARAMS, PARSE_ERROR};
    use assert_matches::assert_matches;
    use insta::assert_snapshot;
    use proptest::prelude::*;
    use serde_json::json;

    fn payload(v: serde_json::Value) -> Payload {
        Payload::from_value(&v).unwrap()
    }

    // ── encode ──

    #[test]
    fn encode_request() {
        let env = Envelope::Request(Request::new(
            0.into(),
            "f",
            Some(payload(json!([1, 2, 3]))),
        ));
        assert_snapshot!(encode(&env).unwrap(), @r#"{"jsonrpc":"2.0","id":0,"method":"f","params":[1,2,3]}"#);
    }

    #[test]
    fn encode_notification_with_meta() {
        let mut n = Notification::new("m", Some(payload(json!("notif for #0"))));
        n.meta = Some(payload(json!({"trace": "t1"})));
        assert_snapshot!(encode(&n.into()).unwrap(), @r#"{"jsonrpc":"2.0","method":"m","params":"notif for #0","meta":{"trace":"t1"}}"#);
    }

    #[test]
    fn encode_notification_without_params() {
        let env = Envelope::Notification(Notification::new("ping", None));
        assert_snapshot!(encode(&env).unwrap(), @r#"{"jsonrpc":"2.0","method":"ping"}"#);
    }

    #[test]
    fn encode_success_response() {
        let env = Envelope::Response(Response::success("a".into(), payload(json!("hello, #0: [1,2,3]"))));
        assert_snapshot!(encode(&env).unwrap(), @r#"{"jsonrpc":"2.0","id":"a","result":"hello, #0: [1,2,3]"}"#);
    }

    #[test]
    fn encode_error_response_with_null_id() {
        let env = Envelope::Response(Response::error(None, ErrorObject::parse_error("bad json")));
        assert_snapshot!(encode(&env).unwrap(), @r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"bad json"}}"#);
    }

    #[test]
    fn encode_keeps_payload_text_verbatim() {
        let raw = Payload::from_raw(r#"{"b":1,"a":2}"#.to_owned()).unwrap();
        let env = Envelope::Request(Request::new(3.into(), "x", Some(raw)));
        assert_snapshot!(encode(&env).unwrap(), @r#"{"jsonrpc":"2.0","id":3,"method":"x","params":{"b":1,"a":2}}"#);
    }

    // ── decode ──

    #[test]
    fn decode_request() {
        let env = decode(r#"{"jsonrpc":"2.0","id":5,"method":"f","params":[1,2,3]}"#).unwrap();
        assert_matches!(env, Envelope::Request(r) => {
            assert_eq!(r.id, RequestId::Num(5));
            assert_eq!(r.method, "f");
            assert_eq!(r.params.unwrap().get(), "[1,2,3]");
            assert!(r.meta.is_none());
        });
    }

    #[test]
    fn decode_request_with_string_id_and_meta() {
        let env = decode(r#"{"jsonrpc":"2.0","id":"x-1","method":"f","meta":{"k":1}}"#).unwrap();
        assert_matches!(env, Envelope::Request(r) => {
            assert_eq!(r.id, RequestId::from("x-1"));
            assert_eq!(r.meta.unwrap().get(), r#"{"k":1}"#);
        });
    }

    #[test]
    fn decode_notification() {
        let env = decode(r#"{"jsonrpc":"2.0","method":"m","params":"notif for #3"}"#).unwrap();
        assert_matches!(env, Envelope::Notification(n) => {
            assert_eq!(n.method, "m");
            assert_eq!(n.params::<String>().unwrap(), "notif for #3");
        });
    }

    #[test]
    fn decode_missing_version_is_tolerated() {
        let env = decode(r#"{"method":"m"}"#).unwrap();
        assert_eq!(env.method(), Some("m"));
    }

    #[test]
    fn decode_wrong_version() {
        let err = decode(r#"{"jsonrpc":"1.0","method":"m"}"#).unwrap_err();
        assert_matches!(err, ProtocolError::Malformed { reason, .. } if reason.contains("1.0"));
    }

    #[test]
    fn decode_null_result_is_success() {
        let env = decode(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert_matches!(env, Envelope::Response(Response { id: Some(RequestId::Num(1)), result: Ok(p) }) => {
            assert!(p.is_null());
        });
    }

    #[test]
    fn decode_error_response() {
        let env = decode(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32602,"message":"bad","data":{"f":1}}}"#,
        )
        .unwrap();
        assert_matches!(env, Envelope::Response(Response { result: Err(e), .. }) => {
            assert_eq!(e.code, INVALID_PARAMS);
            assert_eq!(e.data.unwrap().get(), r#"{"f":1}"#);
        });
    }

    #[test]
    fn decode_error_with_null_id() {
        let env = decode(r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"x"}}"#).unwrap();
        assert_matches!(env, Envelope::Response(Response { id: None, result: Err(e) }) if e.code == PARSE_ERROR);
    }

    #[test]
    fn decode_rejects_response_with_both_members() {
        let err = decode(r#"{"id":1,"result":1,"error":{"code":1,"message":"m"}}"#).unwrap_err();
        assert_matches!(err, ProtocolError::Malformed { .. });
    }

    #[test]
    fn decode_rejects_result_without_id() {
        assert_matches!(decode(r#"{"result":1}"#), Err(ProtocolError::Malformed { .. }));
        assert_matches!(decode(r#"{"id":null,"result":1}"#), Err(ProtocolError::Malformed { .. }));
    }

    #[test]
    fn decode_rejects_request_with_result() {
        let err = decode(r#"{"id":1,"method":"m","result":1}"#).unwrap_err();
        assert_matches!(err, ProtocolError::Malformed { reason, .. } if reason.contains("result"));
    }

    #[test]
    fn decode_rejects_request_with_null_id() {
        assert_matches!(decode(r#"{"id":null,"method":"m"}"#), Err(ProtocolError::Malformed { .. }));
    }

    #[test]
    fn decode_rejects_bad_ids_and_methods() {
        for raw in [
            r#"{"id":1.5,"method":"m"}"#,
            r#"{"id":-1,"method":"m"}"#,
            r#"{"id":{},"method":"m"}"#,
            r#"{"id":1,"method":7}"#,
        ] {
            assert_matches!(decode(raw), Err(ProtocolError::Malformed { .. }), "{raw}");
        }
    }

    #[test]
    fn decode_rejects_non_objects() {
        for raw in ["[]", "[1,2]", "42", "\"s\"", "null", ""] {
            assert_matches!(decode(raw), Err(ProtocolError::Malformed { .. }), "{raw:?}");
        }
    }

    #[test]
    fn decode_rejects_invalid_json() {
        let err = decode("{not json").unwrap_err();
        assert_matches!(err, ProtocolError::Malformed { raw, .. } if raw == "{not json");
    }

    #[test]
    fn decode_rejects_empty_object() {
        assert_matches!(decode("{}"), Err(ProtocolError::Malformed { .. }));
    }

    #[test]
    fn decode_ignores_unknown_members() {
        let env = decode(r#"{"jsonrpc":"2.0","method":"m","extra":true}"#).unwrap();
        assert_eq!(env.kind(), "notification");
    }

    #[test]
    fn decode_slice_rejects_invalid_utf8() {
        let err = decode_slice(&[b'{', 0xff, b'}']).unwrap_err();
        assert_matches!(err, ProtocolError::Malformed { reason, .. } if reason.contains("UTF-8"));
    }

    #[test]
    fn decode_slice_accepts_utf8() {
        let env = decode_slice(br#"{"method":"m"}"#).unwrap();
        assert_eq!(env.kind(), "notification");
    }

    // ── payload ──

    #[test]
    fn payload_decode_typed() {
        let p = payload(json!({"a": [1, 2]}));
        let v: std::collections::HashMap<String, Vec<u8>> = p.decode().unwrap();
        assert_eq!(v["a"], vec![1, 2]);
        assert!(p.decode::<String>().is_err());
    }

    #[test]
    fn payload_null() {
        assert!(Payload::null().is_null());
        assert_eq!(Payload::null().to_string(), "null");
        assert!(!payload(json!(0)).is_null());
    }

    #[test]
    fn payload_from_raw_validates() {
        assert!(Payload::from_raw("{".to_owned()).is_err());
    }

    #[test]
    fn absent_params_decode_as_null() {
        let n = Notification::new("m", None);
        assert_eq!(n.params::<Option<u32>>().unwrap(), None);
    }

    #[test]
    fn envelope_accessors() {
        let req: Envelope = Request::new(9.into(), "f", None).into();
        assert_eq!(req.id(), Some(&RequestId::Num(9)));
        assert_eq!(req.kind(), "request");
        let err: Envelope = Response::error(Some(9.into()), ErrorObject::internal("x")).into();
        assert_eq!(err.method(), None);
        assert_eq!(err.kind(), "error");
    }

    proptest! {
        #[test]
        fn requests_survive_the_wire(id in any::<u64>(), method in "[a-zA-Z./_]{1,24}", n in any::<i64>()) {
            let env = Envelope::Request(Request::new(id.into(), method, Some(payload(json!([n])))));
            let decoded = decode(&encode(&env).unwrap()).unwrap();
            prop_assert_eq!(decoded, env);
        }

        #[test]
        fn decode_never_panics(raw in ".{0,64}") {
            let _ = decode(&raw);
        }
    }
}
