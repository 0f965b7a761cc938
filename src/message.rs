//! JSON token view.
//!
//! The spec assumes an external byte-range JSON parser that yields token
//! trees without copying; that parser is explicitly out of scope here (§1).
//! `serde_json::Value` stands in for it — this module is the thin wrapper the
//! spec describes, offering member lookup and dotted-path access over it so
//! the rest of the crate never has to know which JSON library backs it.

use serde_json::Value;

use crate::error::PluginError;

/// A parsed top-level JSON-RPC object, with convenience accessors for the
/// fields every inbound/outbound message shares.
#[derive(Debug, Clone)]
pub struct MessageView(Value);

impl MessageView {
    pub fn parse(bytes: &[u8]) -> Result<Self, PluginError> {
        let value: Value = serde_json::from_slice(bytes)?;
        if !value.is_object() {
            return Err(PluginError::Protocol(
                "top-level JSON-RPC message must be an object".into(),
            ));
        }
        if value.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Err(PluginError::Protocol(
                "message missing `jsonrpc: \"2.0\"`".into(),
            ));
        }
        Ok(Self(value))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// The `method` member, if present and a string.
    pub fn method(&self) -> Option<&str> {
        self.0.get("method").and_then(Value::as_str)
    }

    /// The `id` member as a `u64`, if present. JSON-RPC ids may also be
    /// strings or null on the wire; this host only ever mints numeric ids
    /// and treats anything else as a protocol violation at the call site
    /// that needs it.
    pub fn id(&self) -> Option<&Value> {
        self.0.get("id")
    }

    pub fn params(&self) -> Value {
        self.0.get("params").cloned().unwrap_or(Value::Null)
    }

    pub fn result(&self) -> Option<&Value> {
        self.0.get("result")
    }

    pub fn error(&self) -> Option<&Value> {
        self.0.get("error")
    }

    /// Walks a `.`-separated path into the underlying value, returning the
    /// string found there. Used by `rpc_delve` (§4.3) to pull a single
    /// configuration value out of a node RPC reply.
    pub fn delve_str(&self, path: &str) -> Option<&str> {
        delve(&self.0, path).and_then(Value::as_str)
    }
}

/// Walks a `.`-separated path into `value`.
pub fn delve<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| {
        if segment.is_empty() {
            Some(current)
        } else {
            current.get(segment)
        }
    })
}
