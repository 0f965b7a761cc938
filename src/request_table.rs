//! Outbound request table (§3, §4.3): correlates replies arriving on the RPC
//! socket with the `send_outreq` call that produced them.
//!
//! Single-threaded, so this is a plain `HashMap` with no locking — the whole
//! point of threading `Host` through the event loop instead of reaching for
//! globals (Design Note "Global mutables").

use std::collections::HashMap;

use serde_json::Value;

use crate::command::{Command, CommandResult};
use crate::host::Host;

/// A JSON-RPC error payload, as carried in a reply's `error` member.
#[derive(Debug, Clone)]
pub struct RpcErrorPayload {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

pub(crate) type OnOk = Box<dyn FnOnce(&mut Host, Command, Value) -> CommandResult>;
pub(crate) type OnErr = Box<dyn FnOnce(&mut Host, Command, RpcErrorPayload) -> CommandResult>;

/// An outbound RPC awaiting a reply.
///
/// Owns the inbound [`Command`] that triggered it, per the Design Note on
/// arena ownership: the command moves in here when `send_outreq` is called,
/// and moves back out to whichever callback runs when the reply arrives.
pub(crate) struct OutRequest {
    pub(crate) cmd: Command,
    pub(crate) on_ok: OnOk,
    pub(crate) on_err: OnErr,
}

/// Maps outbound request ids to their pending [`OutRequest`].
#[derive(Default)]
pub(crate) struct RequestTable {
    next_id: u64,
    pending: HashMap<u64, OutRequest>,
}

impl RequestTable {
    pub(crate) fn new() -> Self {
        // id 0 is reserved for `rpc_delve`'s synchronous calls during init.
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Mints the next monotonically increasing id. Never reused within a
    /// process lifetime.
    pub(crate) fn mint_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn insert(&mut self, id: u64, request: OutRequest) {
        self.pending.insert(id, request);
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<OutRequest> {
        self.pending.remove(&id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
