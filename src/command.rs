//! Command lifecycle: the `Pending` / `Complete` discipline from §4.5.
//!
//! The C source enforces "free at most once" by comparing a command's state
//! pointer against two static sentinels at every suspension point. Rust gets
//! the same guarantee for free from ownership: [`Command`] carries no
//! sentinel, and every finalizer in [`crate::host::Host`] takes it *by
//! value*. A handler that wants to keep the command alive across a
//! suspension point must move it into [`crate::host::Host::send_outreq`]
//! instead of finalizing it; a handler that finalizes it can no longer touch
//! it afterwards because the compiler has already taken it. There is no
//! runtime bookkeeping table of live commands because there is nothing to
//! track: a `Command` that isn't inside an `OutRequest` is owned by whoever
//! is currently holding it, full stop.

use serde_json::Value;

/// One inbound request (or notification) being handled.
///
/// Absent `id` marks a notification: it carries no id and expects no reply,
/// so finalizing it is a no-op against the wire (see `Host::enqueue_reply`).
#[derive(Debug, Clone)]
pub struct Command {
    pub(crate) id: Option<Value>,
    pub(crate) method: String,
    pub(crate) usage_only: bool,
}

impl Command {
    pub(crate) fn new(id: Option<Value>, method: impl Into<String>) -> Self {
        Self {
            id,
            method: method.into(),
            usage_only: false,
        }
    }

    pub(crate) fn usage_probe(method: impl Into<String>) -> Self {
        Self {
            id: None,
            method: method.into(),
            usage_only: true,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none() && !self.usage_only
    }

    /// `true` while the handler is being driven as part of the startup usage
    /// probe (§4.5). Handlers are contractually required to call
    /// `Host::command_set_usage` and return `Complete` immediately when this
    /// is set, and must not perform any real work.
    pub fn is_usage_only(&self) -> bool {
        self.usage_only
    }
}

/// The return type every command/notification/hook handler must produce.
///
/// `Pending` means the command has been moved somewhere that will finalize
/// it later (an `OutRequest`, a timer callback); `Complete` means a
/// finalizer has already consumed it inside this call. There is
/// intentionally no third option and no way to return `Complete` without
/// having called a finalizer, short of constructing the enum directly
/// instead of going through `Host`'s finalizer methods — which is on the
/// handler author the same way calling `mem::forget` is always on the
/// author.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    Pending,
    Complete,
}
