use std::io;

use thiserror::Error;

/// Errors that terminate the plugin process.
///
/// Every variant here is fatal: the node is the plugin's sole peer and is
/// assumed reliable for the lifetime of the process, so there is nothing to
/// retry and nowhere else to route the failure. Handler-reported failures
/// (a command replying with a JSON-RPC error) are not modeled here — they
/// never unwind through this type, they are ordinary [`crate::command::CommandResult`]
/// values.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("malformed JSON from node: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error on {channel}: {source}")]
    Io {
        channel: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("unknown network `{0}`")]
    UnknownNetwork(String),

    #[error("option `{name}` rejected value `{value}`: {reason}")]
    OptionRejected {
        name: String,
        value: String,
        reason: String,
    },

    #[error("reply for unknown request id {0}")]
    UnknownRequestId(u64),

    #[error("reply for id {0} is missing both `result` and `error`")]
    MalformedReply(u64),
}

impl PluginError {
    /// Every `PluginError` is fatal by construction; this exists so call
    /// sites read as a judgment call rather than an assumption.
    pub fn is_fatal(&self) -> bool {
        true
    }

    pub(crate) fn io(channel: &'static str, source: io::Error) -> Self {
        Self::Io { channel, source }
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;
