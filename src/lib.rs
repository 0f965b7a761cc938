#![forbid(unsafe_code)]

//! Runtime core for Lightning Network node plugins speaking JSON-RPC 2.0
//! over framed stdio, plus a synchronous side-channel socket back to the
//! node for outbound RPCs.
//!
//! A plugin author builds a [`PluginBuilder`], registers options, commands,
//! notification subscriptions and hooks against it, and calls
//! [`PluginBuilder::run`] (or [`PluginBuilder::run_to_exit`] for the usual
//! §7 exit-code contract). Everything after that — the `getmanifest`/`init`
//! handshake, inbound dispatch, outbound RPC correlation, and the timer
//! wheel — is handled by [`Host`] and the event loop, both internal to this
//! crate and reached only through handler callbacks.
//!
//! The whole thing runs on one task. There is no locking anywhere in this
//! crate because there is nothing running concurrently with the event loop
//! to lock against; see `event_loop` for how the one `tokio::select!`
//! multiplexes stdin, the RPC socket, their write queues, and timers without
//! ever spawning.

mod builder;
mod command;
mod dispatch;
mod error;
mod event_loop;
mod host;
mod manifest;
mod message;
mod reader;
mod request_table;
mod timer;

pub use builder::{echo_handler, PluginBuilder};
pub use command::{Command, CommandResult};
pub use error::{PluginError, Result};
pub use host::{Host, LogLevel, Network};
pub use manifest::{CommandSpec, HookSpec, OptionSpec, OptionType, Subscription};
pub use request_table::RpcErrorPayload;
pub use timer::{TimerHandle, TimerResult};
