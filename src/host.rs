//! Per-process host state (§3 "Host state"), and the finalizers, RPC client,
//! and handshake mechanics that operate on it.
//!
//! Design Note "Global mutables": everything the original implementation
//! kept as process-wide globals (outbound table, usage map, timer wheel, RPC
//! connection, deprecated-APIs flag) is a field here instead. There is
//! exactly one `Host` per process, constructed by [`crate::PluginBuilder`]
//! and threaded through [`crate::event_loop::EventLoop`].

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use crate::command::{Command, CommandResult};
use crate::error::PluginError;
use crate::manifest::{build_manifest, CommandSpec, HookSpec, OptionSpec, Subscription};
use crate::message::MessageView;
use crate::reader::{Framed, FramedReader};
use crate::request_table::{OnErr, OnOk, OutRequest, RequestTable, RpcErrorPayload};
use crate::timer::{TimerHandle, TimerResult, TimerWheel};

/// The node's `network` string, resolved into a small built-in enum. The
/// out-of-scope chainparams collaborator (§1, §10.3) is responsible for
/// anything beyond "which of the four known networks is this".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Bitcoin,
    Testnet,
    Signet,
    Regtest,
}

impl FromStr for Network {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitcoin" | "main" => Ok(Network::Bitcoin),
            "testnet" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            other => Err(PluginError::UnknownNetwork(other.to_string())),
        }
    }
}

/// Severity of a `log` notification (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_wire_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// The handshake state machine from §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeState {
    AwaitingManifest,
    AwaitingInit,
    Ready,
}

/// In-flight outbound bytes for one writer, tracked outside any `select!`
/// branch's future. A `select!` future that is still `Pending` when a
/// sibling branch wins the race is dropped, and anything it only holds in
/// its own local state disappears with it; keeping `written` here instead
/// means a write that only got partway through one poll resumes from where
/// it left off next iteration, rather than being silently lost or
/// re-sent from the start (§4.7, §8 "Framing").
#[derive(Default)]
pub(crate) struct PendingWrite {
    bytes: Vec<u8>,
    written: usize,
}

impl PendingWrite {
    pub(crate) fn is_idle(&self) -> bool {
        self.bytes.is_empty()
    }

    pub(crate) fn load(&mut self, bytes: Vec<u8>) {
        self.bytes = bytes;
        self.written = 0;
    }

    pub(crate) fn remaining(&self) -> &[u8] {
        &self.bytes[self.written..]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.written += n;
    }

    pub(crate) fn is_fully_written(&self) -> bool {
        self.written >= self.bytes.len()
    }

    pub(crate) fn clear(&mut self) {
        self.bytes.clear();
        self.written = 0;
    }
}

/// The RPC socket opened during `init` (§4.3, §6): a framed reader over the
/// read half and a plain write half, plus an outbound queue mirroring the
/// stdout queue so writes stay one JSON object at a time.
pub(crate) struct RpcConnection {
    pub(crate) reader: FramedReader<OwnedReadHalf>,
    pub(crate) writer: OwnedWriteHalf,
    pub(crate) out_queue: VecDeque<Vec<u8>>,
    pub(crate) pending_write: PendingWrite,
}

pub(crate) type InitHook = Box<dyn FnOnce(&mut Host, &Value)>;

/// Per-process plugin state, and the single type every handler receives a
/// `&mut` to.
pub struct Host {
    pub(crate) state: HandshakeState,
    pub(crate) stdout_queue: VecDeque<Vec<u8>>,
    pub(crate) options: Vec<OptionSpec>,
    pub(crate) commands: Vec<CommandSpec>,
    pub(crate) subscriptions: Vec<Subscription>,
    pub(crate) hooks: Vec<HookSpec>,
    pub(crate) dynamic: bool,
    pub(crate) init_hook: Option<InitHook>,
    pub(crate) requests: RequestTable,
    pub(crate) usage_map: HashMap<String, String>,
    pub(crate) timers: TimerWheel,
    pub(crate) rpc: Option<RpcConnection>,
    pub(crate) lightning_dir: Option<PathBuf>,
    pub(crate) network: Option<Network>,
    pub(crate) allow_deprecated_apis: bool,
}

impl Host {
    pub(crate) fn new(
        options: Vec<OptionSpec>,
        mut commands: Vec<CommandSpec>,
        subscriptions: Vec<Subscription>,
        hooks: Vec<HookSpec>,
        dynamic: bool,
        init_hook: Option<InitHook>,
    ) -> Self {
        let mut host = Self {
            state: HandshakeState::AwaitingManifest,
            stdout_queue: VecDeque::new(),
            options,
            commands: Vec::new(),
            subscriptions,
            hooks,
            dynamic,
            init_hook,
            requests: RequestTable::new(),
            usage_map: HashMap::new(),
            timers: TimerWheel::new(),
            rpc: None,
            lightning_dir: None,
            network: None,
            allow_deprecated_apis: false,
        };
        host.run_usage_probe(&mut commands);
        host.commands = commands;
        host
    }

    /// Runs every registered command handler once in usage-probe mode
    /// (§4.5), populating `usage_map` before `getmanifest` can be answered.
    fn run_usage_probe(&mut self, commands: &mut [CommandSpec]) {
        for spec in commands.iter_mut() {
            let probe = Command::usage_probe(spec.name.clone());
            let result = (spec.handler)(self, probe, Value::Null);
            if result != CommandResult::Complete {
                panic!(
                    "command `{}` did not return Complete from its usage probe",
                    spec.name
                );
            }
            if !self.usage_map.contains_key(&spec.name) {
                panic!(
                    "command `{}` did not call Host::command_set_usage during its usage probe",
                    spec.name
                );
            }
        }
    }

    // -- finalizers (§4.5) ---------------------------------------------

    fn enqueue_stdout(&mut self, value: Value) {
        let mut bytes = serde_json::to_vec(&value).expect("JSON-RPC values are always encodable");
        bytes.extend_from_slice(b"\n\n");
        self.stdout_queue.push_back(bytes);
    }

    /// Replies with a successful result. A no-op against the wire for
    /// notifications, which have no id and expect no reply.
    pub fn command_success(&mut self, cmd: Command, result: Value) -> CommandResult {
        if let Some(id) = cmd.id {
            self.enqueue_stdout(serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            }));
        }
        CommandResult::Complete
    }

    /// As `command_success`, with a bare string result (or `{}` if absent).
    pub fn command_success_str(&mut self, cmd: Command, s: Option<String>) -> CommandResult {
        let result = match s {
            Some(s) => Value::String(s),
            None => Value::Object(Default::default()),
        };
        self.command_success(cmd, result)
    }

    /// Replies with a JSON-RPC error. The plugin keeps running; only
    /// protocol/transport failures are fatal (§7).
    pub fn command_done_err(
        &mut self,
        cmd: Command,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> CommandResult {
        if let Some(id) = cmd.id {
            let mut error = serde_json::json!({ "code": code, "message": message.into() });
            if let Some(data) = data {
                error["data"] = data;
            }
            self.enqueue_stdout(serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": error,
            }));
        }
        CommandResult::Complete
    }

    /// Splices a subordinate RPC's `result` verbatim into the reply, for
    /// building transparent proxies.
    pub fn forward_result(&mut self, cmd: Command, subordinate_result: &Value) -> CommandResult {
        self.command_success(cmd, subordinate_result.clone())
    }

    /// As `forward_result`, for a subordinate RPC's `error` member.
    pub fn forward_error(&mut self, cmd: Command, subordinate_error: &RpcErrorPayload) -> CommandResult {
        self.command_done_err(
            cmd,
            subordinate_error.code,
            subordinate_error.message.clone(),
            subordinate_error.data.clone(),
        )
    }

    /// Records a command's usage string during the startup usage probe
    /// (§4.5). Contractually required of every command handler when
    /// `cmd.is_usage_only()` is `true`.
    pub fn command_set_usage(&mut self, cmd: Command, usage: impl Into<String>) -> CommandResult {
        self.usage_map.insert(cmd.method, usage.into());
        CommandResult::Complete
    }

    // -- outbound RPC (§4.3) --------------------------------------------

    /// Mints an id, enqueues `{method, params}` on the RPC socket, and
    /// records the callbacks keyed by that id. Always returns `Pending`:
    /// the inbound command that triggered this call is kept alive by virtue
    /// of having been moved into the outbound table.
    pub fn send_outreq(
        &mut self,
        cmd: Command,
        method: &str,
        params: Value,
        on_ok: impl FnOnce(&mut Host, Command, Value) -> CommandResult + 'static,
        on_err: impl FnOnce(&mut Host, Command, RpcErrorPayload) -> CommandResult + 'static,
    ) -> CommandResult {
        let id = self.requests.mint_id();
        self.enqueue_rpc_request(id, method, params);
        self.requests.insert(
            id,
            OutRequest {
                cmd,
                on_ok: Box::new(on_ok) as OnOk,
                on_err: Box::new(on_err) as OnErr,
            },
        );
        CommandResult::Pending
    }

    fn enqueue_rpc_request(&mut self, id: u64, method: &str, params: Value) {
        let message = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut bytes = serde_json::to_vec(&message).expect("JSON-RPC values are always encodable");
        bytes.extend_from_slice(b"\n\n");
        self.rpc_mut("send_outreq").out_queue.push_back(bytes);
    }

    fn rpc_mut(&mut self, what: &str) -> &mut RpcConnection {
        self.rpc
            .as_mut()
            .unwrap_or_else(|| panic!("{what} called before the RPC socket was connected"))
    }

    /// Parses one RPC-socket reply and dispatches it to the matching
    /// `on_ok`/`on_err` callback (§4.3). Fatal if the id is unknown or the
    /// reply carries neither `result` nor `error`.
    pub(crate) fn handle_rpc_reply(&mut self, bytes: &[u8]) -> Result<(), PluginError> {
        let view = MessageView::parse(bytes)?;
        let id = view
            .id()
            .and_then(Value::as_u64)
            .ok_or_else(|| PluginError::Protocol("RPC reply missing a numeric id".into()))?;

        let request = self
            .requests
            .remove(id)
            .ok_or(PluginError::UnknownRequestId(id))?;

        if let Some(error) = view.error() {
            let payload = RpcErrorPayload {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                data: error.get("data").cloned(),
            };
            (request.on_err)(self, request.cmd, payload);
        } else if let Some(result) = view.result() {
            let result = result.clone();
            (request.on_ok)(self, request.cmd, result);
        } else {
            return Err(PluginError::MalformedReply(id));
        }

        Ok(())
    }

    // -- synchronous RPC used only during init (§4.3) --------------------

    /// Sends `{method, params}` with id `0`, blocks on the RPC socket for the
    /// single reply, asserts it is not an error, and returns the string at
    /// `path` within the result. Used exclusively while handling `init`.
    pub(crate) async fn rpc_delve(
        &mut self,
        method: &str,
        params: Value,
        path: &str,
    ) -> Result<String, PluginError> {
        let message = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": method,
            "params": params,
        });
        let mut bytes = serde_json::to_vec(&message)?;
        bytes.extend_from_slice(b"\n\n");

        let conn = self
            .rpc
            .as_mut()
            .expect("rpc_delve called before the RPC socket was connected");
        conn.writer
            .write_all(&bytes)
            .await
            .map_err(|source| PluginError::io("rpc-socket", source))?;
        conn.writer
            .flush()
            .await
            .map_err(|source| PluginError::io("rpc-socket", source))?;

        let framed = conn.reader.next_message().await?;
        let msg = match framed {
            Framed::Message(bytes) => bytes,
            Framed::Eof => {
                return Err(PluginError::Protocol(
                    "node RPC socket closed while awaiting rpc_delve reply".into(),
                ))
            }
        };

        let view = MessageView::parse(&msg)?;
        if let Some(error) = view.error() {
            return Err(PluginError::Protocol(format!(
                "{method} failed: {error}"
            )));
        }

        view.delve_str(&format!("result.{path}"))
            .map(str::to_string)
            .ok_or_else(|| {
                PluginError::Protocol(format!("{method} reply had no `result.{path}`"))
            })
    }

    pub(crate) async fn connect_rpc(&mut self, lightning_dir: &Path, rpc_file: &str) -> Result<(), PluginError> {
        let path = lightning_dir.join(rpc_file);
        let stream = UnixStream::connect(&path)
            .await
            .map_err(|source| PluginError::io("rpc-socket", source))?;
        let (read_half, write_half) = stream.into_split();
        self.rpc = Some(RpcConnection {
            reader: FramedReader::new(read_half, "rpc-socket"),
            writer: write_half,
            out_queue: VecDeque::new(),
            pending_write: PendingWrite::default(),
        });
        Ok(())
    }

    // -- logging (§6, §10.1) ---------------------------------------------

    /// Emits a local `tracing` event and enqueues a `log` notification to the
    /// node. The two are independent: this is for messages the node's log
    /// viewer should show, not for debugging the host library itself.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!(%message, "plugin log"),
            LogLevel::Info => tracing::info!(%message, "plugin log"),
            LogLevel::Warn => tracing::warn!(%message, "plugin log"),
            LogLevel::Error => tracing::error!(%message, "plugin log"),
        }
        self.enqueue_stdout(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "log",
            "params": { "level": level.as_wire_str(), "message": message },
        }));
    }

    // -- timers (§4.6) -----------------------------------------------------

    pub fn plugin_timer(
        &mut self,
        delay: Duration,
        callback: impl FnOnce(&mut Host) -> TimerResult + 'static,
    ) -> TimerHandle {
        self.timers.schedule(delay, callback)
    }

    pub fn timer_complete(&mut self) {
        self.timers.timer_complete();
    }

    // -- handshake (§4.4) ---------------------------------------------------

    pub(crate) fn manifest_value(&self) -> Value {
        build_manifest(
            &self.options,
            &self.commands,
            &self.subscriptions,
            &self.hooks,
            &self.usage_map,
            self.dynamic,
        )
    }
}
