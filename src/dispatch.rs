//! Inbound dispatcher and handshake state machine (§4.4).
//!
//! Handlers are stored as `Box<dyn FnMut>` fields on `Host` itself, so
//! routing to one needs `&mut Host` twice at once: once to find the spec,
//! once to hand to the spec's own handler. The fix used throughout this
//! module is the same one the teacher crate's MCP runtime reaches for when
//! it needs to mutate a registry entry and call out at the same time:
//! remove the entry from its `Vec` first, call the now free-standing
//! handler, then put it back. No handler can see itself mid-call, which is
//! fine — nothing here recurses into its own dispatch.

use serde_json::Value;

use crate::command::{Command, CommandResult};
use crate::host::{HandshakeState, Host, Network};
use crate::message::MessageView;
use crate::error::PluginError;

/// Parses and routes exactly one top-level JSON-RPC object.
pub(crate) async fn dispatch_inbound(host: &mut Host, bytes: &[u8]) -> Result<(), PluginError> {
    let view = MessageView::parse(bytes)?;
    let method = view
        .method()
        .ok_or_else(|| PluginError::Protocol("inbound message missing `method`".into()))?
        .to_string();
    let id = view.id().cloned();
    if view.as_value().get("params").is_none() {
        return Err(PluginError::Protocol(format!(
            "`{method}` missing `params`"
        )));
    }

    match host.state {
        HandshakeState::AwaitingManifest => {
            if method != "getmanifest" {
                return Err(PluginError::Protocol(format!(
                    "expected `getmanifest`, got `{method}` before handshake"
                )));
            }
            handle_getmanifest(host, id)
        }
        HandshakeState::AwaitingInit => {
            if method != "init" {
                return Err(PluginError::Protocol(format!(
                    "expected `init`, got `{method}` before handshake completed"
                )));
            }
            handle_init(host, id, view.params()).await
        }
        HandshakeState::Ready => route_ready(host, &method, id, view.params()).await,
    }
}

fn handle_getmanifest(host: &mut Host, id: Option<Value>) -> Result<(), PluginError> {
    let id = id.ok_or_else(|| PluginError::Protocol("`getmanifest` must carry an id".into()))?;
    let manifest = host.manifest_value();
    let cmd = Command::new(Some(id), "getmanifest");
    host.command_success(cmd, manifest);
    host.state = HandshakeState::AwaitingInit;
    Ok(())
}

async fn handle_init(host: &mut Host, id: Option<Value>, params: Value) -> Result<(), PluginError> {
    let id = id.ok_or_else(|| PluginError::Protocol("`init` must carry an id".into()))?;

    let configuration = params
        .get("configuration")
        .ok_or_else(|| PluginError::Protocol("`init` missing `configuration`".into()))?;
    let lightning_dir = require_str(configuration, "lightning-dir")?;
    let network = require_str(configuration, "network")?;
    let rpc_file = require_str(configuration, "rpc-file")?;

    std::env::set_current_dir(lightning_dir)
        .map_err(|source| PluginError::io("lightning-dir", source))?;

    let network: Network = network.parse()?;
    host.lightning_dir = Some(std::path::PathBuf::from(lightning_dir));
    host.network = Some(network);

    host.connect_rpc(std::path::Path::new(lightning_dir), rpc_file)
        .await?;

    let allow_deprecated = host
        .rpc_delve("listconfigs", serde_json::json!({}), "allow-deprecated-apis")
        .await?;
    host.allow_deprecated_apis = allow_deprecated == "true";

    apply_options(host, params.get("options").cloned().unwrap_or(Value::Null))?;

    if let Some(hook) = host.init_hook.take() {
        hook(host, &params);
    }

    let cmd = Command::new(Some(id), "init");
    host.command_success(cmd, Value::Object(Default::default()));
    host.state = HandshakeState::Ready;
    Ok(())
}

fn apply_options(host: &mut Host, supplied: Value) -> Result<(), PluginError> {
    let supplied = supplied.as_object().cloned().unwrap_or_default();
    let mut options = std::mem::take(&mut host.options);
    let mut outcome = Ok(());
    for spec in options.iter_mut() {
        let value = supplied
            .get(&spec.name)
            .cloned()
            .or_else(|| spec.default.clone())
            .unwrap_or(Value::Null);
        if let Err(reason) = (spec.on_set)(&value) {
            outcome = Err(PluginError::OptionRejected {
                name: spec.name.clone(),
                value: value.to_string(),
                reason,
            });
            break;
        }
    }
    host.options = options;
    outcome
}

async fn route_ready(
    host: &mut Host,
    method: &str,
    id: Option<Value>,
    params: Value,
) -> Result<(), PluginError> {
    if id.is_none() {
        return dispatch_notification(host, method, params);
    }

    if let Some(idx) = host.hooks.iter().position(|h| h.method == method) {
        let mut spec = host.hooks.remove(idx);
        let cmd = Command::new(id, method);
        (spec.handler)(host, cmd, params);
        host.hooks.insert(idx, spec);
        return Ok(());
    }

    if let Some(idx) = host.commands.iter().position(|c| c.name == method) {
        let mut spec = host.commands.remove(idx);
        let cmd = Command::new(id, method);
        (spec.handler)(host, cmd, params);
        host.commands.insert(idx, spec);
        return Ok(());
    }

    Err(PluginError::Protocol(format!(
        "no command or hook registered for `{method}`"
    )))
}

fn dispatch_notification(host: &mut Host, method: &str, params: Value) -> Result<(), PluginError> {
    let idx = host
        .subscriptions
        .iter()
        .position(|s| s.method == method)
        .ok_or_else(|| {
            PluginError::Protocol(format!("no subscription registered for `{method}`"))
        })?;

    let mut spec = host.subscriptions.remove(idx);
    let cmd = Command::new(None, method);
    let result = (spec.handler)(host, cmd, params);
    host.subscriptions.insert(idx, spec);
    debug_assert!(
        matches!(result, CommandResult::Pending | CommandResult::Complete),
        "notification handlers still return the usual CommandResult"
    );
    Ok(())
}

fn require_str<'a>(value: &'a Value, key: &str) -> Result<&'a str, PluginError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| PluginError::Protocol(format!("missing or non-string `{key}`")))
}
