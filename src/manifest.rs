//! Registration types for options, commands, notifications and hooks, plus
//! the `getmanifest` response builder (§4.4, §6).
//!
//! Design Note "Variadic option registration" asks for a typed configuration
//! value in place of a variadic positional-argument list. [`OptionSpec`] and
//! friends are that: an ordered `Vec` built through [`crate::PluginBuilder`],
//! no variadic surface anywhere.

use serde_json::Value;

use crate::command::{Command, CommandResult};
use crate::host::Host;

pub(crate) type HandlerFn = Box<dyn FnMut(&mut Host, Command, Value) -> CommandResult>;

/// The wire type of a registered option, mirrored verbatim into the
/// `getmanifest` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    String,
    Integer,
    Boolean,
    Flag,
}

impl OptionType {
    fn as_wire_str(self) -> &'static str {
        match self {
            OptionType::String => "string",
            OptionType::Integer => "int",
            OptionType::Boolean => "bool",
            OptionType::Flag => "flag",
        }
    }
}

/// A single `--option` the plugin exposes to the node, with its parse
/// callback invoked once per §4.4's `init` handling.
pub struct OptionSpec {
    pub(crate) name: String,
    pub(crate) kind: OptionType,
    pub(crate) default: Option<Value>,
    pub(crate) description: String,
    pub(crate) on_set: Box<dyn FnMut(&Value) -> Result<(), String>>,
}

impl OptionSpec {
    pub fn new(
        name: impl Into<String>,
        kind: OptionType,
        description: impl Into<String>,
        on_set: impl FnMut(&Value) -> Result<(), String> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            description: description.into(),
            on_set: Box::new(on_set),
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    fn to_manifest_entry(&self) -> Value {
        let mut entry = serde_json::json!({
            "name": self.name,
            "type": self.kind.as_wire_str(),
            "description": self.description,
        });
        if let Some(default) = &self.default {
            entry["default"] = default.clone();
        }
        entry
    }
}

/// A registered RPC command (`rpcmethods` entry).
pub struct CommandSpec {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) long_description: Option<String>,
    pub(crate) handler: HandlerFn,
}

impl CommandSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl FnMut(&mut Host, Command, Value) -> CommandResult + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            long_description: None,
            handler: Box::new(handler),
        }
    }

    pub fn with_long_description(mut self, long_description: impl Into<String>) -> Self {
        self.long_description = Some(long_description.into());
        self
    }
}

/// A subscription to a node notification (no `id`, no reply).
pub struct Subscription {
    pub(crate) method: String,
    pub(crate) handler: HandlerFn,
}

impl Subscription {
    pub fn new(
        method: impl Into<String>,
        handler: impl FnMut(&mut Host, Command, Value) -> CommandResult + 'static,
    ) -> Self {
        Self {
            method: method.into(),
            handler: Box::new(handler),
        }
    }
}

/// A hook subscription: a request with an `id` that expects a reply
/// influencing node behavior.
pub struct HookSpec {
    pub(crate) method: String,
    pub(crate) handler: HandlerFn,
}

impl HookSpec {
    pub fn new(
        method: impl Into<String>,
        handler: impl FnMut(&mut Host, Command, Value) -> CommandResult + 'static,
    ) -> Self {
        Self {
            method: method.into(),
            handler: Box::new(handler),
        }
    }
}

/// Builds the `getmanifest` result object (§6) from the registered
/// descriptors and the pre-populated usage map (§4.5).
pub(crate) fn build_manifest(
    options: &[OptionSpec],
    commands: &[CommandSpec],
    subscriptions: &[Subscription],
    hooks: &[HookSpec],
    usage_map: &std::collections::HashMap<String, String>,
    dynamic: bool,
) -> Value {
    let options: Vec<Value> = options.iter().map(OptionSpec::to_manifest_entry).collect();

    let rpcmethods: Vec<Value> = commands
        .iter()
        .map(|cmd| {
            let mut entry = serde_json::json!({
                "name": cmd.name,
                "usage": usage_map.get(&cmd.name).cloned().unwrap_or_default(),
                "description": cmd.description,
            });
            if let Some(long) = &cmd.long_description {
                entry["long_description"] = Value::String(long.clone());
            }
            entry
        })
        .collect();

    let subscriptions: Vec<Value> = subscriptions
        .iter()
        .map(|s| Value::String(s.method.clone()))
        .collect();

    let hooks: Vec<Value> = hooks.iter().map(|h| Value::String(h.method.clone())).collect();

    serde_json::json!({
        "options": options,
        "rpcmethods": rpcmethods,
        "subscriptions": subscriptions,
        "hooks": hooks,
        "dynamic": if dynamic { "true" } else { "false" },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_reflects_registered_descriptors() {
        let options = vec![OptionSpec::new(
            "greeting",
            OptionType::String,
            "a greeting",
            |_| Ok(()),
        )
        .with_default(Value::String("hi".into()))];
        let mut usage = std::collections::HashMap::new();
        usage.insert("echo".to_string(), "[message]".to_string());
        let commands = vec![CommandSpec::new("echo", "echoes back", |_, _, _| {
            CommandResult::Complete
        })];
        let subscriptions = vec![Subscription::new("shutdown", |_, _, _| {
            CommandResult::Complete
        })];
        let hooks = vec![HookSpec::new("htlc_accepted", |_, _, _| {
            CommandResult::Complete
        })];

        let manifest = build_manifest(&options, &commands, &subscriptions, &hooks, &usage, true);

        assert_eq!(manifest["dynamic"], "true");
        assert_eq!(manifest["options"][0]["name"], "greeting");
        assert_eq!(manifest["options"][0]["default"], "hi");
        assert_eq!(manifest["rpcmethods"][0]["usage"], "[message]");
        assert_eq!(manifest["subscriptions"][0], "shutdown");
        assert_eq!(manifest["hooks"][0], "htlc_accepted");
    }

    #[test]
    fn missing_usage_defaults_to_empty_string() {
        let usage = std::collections::HashMap::new();
        let commands = vec![CommandSpec::new("echo", "echoes back", |_, _, _| {
            CommandResult::Complete
        })];
        let manifest = build_manifest(&[], &commands, &[], &[], &usage, false);
        assert_eq!(manifest["rpcmethods"][0]["usage"], "");
        assert_eq!(manifest["dynamic"], "false");
    }
}
