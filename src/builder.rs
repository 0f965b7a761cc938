//! `PluginBuilder`: the registration surface a plugin author drives before
//! handing control to the event loop (§10.3).
//!
//! Shaped after the pack's `CodexClientBuilder`: a handful of chained
//! registration calls collecting into plain `Vec`s, consumed once by `run`.
//! Unlike that builder there is no variadic positional-argument surface
//! anywhere (Design Note "Variadic option registration") — every registered
//! thing is a typed struct built by its own constructor.

use serde_json::Value;

use crate::command::{Command, CommandResult};
use crate::error::PluginError;
use crate::event_loop::EventLoop;
use crate::host::{Host, InitHook};
use crate::manifest::{CommandSpec, HookSpec, OptionSpec, Subscription};

/// Collects option/command/subscription/hook registrations and produces a
/// running [`Host`].
#[derive(Default)]
pub struct PluginBuilder {
    options: Vec<OptionSpec>,
    commands: Vec<CommandSpec>,
    subscriptions: Vec<Subscription>,
    hooks: Vec<HookSpec>,
    dynamic: bool,
    init_hook: Option<InitHook>,
}

impl PluginBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn option(mut self, option: OptionSpec) -> Self {
        self.options.push(option);
        self
    }

    pub fn command(mut self, command: CommandSpec) -> Self {
        self.commands.push(command);
        self
    }

    pub fn subscribe(mut self, subscription: Subscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    pub fn hook(mut self, hook: HookSpec) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Whether the node may restart this plugin without restarting itself
    /// (mirrored verbatim into `getmanifest`'s `dynamic` field).
    pub fn dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    /// Registers a callback run once, after options are applied and the RPC
    /// socket is connected, but before `init` is acknowledged. Plugins that
    /// need `Host::plugin_timer` or a first outbound RPC at startup do it
    /// here rather than racing the first `getmanifest`/`init` round trip.
    pub fn on_init(mut self, hook: impl FnOnce(&mut Host, &Value) + 'static) -> Self {
        self.init_hook = Some(Box::new(hook));
        self
    }

    /// Installs `tracing-subscriber` (stderr-only — stdout is the wire, see
    /// §10.1), builds the `Host`, and runs the event loop to completion.
    ///
    /// Returns on clean shutdown; callers that want §7's exit-code contract
    /// (0 on clean EOF, 1 on any `PluginError`) should use
    /// [`Self::run_to_exit`] instead of handling the `Result` themselves.
    pub async fn run(self) -> Result<(), PluginError> {
        install_tracing();
        let host = Host::new(
            self.options,
            self.commands,
            self.subscriptions,
            self.hooks,
            self.dynamic,
            self.init_hook,
        );
        EventLoop::new(tokio::io::stdin(), tokio::io::stdout(), host)
            .run()
            .await
    }

    /// As [`Self::run`], but applies §7's process exit-code contract
    /// directly: a clean shutdown exits 0, a fatal [`PluginError`] is logged
    /// at error level and exits 1. Never returns.
    pub async fn run_to_exit(self) -> ! {
        match self.run().await {
            Ok(()) => std::process::exit(0),
            Err(err) => {
                tracing::error!(error = %err, "plugin exiting after a fatal error");
                std::process::exit(1);
            }
        }
    }
}

fn install_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

/// A no-op handler usable as a placeholder for a command that only needs to
/// finalize successfully with its input echoed back, handy in tests and
/// trivial plugins.
pub fn echo_handler(host: &mut Host, cmd: Command, params: Value) -> CommandResult {
    if cmd.is_usage_only() {
        return host.command_set_usage(cmd, "[params]");
    }
    host.command_success(cmd, params)
}
