//! The cooperative, single-threaded event loop (§4.7).
//!
//! One `tokio::select!` over one task multiplexes node-stdin, the RPC
//! socket, their two outbound write queues, and the timer wheel. Nothing
//! here spawns: the Design Note on single-threaded dispatch rules out
//! `Arc<Mutex<_>>` and worker tasks, so concurrency is expressed entirely as
//! "which of these futures resolves first", not as parallelism.
//!
//! `Host` itself cannot be borrowed twice at once, so every `select!` branch
//! that touches the RPC connection takes a disjoint field of it
//! (`&mut conn.reader` vs `&mut conn.writer`/`&mut conn.pending_write`)
//! rather than `&mut Host`. The borrows are recomputed fresh every iteration
//! and never outlive the `select!` they were built for.
//!
//! Writes are the one place a `select!` branch can't simply be re-run from
//! scratch after losing a race: `write_all` loops internally, and if its
//! future is dropped mid-loop the bytes it already pushed onto the wire are
//! gone from our side's bookkeeping. `write_step` instead performs at most
//! one `write()` syscall per poll and records progress in a `PendingWrite`
//! that outlives the future, so a cancelled write resumes exactly where it
//! left off instead of re-sending or dropping bytes.
//!
//! Generic over the stdin/stdout halves so tests can drive the loop with
//! `tokio::io::duplex` instead of the real process stdio (§10.4); the node
//! only ever sees `tokio::io::{stdin, stdout}` through `PluginBuilder::run`.

use std::io::ErrorKind;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::dispatch::dispatch_inbound;
use crate::error::PluginError;
use crate::host::{Host, PendingWrite};
use crate::reader::{Framed, FramedReader};
use crate::timer::TimerResult;

/// Owns the two stdio halves and the `Host`; constructed once by
/// [`crate::PluginBuilder::run`] and consumed by [`EventLoop::run`].
pub(crate) struct EventLoop<R, W> {
    stdin: FramedReader<R>,
    stdout: W,
    stdout_pending: PendingWrite,
    host: Host,
}

enum Event {
    Stdin(Framed),
    Rpc(Framed),
    StdoutWrite(WriteStep),
    RpcWrite(WriteStep),
    TimerFired,
}

/// Outcome of one `write_step` poll.
enum WriteStep {
    /// Some bytes were written, or the writer was flushed; more may remain.
    Progress,
    /// The queued message is fully written and flushed.
    Done,
    /// The peer closed its read end; this writer will never make progress
    /// again.
    PeerGone,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> EventLoop<R, W> {
    pub(crate) fn new(stdin: R, stdout: W, host: Host) -> Self {
        Self {
            stdin: FramedReader::new(stdin, "stdin"),
            stdout,
            stdout_pending: PendingWrite::default(),
            host,
        }
    }

    /// Runs until the node closes stdin or stdout cleanly (`Ok(())`, the
    /// caller exits 0 per §6) or something fatal happens (`Err`, the caller
    /// logs it and exits 1 per §7). Never returns otherwise.
    pub(crate) async fn run(mut self) -> Result<(), PluginError> {
        loop {
            // Step 2: a reply already sitting in the RPC socket's buffer is
            // handled immediately, without going through `select!` at all,
            // so a backlog of replies can never be starved by stdin/timer
            // readiness.
            if let Some(conn) = self.host.rpc.as_mut() {
                if let Some(bytes) = conn.reader.try_take_message() {
                    self.host.handle_rpc_reply(&bytes)?;
                    continue;
                }
            }

            if self.stdout_pending.is_idle() {
                if let Some(bytes) = self.host.stdout_queue.pop_front() {
                    self.stdout_pending.load(bytes);
                }
            }
            if let Some(conn) = self.host.rpc.as_mut() {
                if conn.pending_write.is_idle() {
                    if let Some(bytes) = conn.out_queue.pop_front() {
                        conn.pending_write.load(bytes);
                    }
                }
            }

            let stdout_write_pending = !self.stdout_pending.is_idle();
            let rpc_connected = self.host.rpc.is_some();
            let rpc_write_pending = self
                .host
                .rpc
                .as_ref()
                .is_some_and(|c| !c.pending_write.is_idle());
            let timer_deadline = self.host.timers.next_deadline();

            let host = &mut self.host;
            let (rpc_reader, rpc_writer, rpc_pending) = match host.rpc.as_mut() {
                Some(conn) => (
                    Some(&mut conn.reader),
                    Some(&mut conn.writer),
                    Some(&mut conn.pending_write),
                ),
                None => (None, None, None),
            };

            let event: Event = tokio::select! {
                r = self.stdin.next_message() => Event::Stdin(r?),
                r = read_rpc(rpc_reader), if rpc_connected => Event::Rpc(r?),
                r = write_step(&mut self.stdout, &mut self.stdout_pending, "stdout"), if stdout_write_pending => {
                    Event::StdoutWrite(r?)
                }
                r = write_rpc_step(rpc_writer, rpc_pending), if rpc_write_pending => {
                    Event::RpcWrite(r?)
                }
                _ = sleep_until(timer_deadline) => Event::TimerFired,
            };

            match event {
                Event::Stdin(Framed::Message(bytes)) => {
                    dispatch_inbound(&mut self.host, &bytes).await?;
                }
                Event::Stdin(Framed::Eof) => return Ok(()),
                Event::Rpc(Framed::Message(bytes)) => {
                    self.host.handle_rpc_reply(&bytes)?;
                }
                Event::Rpc(Framed::Eof) => {
                    return Err(PluginError::Protocol(
                        "rpc socket closed while the plugin was still running".into(),
                    ))
                }
                // §6: the node closing its end of our stdout is the node
                // going away, same as a clean stdin EOF - not a transport
                // failure.
                Event::StdoutWrite(WriteStep::PeerGone) => return Ok(()),
                Event::StdoutWrite(WriteStep::Progress | WriteStep::Done) => {}
                Event::RpcWrite(WriteStep::PeerGone) => {
                    return Err(PluginError::Protocol(
                        "rpc socket closed while the plugin was still running".into(),
                    ))
                }
                Event::RpcWrite(WriteStep::Progress | WriteStep::Done) => {}
                Event::TimerFired => self.fire_due_timers(),
            }
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        for callback in self.host.timers.take_due(now) {
            if callback(&mut self.host) == TimerResult::Done {
                self.host.timer_complete();
            }
        }
    }
}

async fn read_rpc(reader: Option<&mut FramedReader<OwnedReadHalf>>) -> Result<Framed, PluginError> {
    match reader {
        Some(reader) => reader.next_message().await,
        None => std::future::pending().await,
    }
}

/// Whether an I/O error means the peer on the other end of a pipe/socket is
/// gone for good, as opposed to a transient or genuinely unexpected failure.
fn is_peer_gone(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}

/// Advances `pending` by at most one `write()` syscall, or flushes once it
/// is fully written. Never loops internally, so a `select!` branch built
/// from this future can be safely dropped mid-poll: nothing it hasn't
/// already committed to `pending` is lost (§4.7, §8 "Framing").
async fn write_step<W: AsyncWrite + Unpin>(
    writer: &mut W,
    pending: &mut PendingWrite,
    channel: &'static str,
) -> Result<WriteStep, PluginError> {
    if !pending.is_fully_written() {
        return match writer.write(pending.remaining()).await {
            Ok(0) => Ok(WriteStep::PeerGone),
            Ok(n) => {
                pending.advance(n);
                Ok(WriteStep::Progress)
            }
            Err(source) if is_peer_gone(&source) => Ok(WriteStep::PeerGone),
            Err(source) => Err(PluginError::io(channel, source)),
        };
    }
    writer
        .flush()
        .await
        .map_err(|source| PluginError::io(channel, source))?;
    pending.clear();
    Ok(WriteStep::Done)
}

async fn write_rpc_step(
    writer: Option<&mut OwnedWriteHalf>,
    pending: Option<&mut PendingWrite>,
) -> Result<WriteStep, PluginError> {
    match (writer, pending) {
        (Some(writer), Some(pending)) => write_step(writer, pending, "rpc-socket").await,
        _ => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HandshakeState;
    use crate::manifest::CommandSpec;
    use crate::message::MessageView;
    use serde_json::Value;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    fn read_one_frame(buf: &[u8]) -> Value {
        let end = buf.len() - 2;
        serde_json::from_slice(&buf[..end]).unwrap()
    }

    async fn send_line<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) {
        writer.write_all(bytes).await.unwrap();
        writer.write_all(b"\n\n").await.unwrap();
    }

    async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Value {
        let mut buf = vec![0u8; 8192];
        let n = reader.read(&mut buf).await.unwrap();
        read_one_frame(&buf[..n])
    }

    async fn write_rpc_reply(writer: &mut OwnedWriteHalf, id: u64, result: Value) {
        let msg = serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result });
        let mut bytes = serde_json::to_vec(&msg).unwrap();
        bytes.extend_from_slice(b"\n\n");
        writer.write_all(&bytes).await.unwrap();
        writer.flush().await.unwrap();
    }

    fn proxy_command() -> CommandSpec {
        CommandSpec::new("proxy", "proxies getinfo", |host, cmd, params| {
            if cmd.is_usage_only() {
                return host.command_set_usage(cmd, "");
            }
            host.send_outreq(
                cmd,
                "getinfo",
                params,
                |host, cmd, result| host.forward_result(cmd, &result),
                |host, cmd, err| host.forward_error(cmd, &err),
            )
        })
    }

    fn init_message(lightning_dir: &std::path::Path) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "init",
            "params": {
                "configuration": {
                    "lightning-dir": lightning_dir.to_str().unwrap(),
                    "network": "regtest",
                    "rpc-file": "lightning-rpc",
                },
                "options": {},
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn clean_stdin_eof_exits_cleanly() {
        let (client, server) = tokio::io::duplex(256);
        drop(client);
        let host = Host::new(vec![], vec![], vec![], vec![], true, None);
        let event_loop = EventLoop::new(server, tokio::io::sink(), host);
        assert!(event_loop.run().await.is_ok());
    }

    #[tokio::test]
    async fn stdout_peer_gone_exits_cleanly() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (stdout_tx, stdout_rx) = tokio::io::duplex(4096);
        drop(stdout_rx);
        let host = Host::new(vec![], vec![], vec![], vec![], true, None);
        let event_loop = EventLoop::new(server, stdout_tx, host);
        let handle = tokio::spawn(event_loop.run());

        // Triggers a getmanifest reply, which the closed stdout can never
        // accept.
        send_line(
            &mut client,
            br#"{"jsonrpc":"2.0","id":1,"method":"getmanifest","params":{}}"#,
        )
        .await;

        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn getmanifest_round_trips_over_duplex_pipes() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (stdout_tx, mut stdout_rx) = tokio::io::duplex(4096);
        let host = Host::new(vec![], vec![], vec![], vec![], true, None);
        let event_loop = EventLoop::new(server, stdout_tx, host);
        let handle = tokio::spawn(event_loop.run());

        client
            .write_all(br#"{"jsonrpc":"2.0","id":1,"method":"getmanifest","params":{}}"#)
            .await
            .unwrap();
        client.write_all(b"\n\n").await.unwrap();

        let mut buf = vec![0u8; 4096];
        let n = stdout_rx.read(&mut buf).await.unwrap();
        let value = read_one_frame(&buf[..n]);
        assert_eq!(value["id"], 1);
        assert!(value["result"]["rpcmethods"].is_array());

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_method_after_handshake_is_fatal_and_stops_the_loop() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut host = Host::new(
            vec![],
            vec![CommandSpec::new("echo", "echoes", |h, cmd, params| {
                h.command_success(cmd, params)
            })],
            vec![],
            vec![],
            true,
            None,
        );
        host.state = HandshakeState::Ready;
        let event_loop = EventLoop::new(server, tokio::io::sink(), host);
        let handle = tokio::spawn(event_loop.run());

        client
            .write_all(br#"{"jsonrpc":"2.0","id":1,"method":"nosuchmethod","params":{}}"#)
            .await
            .unwrap();
        client.write_all(b"\n\n").await.unwrap();

        let result = handle.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn timer_fires_a_log_notification_in_window() {
        let (client, server) = tokio::io::duplex(4096);
        let (stdout_tx, mut stdout_rx) = tokio::io::duplex(4096);
        let mut host = Host::new(vec![], vec![], vec![], vec![], true, None);
        host.state = HandshakeState::Ready;
        host.plugin_timer(std::time::Duration::from_millis(50), |host| {
            host.log(crate::host::LogLevel::Info, "tick");
            crate::timer::TimerResult::Done
        });
        let event_loop = EventLoop::new(server, stdout_tx, host);
        let handle = tokio::spawn(event_loop.run());

        let started = std::time::Instant::now();
        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(std::time::Duration::from_millis(500), stdout_rx.read(&mut buf))
            .await
            .expect("timer should fire well within the test timeout")
            .unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= std::time::Duration::from_millis(50));
        assert!(elapsed <= std::time::Duration::from_millis(200));

        let value = read_one_frame(&buf[..n]);
        assert_eq!(value["method"], "log");
        assert_eq!(value["params"]["message"], "tick");

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn full_handshake_then_single_outbound_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let socket_path = tmp.path().join("lightning-rpc");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let mock = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = FramedReader::new(read_half, "mock-rpc");

            reader.next_message().await.unwrap(); // listconfigs
            write_rpc_reply(
                &mut write_half,
                0,
                serde_json::json!({ "allow-deprecated-apis": "true" }),
            )
            .await;

            let Framed::Message(bytes) = reader.next_message().await.unwrap() else {
                panic!("expected the proxied getinfo request")
            };
            let id = MessageView::parse(&bytes)
                .unwrap()
                .id()
                .and_then(Value::as_u64)
                .unwrap();
            write_rpc_reply(&mut write_half, id, serde_json::json!({ "alias": "x" })).await;
        });

        let (mut stdin_tx, stdin_rx) = tokio::io::duplex(8192);
        let (stdout_tx, mut stdout_rx) = tokio::io::duplex(8192);
        let host = Host::new(vec![], vec![proxy_command()], vec![], vec![], true, None);
        let event_loop = EventLoop::new(stdin_rx, stdout_tx, host);
        let handle = tokio::spawn(event_loop.run());

        send_line(
            &mut stdin_tx,
            br#"{"jsonrpc":"2.0","id":1,"method":"getmanifest","params":{}}"#,
        )
        .await;
        let manifest_reply = read_frame(&mut stdout_rx).await;
        assert_eq!(manifest_reply["id"], 1);

        send_line(&mut stdin_tx, &init_message(tmp.path())).await;
        let init_reply = read_frame(&mut stdout_rx).await;
        assert_eq!(init_reply["id"], 2);
        assert_eq!(init_reply["result"], serde_json::json!({}));

        send_line(
            &mut stdin_tx,
            br#"{"jsonrpc":"2.0","id":7,"method":"proxy","params":{}}"#,
        )
        .await;
        let proxy_reply = read_frame(&mut stdout_rx).await;
        assert_eq!(proxy_reply["id"], 7);
        assert_eq!(proxy_reply["result"]["alias"], "x");

        drop(stdin_tx);
        handle.await.unwrap().unwrap();
        mock.await.unwrap();
    }

    #[tokio::test]
    async fn out_of_order_outbound_replies_route_to_the_right_caller() {
        let tmp = tempfile::tempdir().unwrap();
        let socket_path = tmp.path().join("lightning-rpc");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let mock = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = FramedReader::new(read_half, "mock-rpc");

            reader.next_message().await.unwrap(); // listconfigs
            write_rpc_reply(
                &mut write_half,
                0,
                serde_json::json!({ "allow-deprecated-apis": "true" }),
            )
            .await;

            let mut ids = Vec::new();
            for _ in 0..2 {
                let Framed::Message(bytes) = reader.next_message().await.unwrap() else {
                    panic!("expected a proxied getinfo request")
                };
                ids.push(
                    MessageView::parse(&bytes)
                        .unwrap()
                        .id()
                        .and_then(Value::as_u64)
                        .unwrap(),
                );
            }

            // Reply to the second outbound request first.
            write_rpc_reply(&mut write_half, ids[1], serde_json::json!({ "alias": "second" })).await;
            write_rpc_reply(&mut write_half, ids[0], serde_json::json!({ "alias": "first" })).await;
        });

        let (mut stdin_tx, stdin_rx) = tokio::io::duplex(8192);
        let (stdout_tx, mut stdout_rx) = tokio::io::duplex(8192);
        let host = Host::new(vec![], vec![proxy_command()], vec![], vec![], true, None);
        let event_loop = EventLoop::new(stdin_rx, stdout_tx, host);
        let handle = tokio::spawn(event_loop.run());

        send_line(
            &mut stdin_tx,
            br#"{"jsonrpc":"2.0","id":1,"method":"getmanifest","params":{}}"#,
        )
        .await;
        read_frame(&mut stdout_rx).await;

        send_line(&mut stdin_tx, &init_message(tmp.path())).await;
        read_frame(&mut stdout_rx).await;

        send_line(
            &mut stdin_tx,
            br#"{"jsonrpc":"2.0","id":10,"method":"proxy","params":{}}"#,
        )
        .await;
        send_line(
            &mut stdin_tx,
            br#"{"jsonrpc":"2.0","id":11,"method":"proxy","params":{}}"#,
        )
        .await;

        let first_reply = read_frame(&mut stdout_rx).await;
        let second_reply = read_frame(&mut stdout_rx).await;
        assert_eq!(first_reply["id"], 11);
        assert_eq!(second_reply["id"], 10);

        drop(stdin_tx);
        handle.await.unwrap().unwrap();
        mock.await.unwrap();
    }
}
