//! Connection state machine and request/response exchange.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::message::{Command, Greeting, commands, error_of, is_event};
use crate::{Error, Result, codec};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnState {
    /// No socket. Initial state, and the state after any socket error.
    Disconnected,
    /// Retrying `connect()` until the hypervisor opens its listener.
    Connecting,
    /// Connected; reading the greeting and negotiating capabilities.
    Handshaking,
    /// Handshake complete; commands may be sent.
    Ready,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
        })
    }
}

/// Timing parameters for establishing and using a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct ConnectPolicy {
    /// Total time to keep retrying before giving up silently.
    pub window: Duration,
    /// Pause between refused connection attempts.
    pub interval: Duration,
    /// Per-read deadline during the handshake.
    pub io_timeout: Duration,
    /// Deadline for the reply to an application command.
    pub reply_timeout: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(8),
            interval: Duration::from_millis(250),
            io_timeout: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(60),
        }
    }
}

impl ConnectPolicy {
    /// Overrides the retry window.
    #[must_use]
    pub const fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Overrides the pause between attempts.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Overrides the per-read handshake deadline.
    #[must_use]
    pub const fn io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// Overrides the reply deadline.
    #[must_use]
    pub const fn reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }
}

/// An established, negotiated connection.
#[derive(Debug)]
struct Connection {
    /// Buffered read half; replies are line-delimited.
    reader: BufReader<OwnedReadHalf>,
    /// Write half.
    writer: OwnedWriteHalf,
}

/// State shared by all clones of a [`Client`].
#[derive(Debug)]
struct Inner {
    /// Loopback port of the QMP server.
    port: u16,
    /// Retry and timeout parameters.
    policy: ConnectPolicy,
    /// Current [`ConnState`], observable through [`Client::subscribe`].
    state: watch::Sender<ConnState>,
    /// The live connection, present only in [`ConnState::Ready`].
    conn: Mutex<Option<Connection>>,
    /// Events read while waiting for a reply.
    events: StdMutex<VecDeque<Value>>,
    /// Banner of the current connection.
    greeting: StdMutex<Option<Greeting>>,
}

/// A QMP client bound to one loopback TCP port.
///
/// Cloning yields another handle to the same connection. Commands are
/// serialized: one request and its reply are exchanged at a time.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Creates a disconnected client for `127.0.0.1:port`.
    pub fn new(port: u16, policy: ConnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                port,
                policy,
                state,
                conn: Mutex::new(None),
                events: StdMutex::new(VecDeque::new()),
                greeting: StdMutex::new(None),
            }),
        }
    }

    /// Creates a client and starts connecting in a background task.
    ///
    /// There is no error callback: if the window elapses without a
    /// handshake, the client silently returns to [`ConnState::Disconnected`].
    /// Poll [`state`](Self::state) or await [`wait_ready`](Self::wait_ready).
    pub fn spawn(port: u16, policy: ConnectPolicy) -> Self {
        let client = Self::new(port, policy);
        client.set_state(ConnState::Connecting);
        let task = client.clone();
        tokio::spawn(async move {
            task.establish().await;
        });
        client
    }

    /// Connects in the foreground, failing with [`Error::NotConnected`]
    /// when the window elapses.
    pub async fn connect(port: u16, policy: ConnectPolicy) -> Result<Self> {
        let client = Self::new(port, policy);
        if client.establish().await {
            Ok(client)
        } else {
            Err(Error::NotConnected)
        }
    }

    /// The loopback port this client targets.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        *self.inner.state.borrow()
    }

    /// Returns `true` once the handshake has completed.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnState::Ready
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnState> {
        self.inner.state.subscribe()
    }

    /// Waits until the client is ready or `limit` elapses.
    pub async fn wait_ready(&self, limit: Duration) -> bool {
        let mut rx = self.subscribe();
        timeout(limit, rx.wait_for(|s| *s == ConnState::Ready))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// The server banner of the current connection, if any.
    pub fn greeting(&self) -> Option<Greeting> {
        self.inner.greeting.lock().ok().and_then(|g| g.clone())
    }

    /// Drains asynchronous events received while awaiting replies.
    pub fn take_events(&self) -> Vec<Value> {
        self.inner
            .events
            .lock()
            .map(|mut q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Retries connect + handshake until ready or the window elapses.
    ///
    /// Returns `true` on success.
    async fn establish(&self) -> bool {
        let policy = self.inner.policy;
        let port = self.inner.port;
        let deadline = Instant::now() + policy.window;
        self.set_state(ConnState::Connecting);

        loop {
            match timeout(
                policy.io_timeout,
                TcpStream::connect((Ipv4Addr::LOCALHOST, port)),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    self.set_state(ConnState::Handshaking);
                    match self.handshake(stream).await {
                        Ok(conn) => {
                            *self.inner.conn.lock().await = Some(conn);
                            self.set_state(ConnState::Ready);
                            info!(port, "control connection ready");
                            return true;
                        }
                        Err(e) => {
                            debug!(port, error = %e, "handshake failed, retrying");
                            self.set_state(ConnState::Connecting);
                        }
                    }
                }
                Ok(Err(e)) => debug!(port, error = %e, "control socket not listening yet"),
                Err(_) => debug!(port, "connect attempt timed out"),
            }

            if Instant::now() + policy.interval >= deadline {
                warn!(port, window = ?policy.window, "control connection not established");
                self.set_state(ConnState::Disconnected);
                return false;
            }
            sleep(policy.interval).await;
        }
    }

    /// Reads the greeting and negotiates capabilities.
    async fn handshake(&self, stream: TcpStream) -> Result<Connection> {
        let io_timeout = self.inner.policy.io_timeout;
        let (read_half, writer) = stream.into_split();
        let mut conn = Connection {
            reader: BufReader::new(read_half),
            writer,
        };

        let banner = timeout(io_timeout, codec::recv(&mut conn.reader))
            .await
            .map_err(|_| Error::Timeout)??;
        match Greeting::from_value(&banner) {
            Some(g) => {
                if let Some(v) = g.qemu_version() {
                    debug!(version = %v, "received QMP greeting");
                }
                if let Ok(mut slot) = self.inner.greeting.lock() {
                    *slot = Some(g);
                }
            }
            None => debug!(banner = %banner, "unrecognized QMP greeting"),
        }

        codec::send(&mut conn.writer, &Command::new(commands::CAPABILITIES)).await?;
        let reply = self.read_reply(&mut conn, io_timeout).await?;
        if let Some((class, desc)) = error_of(&reply) {
            return Err(Error::Command { class, desc });
        }
        Ok(conn)
    }

    /// Sends a command and returns the server's reply object unchanged.
    ///
    /// Fails with [`Error::NotConnected`] unless the state is
    /// [`ConnState::Ready`]. A reply that is not valid JSON comes back as
    /// `{"raw": "<text>"}`. A socket error or reply timeout drops the
    /// connection and moves the client back to [`ConnState::Disconnected`].
    pub async fn send_command(&self, cmd: &Command) -> Result<Value> {
        if !self.is_ready() {
            return Err(Error::NotConnected);
        }
        let mut guard = self.inner.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Err(Error::NotConnected);
        };

        let reply_timeout = self.inner.policy.reply_timeout;
        let result = match codec::send(&mut conn.writer, cmd).await {
            Ok(()) => self.read_reply(conn, reply_timeout).await,
            Err(e) => Err(e.into()),
        };
        match result {
            // The stream is unusable or out of step with its replies.
            Err(e @ (Error::Io(_) | Error::Timeout)) => {
                *guard = None;
                self.set_state(ConnState::Disconnected);
                warn!(port = self.inner.port, error = %e, "control connection lost");
                Err(e)
            }
            other => other,
        }
    }

    /// Sends a command and returns its `return` payload, mapping error
    /// replies to [`Error::Command`].
    pub async fn execute(&self, cmd: &Command) -> Result<Value> {
        let reply = self.send_command(cmd).await?;
        if let Some((class, desc)) = error_of(&reply) {
            return Err(Error::Command { class, desc });
        }
        Ok(reply.get("return").cloned().unwrap_or(reply))
    }

    /// Saves an internal snapshot named `tag` through the human monitor.
    ///
    /// `savevm` reports failure as text inside a successful reply; any
    /// non-empty output becomes [`Error::Command`].
    pub async fn savevm(&self, tag: &str) -> Result<()> {
        let reply = self.execute(&Command::human(format!("savevm {tag}"))).await?;
        match reply.as_str().map(str::trim) {
            Some(text) if !text.is_empty() => Err(Error::Command {
                class: "GenericError".to_owned(),
                desc: text.to_owned(),
            }),
            _ => Ok(()),
        }
    }

    /// Closes the connection, if any.
    pub async fn close(&self) {
        *self.inner.conn.lock().await = None;
        self.set_state(ConnState::Disconnected);
    }

    /// Reads lines until a non-event message arrives, queueing events.
    async fn read_reply(&self, conn: &mut Connection, limit: Duration) -> Result<Value> {
        let read = async {
            loop {
                let msg = codec::recv(&mut conn.reader).await?;
                if !is_event(&msg) {
                    return Ok::<_, Error>(msg);
                }
                debug!(event = %msg["event"], "queued QMP event");
                if let Ok(mut q) = self.inner.events.lock() {
                    q.push_back(msg);
                }
            }
        };
        timeout(limit, read).await.map_err(|_| Error::Timeout)?
    }

    /// Publishes a state transition.
    fn set_state(&self, s: ConnState) {
        self.inner.state.send_replace(s);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    const GREETING: &str = r#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 2, "major": 8}, "package": ""}, "capabilities": []}}"#;

    fn fast() -> ConnectPolicy {
        ConnectPolicy {
            window: Duration::from_secs(3),
            interval: Duration::from_millis(20),
            io_timeout: Duration::from_millis(500),
            reply_timeout: Duration::from_secs(2),
        }
    }

    /// Minimal QMP server: greets, accepts capabilities, answers query-status.
    /// Emits an event before every query-status reply.
    async fn fake_server(listener: TcpListener) -> Vec<String> {
        let (stream, _) = listener.accept().await.unwrap();
        let (r, mut w) = stream.into_split();
        let mut lines = tokio::io::BufReader::new(r).lines();
        let mut seen = Vec::new();

        w.write_all(format!("{GREETING}\n").as_bytes()).await.unwrap();
        while let Ok(Some(line)) = lines.next_line().await {
            let cmd: Value = serde_json::from_str(&line).unwrap();
            let name = cmd["execute"].as_str().unwrap().to_owned();
            let reply = match name.as_str() {
                "qmp_capabilities" => "{\"return\": {}}\n".to_owned(),
                "query-status" => "{\"event\": \"RESUME\", \"timestamp\": {}}\n\
                     {\"return\": {\"status\": \"running\", \"running\": true}}\n"
                    .to_owned(),
                "garbage" => "not json at all\n".to_owned(),
                "human-monitor-command" if cmd["arguments"]["command-line"] == "savevm bad" => {
                    "{\"return\": \"Error: No block device can accept snapshots\\r\\n\"}\n"
                        .to_owned()
                }
                "human-monitor-command" => "{\"return\": \"\"}\n".to_owned(),
                _ => "{\"error\": {\"class\": \"CommandNotFound\", \"desc\": \"unknown\"}}\n"
                    .to_owned(),
            };
            seen.push(name);
            w.write_all(reply.as_bytes()).await.unwrap();
        }
        seen
    }

    #[tokio::test]
    async fn commands_fail_while_disconnected() {
        let client = Client::new(1, fast());
        assert_eq!(client.state(), ConnState::Disconnected);
        let err = client.send_command(&Command::new("query-status")).await;
        assert!(matches!(err, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn commands_fail_while_handshaking() {
        // A listener that accepts but never greets keeps the client in Handshaking.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hold = tokio::spawn(async move {
            let (s, _) = listener.accept().await.unwrap();
            sleep(Duration::from_secs(2)).await;
            drop(s);
        });

        let client = Client::spawn(port, fast());
        let mut rx = client.subscribe();
        rx.wait_for(|s| *s == ConnState::Handshaking).await.unwrap();

        let err = client.send_command(&Command::new("query-status")).await;
        assert!(matches!(err, Err(Error::NotConnected)));
        hold.abort();
    }

    #[tokio::test]
    async fn handshake_then_one_reply_per_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(fake_server(listener));

        let client = Client::spawn(port, fast());
        assert!(client.wait_ready(Duration::from_secs(3)).await);
        assert_eq!(
            client.greeting().unwrap().qemu_version().unwrap().to_string(),
            "8.2.0"
        );

        for _ in 0..2 {
            let reply = client
                .send_command(&Command::new("query-status"))
                .await
                .unwrap();
            assert_eq!(reply["return"]["status"], "running");
        }
        let events = client.take_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], "RESUME");

        let raw = client.send_command(&Command::new("garbage")).await.unwrap();
        assert_eq!(raw, json!({"raw": "not json at all"}));

        let err = client.execute(&Command::new("bogus")).await.unwrap_err();
        assert!(matches!(err, Error::Command { ref class, .. } if class == "CommandNotFound"));

        client.close().await;
        assert_eq!(
            server.await.unwrap(),
            ["qmp_capabilities", "query-status", "query-status", "garbage", "bogus"]
        );
    }

    #[tokio::test]
    async fn savevm_text_output_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(fake_server(listener));

        let client = Client::spawn(port, fast());
        assert!(client.wait_ready(Duration::from_secs(3)).await);

        client.savevm("good").await.unwrap();
        let err = client.savevm("bad").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Command { ref desc, .. } if desc == "Error: No block device can accept snapshots"
        ));

        client.close().await;
        assert_eq!(
            server.await.unwrap(),
            ["qmp_capabilities", "human-monitor-command", "human-monitor-command"]
        );
    }

    #[tokio::test]
    async fn retries_until_listener_appears() {
        // Reserve a port, release it, and bind it again after a delay.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let client = Client::spawn(port, fast());

        sleep(Duration::from_millis(200)).await;
        assert_ne!(client.state(), ConnState::Ready);

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        tokio::spawn(fake_server(listener));
        assert!(client.wait_ready(Duration::from_secs(3)).await);
    }

    #[tokio::test]
    async fn gives_up_silently_after_window() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let policy = fast().window(Duration::from_millis(150));
        let client = Client::spawn(port, policy);
        sleep(Duration::from_millis(500)).await;
        assert_eq!(client.state(), ConnState::Disconnected);
        assert!(matches!(
            Client::connect(port, policy).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn socket_error_collapses_to_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let mut lines = tokio::io::BufReader::new(r).lines();
            w.write_all(format!("{GREETING}\n").as_bytes()).await.unwrap();
            let _caps = lines.next_line().await.unwrap();
            w.write_all(b"{\"return\": {}}\n").await.unwrap();
            // Hang up on the first real command.
            let _cmd = lines.next_line().await.unwrap();
        });

        let client = Client::connect(port, fast()).await.unwrap();
        assert!(client.is_ready());
        assert!(client.send_command(&Command::new("query-status")).await.is_err());
        assert_eq!(client.state(), ConnState::Disconnected);
        assert!(matches!(
            client.send_command(&Command::new("query-status")).await,
            Err(Error::NotConnected)
        ));
    }
}
