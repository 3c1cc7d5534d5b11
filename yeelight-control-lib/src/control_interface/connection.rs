//! TCP connection lifecycle: connect, the reader/writer tasks, keepalive and
//! automatic reconnection.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::control_interface::command::{Command, CommandOutcome, CommandResult, PROPS_METHOD};
use crate::control_interface::pending::{PendingOperation, PendingTable};
use crate::control_interface::{ClientConfig, ClientEvent};
use crate::error::{Error, Result};
use crate::util::codec::{decode_frame, encode_command, LineBuffer, ResponseFrame};

const READ_BUFFER_SIZE: usize = 4096;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// `disconnect` is tearing the connection down.
    Closing,
}

struct Inner {
    state: ConnectionState,
    pending: PendingTable,
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    writer_task: Option<JoinHandle<()>>,
    /// Bumped on every successful connect; stale transitions are ignored.
    generation: u64,
    connection: Option<CancellationToken>,
    reconnect: Option<CancellationToken>,
    /// Set by `disconnect`, cleared by an explicit `connect`.
    closing: bool,
    /// Cancelled once a running `disconnect` has shut the socket down.
    closed: Option<CancellationToken>,
    /// When the device last sent a line on the live connection.
    last_received: Option<Instant>,
}

/// State shared between the client handles and the connection tasks.
///
/// Tasks only hold a `Weak` reference, so dropping the last client handle
/// drops this and cancels them.
pub(crate) struct Shared {
    config: ClientConfig,
    events: broadcast::Sender<ClientEvent>,
    inner: Mutex<Inner>,
}

impl Shared {
    pub(crate) fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Shared {
            config,
            events,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                pending: PendingTable::new(),
                writer: None,
                writer_task: None,
                generation: 0,
                connection: None,
                reconnect: None,
                closing: false,
                closed: None,
                last_received: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ClientEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Opens the TCP connection and starts the connection tasks.
    ///
    /// `reconnecting` is set when called from the reconnect loop, which must
    /// not override an intentional `disconnect`.
    pub(crate) async fn open(self: &Arc<Self>, reconnecting: bool) -> Result<()> {
        {
            let mut inner = self.lock();
            match inner.state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    return Err(Error::AlreadyConnected)
                }
                ConnectionState::Closing => return Err(Error::ConnectionClosed),
                ConnectionState::Disconnected => {}
            }
            if reconnecting {
                if inner.closing {
                    return Err(Error::ConnectionClosed);
                }
            } else {
                inner.closing = false;
                if let Some(reconnect) = inner.reconnect.take() {
                    reconnect.cancel();
                }
            }
            inner.state = ConnectionState::Connecting;
        }

        let host = self.config.host.as_str();
        let port = self.config.port;
        debug!("Connecting to {}:{}", host, port);
        let stream = match timeout(self.config.connect_timeout, TcpStream::connect((host, port))).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.lock().state = ConnectionState::Disconnected;
                return Err(e.into());
            }
            Err(_) => {
                self.lock().state = ConnectionState::Disconnected;
                return Err(Error::ConnectTimeout {
                    host: host.to_string(),
                    port,
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }
        let (reader, writer) = stream.into_split();

        let token = CancellationToken::new();
        let (frames, frame_receiver) = mpsc::unbounded_channel();
        let generation = {
            let mut inner = self.lock();
            if inner.closing {
                // disconnect() ran while the connect was in flight.
                inner.state = ConnectionState::Disconnected;
                return Err(Error::ConnectionClosed);
            }
            inner.generation += 1;
            let generation = inner.generation;
            inner.pending.reset();
            inner.last_received = None;
            inner.writer = Some(frames);
            inner.connection = Some(token.clone());
            inner.reconnect = None;
            inner.state = ConnectionState::Connected;
            let writer_task = tokio::spawn(write_loop(
                writer,
                frame_receiver,
                token.clone(),
                Arc::downgrade(self),
                generation,
            ));
            inner.writer_task = Some(writer_task);
            generation
        };

        tokio::spawn(read_loop(
            reader,
            token.clone(),
            Arc::downgrade(self),
            generation,
        ));
        if let Some(every) = self.config.keepalive_interval {
            tokio::spawn(keepalive_loop(
                Arc::downgrade(self),
                token,
                generation,
                every,
            ));
        }

        info!("Connected to {}:{}", host, port);
        self.emit(ClientEvent::Connected);
        Ok(())
    }

    /// Intentional close. Waits until the socket's write half is shut down,
    /// also when another `close` is already doing it.
    pub(crate) async fn close(&self) {
        let (writer_task, closed, owner) = {
            let mut inner = self.lock();
            inner.closing = true;
            if let Some(reconnect) = inner.reconnect.take() {
                reconnect.cancel();
            }
            match inner.state {
                ConnectionState::Connected => {
                    let closed = CancellationToken::new();
                    inner.closed = Some(closed.clone());
                    inner.state = ConnectionState::Closing;
                    inner.writer = None;
                    if let Some(connection) = inner.connection.take() {
                        connection.cancel();
                    }
                    inner.pending.drain();
                    (inner.writer_task.take(), Some(closed), true)
                }
                ConnectionState::Closing => (None, inner.closed.clone(), false),
                // Nothing open; an in-flight connect sees `closing` and gives up.
                ConnectionState::Disconnected | ConnectionState::Connecting => return,
            }
        };
        let Some(closed) = closed else {
            return;
        };
        if !owner {
            // Another close owns the teardown.
            closed.cancelled().await;
            return;
        }

        if let Some(task) = writer_task {
            if let Err(e) = task.await {
                warn!("Writer task failed: {}", e);
            }
        }
        {
            let mut inner = self.lock();
            inner.state = ConnectionState::Disconnected;
            inner.closed = None;
        }
        closed.cancel();
        info!(
            "Disconnected from {}:{}",
            self.config.host, self.config.port
        );
        self.emit(ClientEvent::Disconnected);
    }

    /// The single transition for every kind of connection loss.
    ///
    /// No-op unless `generation` is the live connection.
    pub(crate) fn became_disconnected(self: &Arc<Self>, generation: u64, reason: &str) {
        let reconnect = {
            let mut inner = self.lock();
            if inner.generation != generation || inner.state != ConnectionState::Connected {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.writer = None;
            inner.writer_task = None;
            if let Some(connection) = inner.connection.take() {
                connection.cancel();
            }
            let rejected = inner.pending.drain();
            if rejected > 0 {
                debug!("Rejected {} pending command(s)", rejected);
            }
            if self.config.auto_reconnect && !inner.closing {
                let token = CancellationToken::new();
                inner.reconnect = Some(token.clone());
                Some(token)
            } else {
                None
            }
        };

        warn!(
            "Connection to {}:{} lost: {}",
            self.config.host, self.config.port, reason
        );
        self.emit(ClientEvent::Disconnected);
        if let Some(token) = reconnect {
            tokio::spawn(reconnect_loop(Arc::downgrade(self), token));
        }
    }

    pub(crate) async fn send_command(self: &Arc<Self>, command: Command) -> Result<CommandOutcome> {
        let (reply, mut response) = oneshot::channel();
        let sent_at = Instant::now();
        let (id, command, generation) = {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Connected {
                return Err(Error::NotConnected);
            }
            let Some(writer) = inner.writer.clone() else {
                return Err(Error::NotConnected);
            };
            let (id, command) = inner.pending.register(command, reply);
            let frame = match encode_command(&command) {
                Ok(frame) => frame,
                Err(e) => {
                    inner.pending.complete(id);
                    return Err(e);
                }
            };
            debug!("-> {}", String::from_utf8_lossy(&frame).trim_end());
            if writer.send(frame).is_err() {
                inner.pending.complete(id);
                return Err(Error::NotConnected);
            }
            (id, command, inner.generation)
        };
        self.emit(ClientEvent::CommandSent(command.clone()));

        match timeout(self.config.command_timeout, &mut response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                let (expired, dead) = {
                    let mut inner = self.lock();
                    if inner.generation == generation {
                        let expired = inner.pending.complete(id);
                        // Silence since the send with nothing else still
                        // waiting means the device is gone.
                        let heard = inner.last_received.is_some_and(|at| at >= sent_at);
                        let dead = expired.is_some() && inner.pending.is_empty() && !heard;
                        (expired, dead)
                    } else {
                        (None, false)
                    }
                };
                if expired.is_none() {
                    // The response or a disconnect got there first.
                    return response.try_recv().unwrap_or(Err(Error::ConnectionClosed));
                }
                warn!(
                    "Command {} (id {}) timed out after {:?}",
                    command.method, id, self.config.command_timeout
                );
                let method = command.method;
                self.emit(ClientEvent::CommandTimedOut(command));
                if dead {
                    self.became_disconnected(generation, "command timed out");
                } else {
                    debug!("Connection kept open, other commands are still in flight");
                }
                Err(Error::Timeout { id, method })
            }
        }
    }

    /// Routes one line received from the device.
    fn handle_line(&self, line: &[u8]) {
        debug!("<- {}", String::from_utf8_lossy(line));
        self.lock().last_received = Some(Instant::now());
        let frame = match decode_frame(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    "Dropping undecodable frame {:?}: {}",
                    String::from_utf8_lossy(line),
                    e
                );
                return;
            }
        };

        if let Some(id) = frame.id {
            let operation = self.lock().pending.complete(id);
            match operation {
                Some(operation) => self.resolve(id, operation, frame),
                None => debug!("No pending command for response id {}", id),
            }
            return;
        }

        if frame.method.as_deref() == Some(PROPS_METHOD) {
            self.emit(ClientEvent::PropsChanged(
                frame.params.unwrap_or(Value::Null),
            ));
        } else {
            debug!("Ignoring frame without id: {:?}", frame.method);
        }
    }

    fn resolve(&self, id: u64, operation: PendingOperation, frame: ResponseFrame) {
        let PendingOperation { command, reply } = operation;
        let result = CommandResult {
            id,
            result: frame.result,
            error: frame.error,
        };
        let succeeded = result.error.is_none() && result.result.is_some();
        let has_values = result.result.as_ref().is_some_and(|values| !values.is_empty());
        let outcome = CommandOutcome {
            action: command.method,
            command,
            result,
            success: succeeded,
        };

        self.emit(ClientEvent::CommandCompleted(outcome.clone()));
        let reply_value = if outcome.result.error.is_some() {
            self.emit(ClientEvent::CommandError(outcome.clone()));
            Err(Error::Command(Box::new(outcome)))
        } else if succeeded {
            if has_values {
                self.emit(ClientEvent::CommandSuccess(outcome.clone()));
            }
            Ok(outcome)
        } else {
            Err(Error::Protocol(format!(
                "response {} carries neither result nor error",
                id
            )))
        };
        // The caller may have given up already.
        let _ = reply.send(reply_value);
    }

    pub(crate) fn emit_error(&self, error: &Error) {
        self.emit(ClientEvent::Error(error.to_string()));
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(connection) = inner.connection.take() {
            connection.cancel();
        }
        if let Some(reconnect) = inner.reconnect.take() {
            reconnect.cancel();
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    token: CancellationToken,
    weak: Weak<Shared>,
    generation: u64,
) {
    let mut lines = LineBuffer::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let reason = loop {
        let number_of_bytes = tokio::select! {
            _ = token.cancelled() => return,
            read = reader.read(&mut buffer) => match read {
                Ok(0) => break "closed by peer".to_string(),
                Ok(n) => n,
                Err(e) => break e.to_string(),
            },
        };
        lines.extend(&buffer[..number_of_bytes]);
        let Some(shared) = weak.upgrade() else {
            return;
        };
        while let Some(line) = lines.next_line() {
            shared.handle_line(&line);
        }
    };
    if let Some(shared) = weak.upgrade() {
        shared.became_disconnected(generation, &reason);
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    token: CancellationToken,
    weak: Weak<Shared>,
    generation: u64,
) {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = writer.write_all(&frame).await {
            if let Some(shared) = weak.upgrade() {
                shared.became_disconnected(generation, &e.to_string());
            }
            break;
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Socket shutdown failed: {}", e);
    }
}

/// Pings the device every `every`; a failure other than "method not
/// supported" counts as a dead connection.
async fn keepalive_loop(
    weak: Weak<Shared>,
    token: CancellationToken,
    generation: u64,
    every: Duration,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match shared.send_command(Command::ping()).await {
            Ok(_) => debug!("Keepalive ping answered"),
            Err(Error::Command(outcome))
                if outcome
                    .result
                    .error
                    .as_ref()
                    .is_some_and(|error| error.is_method_not_supported()) =>
            {
                debug!("Keepalive ping answered with method not supported")
            }
            // A timeout that lost the connection also cancels the token.
            Err(Error::Timeout { .. }) => debug!("Keepalive ping timed out"),
            // The connection is already gone.
            Err(Error::ConnectionClosed | Error::NotConnected) => return,
            Err(e) => {
                warn!("Keepalive failed: {}", e);
                shared.became_disconnected(generation, "keepalive failed");
                return;
            }
        }
    }
}

async fn reconnect_loop(weak: Weak<Shared>, token: CancellationToken) {
    loop {
        let Some(delay) = weak.upgrade().map(|s| s.config.reconnect_delay) else {
            return;
        };
        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(delay) => {}
        }
        let Some(shared) = weak.upgrade() else {
            return;
        };
        if token.is_cancelled() {
            return;
        }
        info!(
            "Reconnecting to {}:{}",
            shared.config.host, shared.config.port
        );
        match shared.open(true).await {
            Ok(()) => return,
            Err(Error::AlreadyConnected | Error::ConnectionClosed) => return,
            Err(Error::ConnectTimeout { host, port }) => {
                debug!("Reconnect to {}:{} timed out, retrying", host, port)
            }
            Err(e) => {
                warn!("Reconnect failed: {}", e);
                shared.emit_error(&e);
            }
        }
    }
}
