//! Event channel multiplexer.
//!
//! [`EventMultiplexer`] owns the single ComfyUI event connection of the
//! process. A dispatch task reads frames, normalizes them into
//! [`JobEvent`]s and forwards each one to the subscription registered for
//! its prompt id. The subscription map lives inside the dispatch task;
//! [`EventMultiplexer::subscribe`] and [`Subscription::close`] only send
//! commands to it.
//!
//! When the connection drops, every live subscription receives
//! [`JobEvent::ConnectionLost`] and is discarded, then the task reconnects
//! with exponential backoff under the same client id.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use relay_core::job::JobEvent;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{EventConnector, FrameStream};
use crate::events::RoutedEvent;
use crate::messages::parse_message;
use crate::reconnect::{Backoff, ReconnectConfig};

/// How long [`EventMultiplexer::shutdown`] waits for the dispatch task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

enum Command {
    Subscribe {
        prompt_id: String,
        token: u64,
        tx: mpsc::UnboundedSender<JobEvent>,
    },
    Unsubscribe {
        prompt_id: String,
        token: u64,
    },
}

/// Handle to the dispatch task. Cheap to share behind an `Arc`.
pub struct EventMultiplexer {
    client_id: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_token: AtomicU64,
    connected: watch::Receiver<bool>,
    queue_remaining: watch::Receiver<Option<u32>>,
    active: Arc<AtomicUsize>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventMultiplexer {
    /// Spawn the dispatch task. It connects immediately and keeps
    /// reconnecting until [`shutdown`](Self::shutdown) is called.
    pub fn start<C: EventConnector>(
        connector: C,
        client_id: impl Into<String>,
        reconnect: ReconnectConfig,
    ) -> Arc<Self> {
        let client_id = client_id.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected) = watch::channel(false);
        let (queue_tx, queue_remaining) = watch::channel(None);
        let active = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let dispatcher = Dispatcher {
            connector: Arc::new(connector),
            cmd_rx,
            subscriptions: HashMap::new(),
            executing: None,
            connected: false,
            connected_tx,
            queue_tx,
            active: Arc::clone(&active),
            cancel: cancel.clone(),
            backoff: Backoff::new(reconnect),
        };

        let task_client_id = client_id.clone();
        let task = tokio::spawn(async move {
            tracing::info!(client_id = %task_client_id, "Starting event dispatch task");
            dispatcher.run().await;
            tracing::info!(client_id = %task_client_id, "Event dispatch task exited");
        });

        Arc::new(Self {
            client_id,
            cmd_tx,
            next_token: AtomicU64::new(1),
            connected,
            queue_remaining,
            active,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Client id the event connection is registered under.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Register interest in `prompt_id`.
    ///
    /// Must be called before the prompt is submitted so that no event is
    /// missed. If the connection is down (or the multiplexer has shut
    /// down) the subscription immediately yields
    /// [`JobEvent::ConnectionLost`].
    pub fn subscribe(&self, prompt_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let command = Command::Subscribe {
            prompt_id: prompt_id.to_string(),
            token,
            tx,
        };
        if let Err(mpsc::error::SendError(Command::Subscribe { tx, .. })) =
            self.cmd_tx.send(command)
        {
            let _ = tx.send(JobEvent::ConnectionLost);
        }

        Subscription {
            prompt_id: prompt_id.to_string(),
            token,
            rx,
            cmd_tx: Some(self.cmd_tx.clone()),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the event connection is up. Returns `false` on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.connected.clone();
        let up = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|up| *up)).await,
            Ok(Ok(_))
        );
        up
    }

    /// Last queue depth broadcast by the backend, if any was seen.
    pub fn queue_remaining(&self) -> Option<u32> {
        *self.queue_remaining.borrow()
    }

    /// Number of subscriptions currently registered with the dispatch task.
    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Stop the dispatch task. Live subscriptions receive
    /// [`JobEvent::ConnectionLost`].
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down event multiplexer");
        self.cancel.cancel();

        if let Some(task) = self.task.lock().await.take() {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Ordered event feed for one prompt.
///
/// Deregisters from the dispatch task exactly once, either through
/// [`close`](Self::close) or on drop.
pub struct Subscription {
    prompt_id: String,
    token: u64,
    rx: mpsc::UnboundedReceiver<JobEvent>,
    cmd_tx: Option<mpsc::UnboundedSender<Command>>,
}

impl Subscription {
    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    /// Next event in backend emission order. `None` once the dispatch
    /// task has released this subscription.
    pub async fn next(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    /// Deregister. Returns `true` only for the call that actually sent
    /// the unsubscribe command.
    pub fn close(&mut self) -> bool {
        let Some(cmd_tx) = self.cmd_tx.take() else {
            return false;
        };
        let _ = cmd_tx.send(Command::Unsubscribe {
            prompt_id: self.prompt_id.clone(),
            token: self.token,
        });
        true
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Dispatch task
// ---------------------------------------------------------------------------

struct Subscriber {
    token: u64,
    tx: mpsc::UnboundedSender<JobEvent>,
}

struct Dispatcher<C> {
    connector: Arc<C>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    subscriptions: HashMap<String, Subscriber>,
    /// Prompt most recently reported as executing; receives untagged
    /// progress frames from older servers.
    executing: Option<String>,
    connected: bool,
    connected_tx: watch::Sender<bool>,
    queue_tx: watch::Sender<Option<u32>>,
    active: Arc<AtomicUsize>,
    cancel: CancellationToken,
    backoff: Backoff,
}

impl<C: EventConnector> Dispatcher<C> {
    async fn run(mut self) {
        'session: loop {
            let Some(mut frames) = self.connect().await else {
                break 'session;
            };
            self.set_connected(true);

            // Commands first: a subscription sent before a submission must
            // be registered before any frame of that prompt is handled.
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break 'session,
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => break 'session,
                    },
                    frame = frames.next() => match frame {
                        Some(text) => self.dispatch_text(&text),
                        None => break,
                    },
                }
            }

            tracing::warn!(
                subscriptions = self.subscriptions.len(),
                "ComfyUI event connection lost, reconnecting",
            );
            self.set_connected(false);
            self.fail_all();
        }

        self.set_connected(false);
        self.fail_all();
    }

    /// Connect with backoff while still serving commands.
    ///
    /// Returns `None` when cancelled or when every handle is gone.
    async fn connect(&mut self) -> Option<FrameStream> {
        loop {
            let connector = Arc::clone(&self.connector);
            let attempt = self
                .serve_commands_until(async move { connector.connect().await })
                .await?;

            match attempt {
                Ok(frames) => {
                    if self.backoff.attempt() > 0 {
                        tracing::info!(
                            attempts = self.backoff.attempt(),
                            "Reconnected to ComfyUI event stream",
                        );
                    }
                    self.backoff.reset();
                    return Some(frames);
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    tracing::warn!(
                        attempt = self.backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "ComfyUI event connection attempt failed",
                    );
                    self.serve_commands_until(tokio::time::sleep(delay))
                        .await?;
                }
            }
        }
    }

    async fn serve_commands_until<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => return None,
                },
                out = &mut fut => return Some(out),
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe {
                prompt_id,
                token,
                tx,
            } => {
                if !self.connected {
                    tracing::debug!(prompt_id = %prompt_id, "Subscription rejected: not connected");
                    let _ = tx.send(JobEvent::ConnectionLost);
                    return;
                }
                let replaced = self
                    .subscriptions
                    .insert(prompt_id.clone(), Subscriber { token, tx });
                if replaced.is_some() {
                    tracing::warn!(prompt_id = %prompt_id, "Replaced existing subscription");
                }
                tracing::debug!(prompt_id = %prompt_id, "Subscribed");
            }
            Command::Unsubscribe { prompt_id, token } => {
                let owned = self
                    .subscriptions
                    .get(&prompt_id)
                    .is_some_and(|s| s.token == token);
                if owned {
                    self.subscriptions.remove(&prompt_id);
                    tracing::debug!(prompt_id = %prompt_id, "Unsubscribed");
                }
            }
        }
        self.publish_active();
    }

    fn dispatch_text(&mut self, text: &str) {
        let msg = match parse_message(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(error = %e, raw_message = %text, "Skipping unrecognized ComfyUI message");
                return;
            }
        };
        let RoutedEvent { prompt_id, event } = msg.into();

        if let JobEvent::Status { queue_remaining } = event {
            tracing::debug!(queue_remaining, "ComfyUI queue status");
            self.queue_tx.send_replace(Some(queue_remaining));
            return;
        }

        let Some(prompt_id) = prompt_id.or_else(|| self.executing.clone()) else {
            tracing::trace!(?event, "Dropping untagged event outside any execution");
            return;
        };

        match &event {
            JobEvent::Started | JobEvent::Executing { .. } => {
                self.executing = Some(prompt_id.clone());
            }
            e if e.is_terminal() && self.executing.as_deref() == Some(prompt_id.as_str()) => {
                self.executing = None;
            }
            _ => {}
        }

        self.deliver(&prompt_id, event);
    }

    fn deliver(&mut self, prompt_id: &str, event: JobEvent) {
        let Some(subscriber) = self.subscriptions.get(prompt_id) else {
            tracing::trace!(prompt_id, "No subscriber, dropping event");
            return;
        };
        if subscriber.tx.send(event).is_err() {
            self.subscriptions.remove(prompt_id);
            self.publish_active();
        }
    }

    fn fail_all(&mut self) {
        for (prompt_id, subscriber) in self.subscriptions.drain() {
            tracing::debug!(prompt_id = %prompt_id, "Failing subscription: connection lost");
            let _ = subscriber.tx.send(JobEvent::ConnectionLost);
        }
        self.executing = None;
        self.publish_active();
    }

    fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        self.connected_tx.send_replace(connected);
    }

    fn publish_active(&self) {
        self.active.store(self.subscriptions.len(), Ordering::Relaxed);
    }
}
