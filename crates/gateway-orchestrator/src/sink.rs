//! Client event sink and the keep-alive task.
//!
//! The sink is a bounded channel to the client. Data events wait for
//! capacity, which is how a slow client applies back-pressure to the
//! backend stream. Keep-alives are best effort and never queue behind data.
//! Once the terminal event has been sent nothing else is accepted, so a
//! keep-alive can never follow `complete` or `error`.

use futures::stream::{BoxStream, StreamExt};
use gateway_core::{GatewayError, StreamEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Events delivered to the client, ending in exactly one terminal event
pub type EventStream = BoxStream<'static, StreamEvent>;

#[derive(Debug, Default)]
struct SinkState {
    terminated: bool,
}

/// Sending half of a request's event stream
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    state: Arc<Mutex<SinkState>>,
    activity: Arc<Notify>,
}

impl EventSink {
    /// Create a sink and the stream the client reads
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let sink = Self {
            tx,
            state: Arc::new(Mutex::new(SinkState::default())),
            activity: Arc::new(Notify::new()),
        };
        (sink, ReceiverStream::new(rx).boxed())
    }

    /// Send a non-terminal event, waiting for buffer space
    ///
    /// # Errors
    /// `ClientDisconnected` when the client stream was dropped
    pub async fn send(&self, event: StreamEvent) -> Result<(), GatewayError> {
        if self.state.lock().terminated {
            return Err(GatewayError::internal("event sent after terminal event"));
        }
        self.tx
            .send(event)
            .await
            .map_err(|_| GatewayError::ClientDisconnected)?;
        self.activity.notify_one();
        Ok(())
    }

    /// Send a keep-alive if there is room; a full buffer already keeps the
    /// connection busy
    ///
    /// # Errors
    /// `ClientDisconnected` when the client stream was dropped
    pub fn keep_alive(&self) -> Result<(), GatewayError> {
        let state = self.state.lock();
        if state.terminated {
            return Ok(());
        }
        match self.tx.try_send(StreamEvent::KeepAlive) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(GatewayError::ClientDisconnected),
        }
    }

    /// Send the terminal event; later sends are refused
    ///
    /// # Errors
    /// `ClientDisconnected` when the client stream was dropped
    pub async fn finish(&self, event: StreamEvent) -> Result<(), GatewayError> {
        {
            let mut state = self.state.lock();
            if state.terminated {
                return Err(GatewayError::internal("second terminal event"));
            }
            state.terminated = true;
        }
        self.tx
            .send(event)
            .await
            .map_err(|_| GatewayError::ClientDisconnected)
    }

    /// Whether the client stream was dropped
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the client stream is dropped
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    /// Start emitting keep-alives after `interval` without data
    #[must_use]
    pub fn spawn_keepalive(&self, interval: Duration) -> KeepAliveTask {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let sink = self.clone();
        let interval = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    () = sink.activity.notified() => {}
                    () = tokio::time::sleep(interval) => {
                        if sink.keep_alive().is_err() {
                            debug!("Client gone, keep-alive stopped");
                            break;
                        }
                    }
                }
            }
        });

        KeepAliveTask {
            token,
            handle: Some(handle),
        }
    }
}

/// Handle to a running keep-alive task; dropping it stops the task
#[derive(Debug)]
pub struct KeepAliveTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl KeepAliveTask {
    /// Stop the task and wait for it to exit
    pub async fn cancel(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for KeepAliveTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
