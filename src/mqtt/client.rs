//! Broker client handle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::connection::{Command, ConnectionTask};
use super::transport;
use super::{ClientOptions, ConnectError, ConnectionStatus, PublishError, Publisher};
use crate::metrics::Metrics;
use crate::protocol::{Publish, QoS};

/// Capacity of the command channel between handles and the connection task
const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Handle to the single broker connection.
///
/// Cheap to share behind an `Arc`; all socket work happens on the
/// connection task spawned by [`BrokerClient::connect`].
pub struct BrokerClient {
    options: Arc<ClientOptions>,
    status: Arc<RwLock<ConnectionStatus>>,
    command_tx: mpsc::Sender<Command>,
    /// Taken by `connect()`
    command_rx: Mutex<Option<mpsc::Receiver<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    metrics: Option<Arc<Metrics>>,
}

impl BrokerClient {
    pub fn new(options: ClientOptions) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        Self {
            options: Arc::new(options),
            status: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            task: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Start the connection task and wait for the first connection attempt.
    ///
    /// With `connect_retry` a failed first attempt is logged and retried in
    /// the background and this returns `Ok`; without it the failure is
    /// returned. Later connection losses are always retried while
    /// `auto_reconnect` is set.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let tls = if self.options.addr.tls {
            Some(transport::build_connector(&self.options.tls)?)
        } else {
            None
        };

        let commands = self
            .command_rx
            .lock()
            .take()
            .ok_or(ConnectError::AlreadyStarted)?;

        let task = ConnectionTask {
            options: self.options.clone(),
            status: self.status.clone(),
            tls,
            metrics: self.metrics.clone(),
        };

        let (first_tx, first_rx) = oneshot::channel();
        let handle = tokio::spawn(task.run(commands, first_tx));
        *self.task.lock() = Some(handle);

        first_rx.await.unwrap_or(Err(ConnectError::Closed))
    }

    /// Flush in-flight publishes for at most `grace`, then send DISCONNECT
    /// and close the connection. Publishes still unacknowledged fail with
    /// `ShuttingDown`.
    pub async fn disconnect(&self, grace: Duration) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Disconnecting from {}", self.options.addr);

        let (done_tx, done_rx) = oneshot::channel();
        let request = Command::Disconnect {
            grace,
            done: done_tx,
        };
        if self.command_tx.send(request).await.is_ok() {
            // Allow for the DISCONNECT write on top of the grace period
            let limit = grace + Duration::from_secs(1);
            if timeout(limit, done_rx).await.is_err() {
                warn!("Disconnect did not complete within {:?}", limit);
            }
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            if !task.is_finished() {
                debug!("Aborting connection task");
                task.abort();
            }
        }
        *self.status.write() = ConnectionStatus::Disconnected;
    }

    fn closed_error(&self) -> PublishError {
        if self.shutting_down.load(Ordering::Acquire) {
            PublishError::ShuttingDown
        } else {
            PublishError::ConnectionLost
        }
    }

    async fn send_and_wait(&self, publish: Publish) -> Result<(), PublishError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Publish {
                publish,
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.closed_error())?;

        reply_rx.await.unwrap_or_else(|_| Err(self.closed_error()))
    }
}

#[async_trait]
impl Publisher for BrokerClient {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), PublishError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(PublishError::ShuttingDown);
        }
        if self.status() != ConnectionStatus::Connected {
            return Err(PublishError::NotConnected);
        }

        let publish = Publish {
            qos,
            retain,
            topic: topic.to_string(),
            payload,
            ..Default::default()
        };

        match self.options.publish_timeout {
            Some(limit) => timeout(limit, self.send_and_wait(publish))
                .await
                .map_err(|_| PublishError::Timeout)?,
            None => self.send_and_wait(publish).await,
        }
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
