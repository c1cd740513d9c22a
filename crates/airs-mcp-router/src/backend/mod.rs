//! Backend client: owns one [`Transport`], correlates requests with
//! responses by ID, and demultiplexes notifications to subscribers.
//!
//! One `BackendClient` spawns exactly one reader task for the lifetime of its
//! transport. Everything else — `forward`, `notify`, `on_notification` — is
//! driven from caller tasks and talks to the reader only through the
//! `pending` map and the `done`/`err` signals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use reqwest::Url;
use tokio::sync::{broadcast, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{BackendError, TransportError};
use crate::protocol::{
    classify_value, initialize, methods, ClassifiedMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId,
};
use crate::registry::{ServerConfig, TransportKind};
use crate::transport::{HttpSseTransport, HttpSseTransportConfig, ProcessTransport, Transport};

type NotificationHandler = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;

/// One live backend connection: a started [`Transport`] plus the correlation
/// and fan-out state layered on top of it.
pub struct BackendClient {
    transport: Arc<dyn Transport>,
    pending: DashMap<RequestId, oneshot::Sender<JsonRpcResponse>>,
    notifications: RwLock<Vec<NotificationHandler>>,
    done_tx: broadcast::Sender<()>,
    err_rx: watch::Receiver<Option<BackendError>>,
    err_tx: watch::Sender<Option<BackendError>>,
    closed: AtomicBool,
    reader_task: AsyncMutex<Option<JoinHandle<()>>>,
    stderr_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl BackendClient {
    /// Spawn a `BackendClient` around an already-`start()`-ed transport. The
    /// reader task begins consuming `read()` frames immediately.
    pub fn spawn(transport: Arc<dyn Transport>) -> Arc<Self> {
        let (done_tx, _) = broadcast::channel(1);
        let (err_tx, err_rx) = watch::channel(None);

        let client = Arc::new(Self {
            transport,
            pending: DashMap::new(),
            notifications: RwLock::new(Vec::new()),
            done_tx,
            err_rx,
            err_tx,
            closed: AtomicBool::new(false),
            reader_task: AsyncMutex::new(None),
            stderr_task: AsyncMutex::new(None),
        });

        let reader_client = Arc::clone(&client);
        let handle = tokio::spawn(async move {
            reader_client.read_loop().await;
        });
        if let Ok(mut guard) = client.reader_task.try_lock() {
            *guard = Some(handle);
        }

        let stderr_client = Arc::clone(&client);
        let stderr_handle = tokio::spawn(async move {
            stderr_client.stderr_drain_loop().await;
        });
        if let Ok(mut guard) = client.stderr_task.try_lock() {
            *guard = Some(stderr_handle);
        }

        client
    }

    /// Drain the transport's stderr, one line at a time, until it reports
    /// none left (either the backend has no stderr channel, or it closed).
    /// Lines are logged, never surfaced to callers — this is diagnostic only.
    async fn stderr_drain_loop(self: Arc<Self>) {
        while let Some(line) = self.transport.recv_stderr_line().await {
            debug!(backend_stderr = %line, "backend stderr");
        }
    }

    async fn read_loop(self: Arc<Self>) {
        loop {
            let bytes = match self.transport.read().await {
                Ok(bytes) => bytes,
                Err(TransportError::Closed) => {
                    debug!("backend transport closed (eof)");
                    break;
                }
                Err(e) => {
                    warn!("backend transport read failed: {e}");
                    let _ = self.err_tx.send(Some(BackendError::from(e)));
                    break;
                }
            };

            let value: serde_json::Value = match serde_json::from_slice(&bytes) {
                Ok(v) => v,
                Err(e) => {
                    warn!("discarding malformed backend frame: {e}");
                    continue;
                }
            };

            match classify_value(value) {
                Ok(ClassifiedMessage::Notification(n)) => self.dispatch_notification(n),
                Ok(ClassifiedMessage::Response(r)) => self.dispatch_response(r),
                Ok(ClassifiedMessage::Request(r)) => {
                    warn!(method = %r.method, "backend sent a request frame, discarding");
                }
                Err(e) => warn!("discarding malformed backend frame: {e}"),
            }
        }
        let _ = self.done_tx.send(());
    }

    fn dispatch_response(&self, response: JsonRpcResponse) {
        let Some(id) = response.id else {
            warn!("response frame has no id, dropping as orphan");
            return;
        };
        match self.pending.remove(&id) {
            Some((_, sender)) => {
                let _ = sender.send(response);
            }
            None => warn!(request_id = %id, "orphan response, no pending waiter"),
        }
    }

    fn dispatch_notification(&self, notification: JsonRpcNotification) {
        let subscribers = match self.notifications.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for handler in subscribers.iter() {
            let handler = Arc::clone(handler);
            let notification = notification.clone();
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(notification)))
                .is_err()
            {
                warn!("notification subscriber panicked, continuing fan-out");
            }
        }
    }

    fn current_error(&self) -> Option<BackendError> {
        self.err_rx.borrow().clone()
    }

    fn is_terminal(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.current_error().is_some()
    }

    /// Register a notification subscriber. Subscribers are invoked serially,
    /// in registration order, for every notification the backend sends.
    pub fn on_notification<F>(&self, handler: F)
    where
        F: Fn(JsonRpcNotification) + Send + Sync + 'static,
    {
        let mut subscribers = match self.notifications.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.push(Arc::new(handler));
    }

    /// Send a JSON-RPC request and block until its correlated response
    /// arrives, the client closes, or the transport reports a fatal error.
    /// No timeout is imposed at this layer.
    pub async fn forward(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, BackendError> {
        if let Some(err) = self.current_error() {
            return Err(err);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }

        let id = request.id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let bytes = serde_json::to_vec(&request)
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
        if let Err(e) = self.transport.write(&bytes).await {
            self.pending.remove(&id);
            return Err(e.into());
        }

        let mut done_rx = self.done_tx.subscribe();
        let mut err_rx = self.err_rx.clone();

        let outcome = tokio::select! {
            biased;
            response = rx => response.map_err(|_| BackendError::WaiterDropped),
            _ = done_rx.recv() => Err(BackendError::Closed),
            Ok(()) = err_rx.changed() => {
                Err(err_rx.borrow().clone().unwrap_or(BackendError::Closed))
            }
        };

        self.pending.remove(&id);
        outcome
    }

    /// Send a JSON-RPC notification; no response is expected.
    pub async fn notify(&self, notification: JsonRpcNotification) -> Result<(), BackendError> {
        if self.is_terminal() {
            return Err(self.current_error().unwrap_or(BackendError::Closed));
        }
        let bytes = serde_json::to_vec(&notification)
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
        self.transport.write(&bytes).await?;
        Ok(())
    }

    /// Convenience wrapper: `initialize` request with id=0.
    pub async fn initialize(
        &self,
        params: initialize::InitializeParams,
    ) -> Result<initialize::InitializeResult, BackendError> {
        let params_value = serde_json::to_value(&params)
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
        let request = JsonRpcRequest::new(methods::INITIALIZE, Some(params_value), RequestId::new(0));
        let response = self.forward(request).await?;
        let result = response
            .result
            .ok_or_else(|| BackendError::MalformedResponse("initialize response missing result".into()))?;
        serde_json::from_value(result).map_err(|e| BackendError::MalformedResponse(e.to_string()))
    }

    /// Convenience wrapper: `notifications/initialized`.
    pub async fn notifications_initialized(&self) -> Result<(), BackendError> {
        self.notify(JsonRpcNotification::new(methods::NOTIFICATIONS_INITIALIZED, None))
            .await
    }

    /// Idempotent shutdown: broadcasts `done`, stops the transport, and
    /// quiesces the reader task before returning so no subscriber can fire
    /// against state the caller is about to tear down.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.done_tx.send(());
        if let Err(e) = self.transport.stop().await {
            warn!("error stopping backend transport: {e}");
        }
        if let Some(handle) = self.reader_task.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.stderr_task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// Build and start a fresh `BackendClient` for `config`.
pub async fn connect(config: &ServerConfig) -> Result<Arc<BackendClient>, BackendError> {
    let transport: Arc<dyn Transport> = match config.transport_kind {
        TransportKind::Process => {
            let command = config.command.clone().ok_or_else(|| {
                BackendError::Transport("process server config missing command".into())
            })?;
            let mut transport = ProcessTransport::new(command);
            transport.start().await?;
            Arc::new(transport)
        }
        TransportKind::Http => {
            let raw_url = config.server_url.clone().ok_or_else(|| {
                BackendError::Transport("http server config missing server_url".into())
            })?;
            let url = Url::parse(&raw_url)
                .map_err(|e| BackendError::Transport(format!("invalid server_url: {e}")))?;
            let mut transport = HttpSseTransport::new(url, HttpSseTransportConfig::default());
            transport.start().await?;
            Arc::new(transport)
        }
    };
    Ok(BackendClient::spawn(transport))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    /// In-memory transport: writes go to an observable channel, reads are
    /// fed by the test driving the "backend" side. `stop()` wakes a blocked
    /// `read()` via `Notify` rather than contending for the same mutex.
    struct MockTransport {
        outbound: StdMutex<mpsc::UnboundedSender<Vec<u8>>>,
        inbound: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        stopped: std::sync::atomic::AtomicBool,
        stop_notify: tokio::sync::Notify,
    }

    impl MockTransport {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>, mpsc::UnboundedSender<Vec<u8>>) {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let transport = Arc::new(Self {
                outbound: StdMutex::new(out_tx),
                inbound: AsyncMutex::new(in_rx),
                stopped: std::sync::atomic::AtomicBool::new(false),
                stop_notify: tokio::sync::Notify::new(),
            });
            (transport, out_rx, in_tx)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn start(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
            self.outbound
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .send(bytes.to_vec())
                .map_err(|_| TransportError::Closed)
        }

        async fn read(&self) -> Result<Vec<u8>, TransportError> {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            let mut guard = self.inbound.lock().await;
            tokio::select! {
                item = guard.recv() => item.ok_or(TransportError::Closed),
                _ = self.stop_notify.notified() => Err(TransportError::Closed),
            }
        }

        async fn stop(&self) -> Result<(), TransportError> {
            self.stopped.store(true, Ordering::SeqCst);
            self.stop_notify.notify_waiters();
            Ok(())
        }
    }

    fn request(id: i64) -> JsonRpcRequest {
        JsonRpcRequest::new("ping", Some(json!({"n": id})), RequestId::new(id))
    }

    fn response_bytes(id: i64) -> Vec<u8> {
        serde_json::to_vec(&JsonRpcResponse::success(json!({"pong": id}), RequestId::new(id)))
            .unwrap()
    }

    #[tokio::test]
    async fn correlates_concurrent_requests_regardless_of_reply_order() {
        let (transport, mut out_rx, in_tx) = MockTransport::new();
        let client = BackendClient::spawn(transport);

        // Echo backend: reverse the reply order relative to request order.
        let echo_client = Arc::clone(&client);
        let _ = &echo_client;
        tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..5 {
                let bytes = out_rx.recv().await.unwrap();
                let req: JsonRpcRequest = serde_json::from_slice(&bytes).unwrap();
                seen.push(req.id.0);
            }
            for id in seen.into_iter().rev() {
                in_tx.send(response_bytes(id)).unwrap();
            }
        });

        let mut handles = Vec::new();
        for id in 1..=5 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                let response = client.forward(request(id)).await.unwrap();
                assert_eq!(response.id, Some(RequestId::new(id)));
                assert_eq!(response.result.unwrap()["pong"], id);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn notification_reaches_all_subscribers_in_order() {
        let (transport, _out_rx, in_tx) = MockTransport::new();
        let client = BackendClient::spawn(transport);

        let order = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            client.on_notification(move |_| order.lock().unwrap().push(i));
        }

        let notification = JsonRpcNotification::new("notifications/progress", None);
        in_tx.send(serde_json::to_vec(&notification).unwrap()).unwrap();

        // Give the reader task a moment to dispatch.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn orphan_response_is_dropped_without_breaking_later_correlation() {
        let (transport, mut out_rx, in_tx) = MockTransport::new();
        let client = BackendClient::spawn(transport);

        // An orphan reply with no matching waiter.
        in_tx.send(response_bytes(999)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let client2 = Arc::clone(&client);
        tokio::spawn(async move {
            let bytes = out_rx.recv().await.unwrap();
            let req: JsonRpcRequest = serde_json::from_slice(&bytes).unwrap();
            let _ = &client2;
            in_tx.send(response_bytes(req.id.0)).unwrap();
        });

        let response = client.forward(request(7)).await.unwrap();
        assert_eq!(response.id, Some(RequestId::new(7)));
    }

    #[tokio::test]
    async fn close_fails_all_pending_waiters_promptly() {
        let (transport, _out_rx, _in_tx) = MockTransport::new();
        let client = BackendClient::spawn(transport);

        let mut handles = Vec::new();
        for id in 1..=4 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move { client.forward(request(id)).await }));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        client.close().await;

        let results = timeout(Duration::from_secs(2), async {
            let mut results = Vec::new();
            for handle in handles {
                results.push(handle.await.unwrap());
            }
            results
        })
        .await
        .expect("all waiters must resolve promptly on close");

        for result in results {
            assert!(matches!(result, Err(BackendError::Closed)));
        }
        assert_eq!(client.pending.len(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (transport, _out_rx, _in_tx) = MockTransport::new();
        let client = BackendClient::spawn(transport);
        client.close().await;
        client.close().await;
    }
}
