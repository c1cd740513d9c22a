//! Correlation throughput benchmarks: how fast `BackendClient` can pair
//! concurrent `forward()` calls with out-of-order replies over an in-memory
//! transport, isolating the `DashMap` correlation path from any real I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

use airs_mcp_router::backend::BackendClient;
use airs_mcp_router::error::TransportError;
use airs_mcp_router::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId};
use airs_mcp_router::transport::Transport;

/// Loopback transport: every write is immediately echoed back as a
/// `JsonRpcResponse` carrying the same id, so benchmarks measure correlation
/// overhead rather than any real backend's latency.
struct LoopbackTransport {
    outbound: AsyncMutex<mpsc::UnboundedSender<Vec<u8>>>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    stopped: AtomicBool,
    stop_notify: Notify,
}

impl LoopbackTransport {
    fn new() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                let Ok(request) = serde_json::from_slice::<JsonRpcRequest>(&bytes) else {
                    continue;
                };
                let response = JsonRpcResponse::success(json!({"echo": true}), request.id);
                if reply_tx.send(serde_json::to_vec(&response).unwrap()).is_err() {
                    break;
                }
            }
        });

        Arc::new(Self {
            outbound: AsyncMutex::new(tx),
            inbound: AsyncMutex::new(reply_rx),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
        })
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn start(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.outbound
            .lock()
            .await
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

fn create_runtime() -> Runtime {
    Runtime::new().expect("failed to create tokio runtime")
}

fn benchmark_single_roundtrip(c: &mut Criterion) {
    let rt = create_runtime();
    let mut group = c.benchmark_group("correlation_single_roundtrip");

    group.bench_function("forward_one", |b| {
        b.iter_batched(
            || rt.block_on(async { BackendClient::spawn(LoopbackTransport::new()) }),
            |client| {
                rt.block_on(async {
                    let request = JsonRpcRequest::new("ping", None, RequestId::new(1));
                    let response = client.forward(request).await.unwrap();
                    black_box(response);
                })
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn benchmark_concurrent_forward(c: &mut Criterion) {
    let rt = create_runtime();
    let mut group = c.benchmark_group("correlation_concurrent_forward");

    for concurrency in [1, 10, 50].iter() {
        group.bench_with_input(
            BenchmarkId::new("forward_many", concurrency),
            concurrency,
            |b, &count| {
                b.iter_batched(
                    || rt.block_on(async { BackendClient::spawn(LoopbackTransport::new()) }),
                    |client| {
                        rt.block_on(async {
                            let mut handles = Vec::with_capacity(count);
                            for id in 0..count {
                                let client = Arc::clone(&client);
                                handles.push(tokio::spawn(async move {
                                    let request = JsonRpcRequest::new("ping", None, RequestId::new(id as i64));
                                    client.forward(request).await.unwrap()
                                }));
                            }
                            for handle in handles {
                                black_box(handle.await.unwrap());
                            }
                        })
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, benchmark_single_roundtrip, benchmark_concurrent_forward);
criterion_main!(benches);
