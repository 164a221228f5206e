use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::oneshot;

use super::MetricsCollector;

/// Serves `/metrics` (Prometheus text) and `/metrics.json` from a dedicated
/// thread running a single-threaded tokio runtime.
pub struct MetricsServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    address: SocketAddr,
}

impl MetricsServer {
    pub fn start(listen: SocketAddr, collector: MetricsCollector) -> Result<Self> {
        let (tx, rx) = oneshot::channel::<()>();
        let (addr_tx, addr_rx) = mpsc::channel::<Result<SocketAddr, String>>();

        let thread = std::thread::Builder::new()
            .name("cytoflow-metrics".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = addr_tx.send(Err(format!("failed to build runtime: {err}")));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let make_svc = make_service_fn(move |_| {
                        let collector = collector.clone();
                        async move {
                            Ok::<_, hyper::Error>(service_fn(move |req| {
                                let collector = collector.clone();
                                async move { Ok::<_, hyper::Error>(handle_request(req, &collector)) }
                            }))
                        }
                    });

                    let builder = match hyper::Server::try_bind(&listen) {
                        Ok(builder) => builder,
                        Err(err) => {
                            let _ = addr_tx.send(Err(format!("failed to bind {listen}: {err}")));
                            return;
                        }
                    };
                    let _ = addr_tx.send(Ok(builder.local_addr()));
                    let server = builder.serve(make_svc).with_graceful_shutdown(async move {
                        let _ = rx.await;
                    });

                    if let Err(err) = server.await {
                        tracing::error!(error = %err, "Metrics server error");
                    }
                });
            })
            .context("Failed to spawn metrics server thread")?;

        let address = addr_rx
            .recv()
            .map_err(|_| anyhow!("Metrics server thread exited before binding"))?
            .map_err(|err| anyhow!(err))?;
        tracing::info!(%address, "Metrics server listening");

        Ok(Self {
            shutdown_tx: Some(tx),
            thread: Some(thread),
            address,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn respond(status: StatusCode, content_type: &str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn handle_request(req: Request<Body>, collector: &MetricsCollector) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4",
            collector.snapshot().to_prometheus(),
        ),
        (&Method::GET, "/metrics.json") => {
            let body = serde_json::to_vec(&collector.snapshot()).unwrap_or_else(|_| b"{}".to_vec());
            respond(StatusCode::OK, "application/json", body)
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}
