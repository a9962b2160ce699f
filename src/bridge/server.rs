//! HTTP listener feeding requests into the bridge handler

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::handler::BridgeHandler;

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts HTTP/1.1 connections and serves them with a [`BridgeHandler`]
pub struct HttpServer {
    listener: TcpListener,
    handler: Arc<BridgeHandler>,
}

impl HttpServer {
    /// Bind the listener. Failing here is fatal for the process.
    pub async fn bind(addr: SocketAddr, handler: BridgeHandler) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` resolves, then stop accepting and wait for
    /// open connections to finish their current request.
    pub async fn run<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Listening on http://{}", self.listener.local_addr()?);

        let (stop_tx, stop_rx) = watch::channel(false);
        // Every connection task holds a clone; recv() returns None once all are gone
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);

                    let handler = self.handler.clone();
                    let mut stop_rx = stop_rx.clone();
                    let done_tx = done_tx.clone();

                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let handler = handler.clone();
                            async move { Ok::<_, Infallible>(handler.handle(req).await) }
                        });

                        let conn = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service);
                        tokio::pin!(conn);

                        let result = tokio::select! {
                            result = conn.as_mut() => result,
                            _ = stop_rx.changed() => {
                                conn.as_mut().graceful_shutdown();
                                conn.await
                            }
                        };

                        if let Err(e) = result {
                            debug!("Error serving connection from {}: {}", peer, e);
                        }
                        drop(done_tx);
                    });
                }
                _ = &mut shutdown => break,
            }
        }

        info!("HTTP server shutting down");
        drop(self.listener);
        let _ = stop_tx.send(true);
        drop(done_tx);
        let _ = done_rx.recv().await;
        Ok(())
    }
}
