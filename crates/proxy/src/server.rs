//! The main listener.
//!
//! Accepts TCP connections, optionally terminates TLS, and serves HTTP/1.1
//! and HTTP/2 through the composed handler chain. On cancellation it stops
//! accepting, asks open connections to finish, and waits for them to drain.

use http::Request;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::plugins::HandlerChain;
use crate::proxy::ClientAddr;
use crate::shutdown::ConnectionDrain;
use crate::tls::{self, CertificateSource};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for a client to finish the TLS handshake.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for a client to send complete request headers.
const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub struct Server {
    handler: HandlerChain,
    certificates: Option<Arc<dyn CertificateSource>>,
    drain: ConnectionDrain,
    shutdown_timeout: Duration,
    timeouts: ConnectionTimeouts,
}

#[derive(Debug, Clone, Copy)]
struct ConnectionTimeouts {
    handshake: Duration,
    header_read: Duration,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("tls", &self.certificates.is_some())
            .field("active_connections", &self.drain.active_count())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl Server {
    /// Server for `handler`; `certificates` of `None` serves cleartext.
    pub fn new(handler: HandlerChain, certificates: Option<Arc<dyn CertificateSource>>) -> Self {
        Self {
            handler,
            certificates,
            drain: ConnectionDrain::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            timeouts: ConnectionTimeouts {
                handshake: DEFAULT_HANDSHAKE_TIMEOUT,
                header_read: DEFAULT_HEADER_READ_TIMEOUT,
            },
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.handshake = timeout;
        self
    }

    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.header_read = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn drain(&self) -> ConnectionDrain {
        self.drain.clone()
    }

    /// Serve until `cancel` fires, then drain. Returns whether every
    /// connection closed within the shutdown timeout.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> bool {
        match listener.local_addr() {
            Ok(address) => info!(
                address = %address,
                tls = self.certificates.is_some(),
                "Listening"
            ),
            Err(e) => warn!(error = %e, "Listener has no local address"),
        }

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let guard = self.drain.track();
            let handler = self.handler.clone();
            let certificates = self.certificates.clone();
            let cancel = cancel.clone();
            let timeouts = self.timeouts;

            tokio::spawn(async move {
                let _guard = guard;
                let Some(source) = certificates else {
                    return serve_connection(stream, peer, handler, timeouts, cancel).await;
                };
                match tokio::time::timeout(timeouts.handshake, tls::accept(stream, source.as_ref())).await {
                    Ok(Ok(stream)) => serve_connection(stream, peer, handler, timeouts, cancel).await,
                    Ok(Err(e)) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                    Err(_) => debug!(peer = %peer, "TLS handshake timed out"),
                }
            });
        }

        info!("Stopped accepting connections");
        drop(listener);
        self.drain.wait_for_drain(self.shutdown_timeout).await
    }
}

async fn serve_connection<IO>(
    io: IO,
    peer: SocketAddr,
    handler: HandlerChain,
    timeouts: ConnectionTimeouts,
    cancel: CancellationToken,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let mut req = req.map(|body| body.boxed_unsync());
        req.extensions_mut().insert(ClientAddr(peer));
        handler.clone().oneshot(req)
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.header_read);
    let connection = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = cancel.cancelled() => {
            debug!(peer = %peer, "Closing connection for shutdown");
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        debug!(peer = %peer, error = %e, "Connection error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_helpers::text_response;
    use http::{Response, StatusCode};
    use std::convert::Infallible;

    fn echo_peer() -> HandlerChain {
        HandlerChain::new(tower::service_fn(|req: Request<crate::http_helpers::ProxyBody>| async move {
            let peer = req
                .extensions()
                .get::<ClientAddr>()
                .map(|addr| addr.0.ip().to_string())
                .unwrap_or_default();
            Ok::<Response<_>, Infallible>(text_response(StatusCode::OK, format!("{} {}", req.uri().path(), peer)))
        }))
    }

    /// Whether the server hung up within `within`.
    async fn closed_within(stream: &mut tokio::net::TcpStream, within: Duration) -> bool {
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 256];
        loop {
            match tokio::time::timeout(within, stream.read(&mut buf)).await {
                Err(_) => return false,
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                // e.g. an error status written before closing
                Ok(Ok(_)) => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_stalled_headers_are_dropped() {
        use tokio::io::AsyncWriteExt;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let server = Server::new(echo_peer(), None).with_header_read_timeout(Duration::from_millis(200));
        let drain = server.drain();
        tokio::spawn(server.serve(listener, cancel.clone()));

        let mut stream = tokio::net::TcpStream::connect(address).await.unwrap();
        stream.write_all(b"GET /chat HTTP/1.1\r\nHost: edge").await.unwrap();

        assert!(closed_within(&mut stream, Duration::from_secs(5)).await);
        assert!(drain.wait_for_drain(Duration::from_secs(5)).await);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_stalled_tls_handshake_is_dropped() {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["edge.example.com".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let certified = tls::certified_key_from_pem(cert.pem().as_bytes(), key.serialize_pem().as_bytes()).unwrap();
        let source: Arc<dyn CertificateSource> = Arc::new(tls::StaticCertificate::new(certified));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let server = Server::new(echo_peer(), Some(source)).with_handshake_timeout(Duration::from_millis(200));
        let drain = server.drain();
        tokio::spawn(server.serve(listener, cancel.clone()));

        // connect and never send a ClientHello
        let mut stream = tokio::net::TcpStream::connect(address).await.unwrap();
        assert!(closed_within(&mut stream, Duration::from_secs(5)).await);
        assert!(drain.wait_for_drain(Duration::from_secs(5)).await);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_serves_cleartext_and_drains() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let server = Server::new(echo_peer(), None).with_shutdown_timeout(Duration::from_secs(5));
        let task = tokio::spawn(server.serve(listener, cancel.clone()));

        let body = reqwest::get(format!("http://{address}/chat/messages"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "/chat/messages 127.0.0.1");

        cancel.cancel();
        let drained = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert!(drained);
    }
}
