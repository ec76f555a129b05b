//! TCP server speaking line-delimited JSON.

use futures::StreamExt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use super::service::{AdmissionResponse, AdmissionService};
use crate::error::Result;
use crate::ratelimit::{AdmissionEngine, QuotaStore};

/// Longest request line accepted by default, in bytes.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// TCP server for the admission service.
pub struct TcpServer<S: QuotaStore + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// The admission engine instance
    engine: Arc<AdmissionEngine<S>>,
    /// Longest request line before the connection is dropped
    max_line_length: usize,
}

impl<S: QuotaStore + 'static> TcpServer<S> {
    /// Create a new server for an engine.
    pub fn new(addr: SocketAddr, engine: Arc<AdmissionEngine<S>>) -> Self {
        Self {
            addr,
            engine,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }

    /// Override the longest accepted request line.
    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }

    /// Bind and serve until the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind admission server");
            e
        })?;
        serve_listener(
            listener,
            AdmissionService::new(self.engine),
            self.max_line_length,
            signal,
        )
        .await
    }
}

/// Serve connections from an already bound listener until `signal` resolves.
///
/// A connection sending a line longer than `max_line_length` bytes gets one
/// `ERROR` response and is closed.
pub async fn serve_listener<S, F>(
    listener: TcpListener,
    service: AdmissionService<S>,
    max_line_length: usize,
    signal: F,
) -> Result<()>
where
    S: QuotaStore + 'static,
    F: Future<Output = ()> + Send,
{
    info!(addr = %listener.local_addr()?, "Admission server listening");
    tokio::pin!(signal);

    loop {
        tokio::select! {
            _ = &mut signal => {
                info!("Admission server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Accepted connection");
                        let service = service.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, service, max_line_length).await {
                                warn!(peer = %peer, error = %e, "Connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }
}

async fn handle_connection<S: QuotaStore>(
    stream: TcpStream,
    service: AdmissionService<S>,
    max_line_length: usize,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(max_line_length));

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(max_line_length = max_line_length, "Request line too long, closing connection");
                let response = AdmissionResponse::Error {
                    message: format!("request line exceeds {} bytes", max_line_length),
                };
                let mut response = serde_json::to_string(&response)?;
                response.push('\n');
                writer.write_all(response.as_bytes()).await?;
                writer.shutdown().await?;
                return Ok(());
            }
            Err(LinesCodecError::Io(e)) => return Err(e.into()),
        };

        if line.trim().is_empty() {
            continue;
        }
        let mut response = service.handle_line(&line)?;
        response.push('\n');
        writer.write_all(response.as_bytes()).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{MemoryStore, RateLimit, Rule, RuleSet, TimeUnit};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::sync::oneshot;

    fn engine() -> Arc<AdmissionEngine<MemoryStore>> {
        let mut descriptors = crate::ratelimit::Descriptors::new();
        descriptors.insert("tier".to_string(), "free".to_string());
        let rule = Rule::new(
            "checkout",
            descriptors,
            RateLimit {
                unit: TimeUnit::Hour,
                requests_per_unit: 2,
            },
        );
        Arc::new(AdmissionEngine::new(RuleSet::new(vec![rule]), MemoryStore::new()))
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let _server = TcpServer::new(addr, engine());
    }

    #[tokio::test]
    async fn test_round_trip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let server = tokio::spawn(serve_listener(
            listener,
            AdmissionService::new(engine()),
            DEFAULT_MAX_LINE_LENGTH,
            async move {
                let _ = shutdown_rx.await;
            },
        ));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let request = "{\"domain\":\"checkout\",\"descriptors\":{\"tier\":\"free\"}}\n";
        let mut responses = Vec::new();
        for _ in 0..3 {
            writer.write_all(request.as_bytes()).await.unwrap();
            responses.push(lines.next_line().await.unwrap().unwrap());
        }

        assert_eq!(responses[0], r#"{"code":"OK","remaining":1}"#);
        assert_eq!(responses[1], r#"{"code":"OK","remaining":0}"#);
        assert!(responses[2].starts_with(r#"{"code":"OVER_LIMIT""#));

        shutdown_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_line_is_rejected_and_connection_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let server = tokio::spawn(serve_listener(
            listener,
            AdmissionService::new(engine()),
            1024,
            async move {
                let _ = shutdown_rx.await;
            },
        ));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        // No newline: the server must give up once it has buffered the limit.
        writer.write_all(&[b'a'; 2048]).await.unwrap();

        let response = lines.next_line().await.unwrap().unwrap();
        let response: AdmissionResponse = serde_json::from_str(&response).unwrap();
        assert!(matches!(
            response,
            AdmissionResponse::Error { ref message } if message.contains("1024")
        ));
        assert!(matches!(lines.next_line().await, Ok(None) | Err(_)));

        shutdown_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[test]
    fn test_max_line_length_override() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let server = TcpServer::new(addr, engine()).with_max_line_length(512);
        assert_eq!(server.max_line_length, 512);
    }
}
