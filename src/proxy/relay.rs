//! Local proxy auth relay
//!
//! Chrome's --proxy-server flag does not accept inline credentials, so
//! authenticated upstream proxies need a local hop: the browser talks to
//! 127.0.0.1 without auth, and the relay adds the Proxy-Authorization header
//! on the way to the upstream endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::ProxyEndpoint;

const MAX_HEADERS: usize = 100;
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One relay per pooled browser process with an authenticated proxy
pub struct ProxyAuthRelay {
    upstream: ProxyEndpoint,
    local_port: u16,
    running: Arc<AtomicBool>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ProxyAuthRelay {
    pub fn new(upstream: ProxyEndpoint) -> Self {
        Self {
            upstream,
            local_port: 0,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: None,
        }
    }

    /// Local proxy URL for the browser. Only valid after `start`.
    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_port)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn auth_header(&self) -> String {
        let credentials = format!("{}:{}", self.upstream.username, self.upstream.password);
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes());
        format!("Basic {}", encoded)
    }

    /// Bind an ephemeral local port and start relaying
    pub async fn start(&mut self) -> Result<(), std::io::Error> {
        if self.running.load(Ordering::Relaxed) {
            return Ok(());
        }

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        self.local_port = listener.local_addr()?.port();
        info!(
            "Proxy auth relay on 127.0.0.1:{} -> {}",
            self.local_port,
            self.upstream.key()
        );

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);
        self.running.store(true, Ordering::Relaxed);

        let running = self.running.clone();
        let upstream_addr = format!("{}:{}", self.upstream.host, self.upstream.port);
        let auth_header = self.auth_header();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        let upstream_addr = upstream_addr.clone();
                        let auth_header = auth_header.clone();
                        tokio::spawn(async move {
                            if let Err(e) = relay_connection(stream, &upstream_addr, &auth_header).await {
                                debug!("Relay connection ended: {}", e);
                            }
                        });
                    }
                }
            }
            running.store(false, Ordering::Relaxed);
        });

        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for ProxyAuthRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Forward one client connection to the upstream proxy with auth attached
async fn relay_connection(
    client: TcpStream,
    upstream_addr: &str,
    auth_header: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut client = BufReader::new(client);

    let mut request_line = String::new();
    if client.read_line(&mut request_line).await? == 0 {
        return Err("connection closed before request".into());
    }

    let mut headers = Vec::new();
    for _ in 0..MAX_HEADERS {
        let mut line = String::with_capacity(128);
        let n = client.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        headers.push(line);
    }

    let mut upstream = tokio::time::timeout(
        UPSTREAM_CONNECT_TIMEOUT,
        TcpStream::connect(upstream_addr),
    )
    .await
    .map_err(|_| format!("timeout connecting to upstream {}", upstream_addr))??;

    // Re-emit the request with Proxy-Authorization injected
    let mut request = String::new();
    request.push_str(&request_line);
    request.push_str(&format!("Proxy-Authorization: {}\r\n", auth_header));
    for header in &headers {
        request.push_str(header);
    }
    request.push_str("\r\n");
    upstream.write_all(request.as_bytes()).await?;
    upstream.flush().await?;

    let is_connect = request_line.starts_with("CONNECT");
    if is_connect {
        // Consume the upstream's CONNECT response before tunneling
        let mut upstream_reader = BufReader::new(&mut upstream);
        let mut response_line = String::new();
        upstream_reader.read_line(&mut response_line).await?;
        for _ in 0..MAX_HEADERS {
            let mut line = String::with_capacity(128);
            let n = upstream_reader.read_line(&mut line).await?;
            if n == 0 || line == "\r\n" || line == "\n" {
                break;
            }
        }
        let client_stream = client.get_mut();
        if response_line.contains("200") {
            client_stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            client_stream.flush().await?;
        } else {
            warn!("Upstream rejected CONNECT: {}", response_line.trim());
            client_stream.write_all(response_line.as_bytes()).await?;
            client_stream.write_all(b"\r\n").await?;
            return Err(format!("upstream rejected CONNECT: {}", response_line.trim()).into());
        }
    }

    // Tunnel both directions until either side closes
    let (mut client_read, mut client_write) = client.into_inner().into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let mut to_upstream = tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if upstream_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    let mut to_client = tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match upstream_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if client_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = &mut to_upstream => to_client.abort(),
        _ = &mut to_client => to_upstream.abort(),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_header_is_basic_base64() {
        let relay = ProxyAuthRelay::new(
            ProxyEndpoint::parse("proxy.example.com:8080:user:pass").unwrap(),
        );
        let header = relay.auth_header();
        assert!(header.starts_with("Basic "));
        // "user:pass" base64-encoded
        assert!(header.contains("dXNlcjpwYXNz"));
    }

    #[tokio::test]
    async fn relay_binds_an_ephemeral_port() {
        let mut relay = ProxyAuthRelay::new(
            ProxyEndpoint::parse("proxy.example.com:8080:user:pass").unwrap(),
        );
        relay.start().await.unwrap();
        assert!(relay.is_running());
        assert_ne!(relay.local_url(), "http://127.0.0.1:0");
        relay.stop();
    }
}
