//! Client side of the TLS transport
//!
//! Wraps one TLS stream and exposes request/response posting. A response
//! may span several frames: each continuation frame repeats the message
//! type in its first byte, which is stripped before appending, and the
//! read loop stops once the accumulated buffer ends with an END record.

use anyhow::{bail, Context, Result};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::message::{verify_end_bytes, FileMessage, Message};
use crate::protocol::{read_frame, write_frame};
use crate::tls::server_name_for;

/// How long a silent connection may stay quiet before a keepalive probe.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Pause between connection attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of one posted request. Transport loss is its own variant so it
/// is never conflated with a server-side refusal.
#[derive(Debug)]
pub enum PostOutcome {
    Reply(Message),
    Denied,
    Disconnected,
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
    )
}

/// Send one message as a frame.
pub async fn send_message<S>(stream: &mut S, msg: &Message) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_frame(stream, msg.as_bytes()).await
}

/// Read frames until the accumulated payload terminates with an END
/// record. The first frame is kept whole; each continuation frame's
/// leading message-type byte is dropped so the concatenation carries a
/// single type byte up front.
pub async fn read_accumulated<S>(stream: &mut S) -> std::io::Result<Message>
where
    S: AsyncRead + Unpin,
{
    let mut buffer: Vec<u8> = Vec::new();
    loop {
        let payload = read_frame(stream).await?;
        if buffer.is_empty() {
            buffer.extend_from_slice(&payload);
        } else {
            buffer.extend_from_slice(&payload[1..]);
        }
        if verify_end_bytes(&buffer) {
            return Ok(Message::from_raw(buffer));
        }
    }
}

pub struct Connection {
    connector: TlsConnector,
    server_name: rustls::pki_types::ServerName<'static>,
    endpoints: Vec<SocketAddr>,
    stream: Option<TlsStream<TcpStream>>,
    keepalive_deadline: Instant,
    generation: u64,
}

impl Connection {
    pub fn new(config: rustls::ClientConfig, host: &str) -> Self {
        Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name: server_name_for(host),
            endpoints: Vec::new(),
            stream: None,
            keepalive_deadline: Instant::now() + KEEPALIVE_INTERVAL,
            generation: 0,
        }
    }

    /// Resolve the server's endpoints once, up front.
    pub fn resolve(&mut self, hostname: &str, service: &str) -> Result<()> {
        let addr = format!("{}:{}", hostname, service);
        self.endpoints = addr
            .to_socket_addrs()
            .with_context(|| format!("resolve {}", addr))?
            .collect();
        if self.endpoints.is_empty() {
            bail!("no endpoints for {}", addr);
        }
        Ok(())
    }

    /// Establish the TCP + TLS connection, retrying the endpoint list until
    /// a TCP connection succeeds. A failed handshake is a hard error.
    pub async fn connect(&mut self) -> Result<()> {
        let tcp = loop {
            let mut last_err = None;
            let mut connected = None;
            for addr in &self.endpoints {
                match TcpStream::connect(addr).await {
                    Ok(tcp) => {
                        connected = Some(tcp);
                        break;
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            if let Some(tcp) = connected {
                break tcp;
            }
            eprintln!(
                "failed to connect ({}), retrying...",
                last_err.map(|e| e.to_string()).unwrap_or_else(|| "no endpoints".into())
            );
            tokio::time::sleep(RECONNECT_INTERVAL).await;
        };
        tcp.set_nodelay(true).ok();
        let tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .context("TLS handshake failed")?;
        self.stream = Some(tls);
        self.generation += 1;
        self.reset_keepalive();
        Ok(())
    }

    /// Monotonic connection identity; bumped on every successful connect so
    /// concurrent waiters can tell whether someone already reconnected.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn keepalive_deadline(&self) -> Instant {
        self.keepalive_deadline
    }

    fn reset_keepalive(&mut self) {
        self.keepalive_deadline = Instant::now() + KEEPALIVE_INTERVAL;
    }

    fn on_lost(&mut self) {
        self.stream = None;
    }

    /// One request/response round trip. The keepalive deadline is re-armed
    /// only on a successful round trip.
    pub async fn post(&mut self, request: &Message) -> PostOutcome {
        let outcome = self.post_inner(request).await;
        if matches!(outcome, PostOutcome::Reply(_)) {
            self.reset_keepalive();
        }
        outcome
    }

    async fn post_inner(&mut self, request: &Message) -> PostOutcome {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return PostOutcome::Disconnected,
        };
        if let Err(e) = send_message(stream, request).await {
            if is_disconnect(&e) {
                self.on_lost();
                return PostOutcome::Disconnected;
            }
            eprintln!("error in write: {}", e);
            return PostOutcome::Denied;
        }
        match read_accumulated(stream).await {
            Ok(msg) => PostOutcome::Reply(msg),
            Err(e) if is_disconnect(&e) => {
                self.on_lost();
                PostOutcome::Disconnected
            }
            Err(e) => {
                eprintln!("error in read: {}", e);
                PostOutcome::Denied
            }
        }
    }

    /// Stream a file-chunked message: one write/read round trip per chunk,
    /// stopping early on transport failure. Returns the final chunk's
    /// reply.
    pub async fn post_file(&mut self, f_msg: &mut FileMessage) -> PostOutcome {
        let mut last = PostOutcome::Denied;
        loop {
            let chunk = match f_msg.next_chunk() {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return last,
                Err(e) => {
                    eprintln!("error reading file chunk: {}", e);
                    return PostOutcome::Denied;
                }
            };
            last = match self.post(&chunk).await {
                PostOutcome::Reply(msg) => PostOutcome::Reply(msg),
                other => return other,
            };
        }
    }
}
