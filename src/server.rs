//! TLS accept loop and per-connection request/response cycle (server)
//!
//! Each accepted connection runs in its own task, which serializes every
//! read, handler call, and write on that stream. An idle timer is re-armed
//! before every read; on expiry the session is torn down cleanly.

use anyhow::{Context, Result};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use crate::handler::RequestHandler;
use crate::logger::{ConnRes, Logger};
use crate::message::Message;
use crate::protocol::{read_frame, write_frame, ErrType, MsgType};
use crate::session::UserSession;

/// A connection with no complete request for this long is evicted. Twice
/// the client's keepalive interval, so one missed probe is forgiven.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Server {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handler: Arc<RequestHandler>,
    logger: Arc<Logger>,
}

impl Server {
    /// Resolve and bind the listening endpoint.
    pub async fn bind(
        address: &str,
        service: &str,
        tls_config: rustls::ServerConfig,
        handler: Arc<RequestHandler>,
        logger: Arc<Logger>,
    ) -> Result<Self> {
        let addr = format!("{}:{}", address, service);
        let endpoint = addr
            .to_socket_addrs()
            .with_context(|| format!("resolve {}", addr))?
            .next()
            .with_context(|| format!("no endpoints for {}", addr))?;
        let listener = TcpListener::bind(endpoint)
            .await
            .with_context(|| format!("bind {}", endpoint))?;
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            handler,
            logger,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, one task per connection.
    pub async fn run(&self) -> Result<()> {
        loop {
            let (tcp, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    eprintln!("accept failed: {}", e);
                    continue;
                }
            };
            let acceptor = self.acceptor.clone();
            let handler = self.handler.clone();
            let logger = self.logger.clone();
            tokio::spawn(async move {
                handle_connection(acceptor, tcp, peer.ip().to_string(), handler, logger).await;
            });
        }
    }
}

async fn handle_connection(
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    ip: String,
    handler: Arc<RequestHandler>,
    logger: Arc<Logger>,
) {
    logger.event("", &ip, "Accepted connection");
    tcp.set_nodelay(true).ok();

    let mut stream = match timeout(IDLE_TIMEOUT, acceptor.accept(tcp)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            logger.event("", &ip, &format!("Handshake failed: {}", e));
            return;
        }
        Err(_) => {
            logger.event("", &ip, "Handshake timed out");
            return;
        }
    };

    let mut user = UserSession::new(ip);
    loop {
        let payload = match timeout(IDLE_TIMEOUT, read_frame(&mut stream)).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(_)) => {
                logger.request(user.username(), user.ip(), MsgType::None, ErrType::None, ConnRes::Err);
                break;
            }
            Err(_) => break, // idle timeout
        };
        let request = Message::from_raw(payload);
        let mut replies = handler.handle_request(&request, &mut user);
        let msg_type = replies.msg_type();
        let err_type = replies.err_type();

        let mut conn_res = ConnRes::Ok;
        while let Some(frame) = replies.pop_front() {
            if write_frame(&mut stream, frame.as_bytes()).await.is_err() {
                conn_res = ConnRes::Err;
                break;
            }
        }
        logger.request(user.username(), user.ip(), msg_type, err_type, conn_res);
        if conn_res == ConnRes::Err {
            break;
        }
    }

    // teardown: abandon any in-flight transfer and close the stream
    if !user.id().is_empty() {
        handler.streams().erase_stream(user.id());
    }
    logger.event(user.username(), user.ip(), "Shutdown");
    let _ = stream.shutdown().await;
}

/// Run the accept loop until interrupted by SIGINT/SIGTERM.
pub async fn run_until_shutdown(server: Server) -> Result<()> {
    let interrupted = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = signal(SignalKind::terminate())?;
            tokio::select! {
                r = tokio::signal::ctrl_c() => r.context("ctrl_c")?,
                _ = term.recv() => {}
            }
            Ok::<(), anyhow::Error>(())
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.context("ctrl_c")?;
            Ok::<(), anyhow::Error>(())
        }
    };
    tokio::select! {
        result = server.run() => result,
        result = interrupted => {
            result?;
            println!("shutting down");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_timeout_exceeds_client_keepalive_twofold() {
        assert_eq!(IDLE_TIMEOUT, crate::connection::KEEPALIVE_INTERVAL * 2);
    }

    #[test]
    fn malformed_bind_address_fails_resolution() {
        assert!("127.0.0.1:not-a-port".to_socket_addrs().is_err());
    }
}
