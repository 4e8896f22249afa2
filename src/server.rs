//! DNS listener and per-query handling.
//!
//! [`QueryHandler`] holds the protocol logic (classify, synthesize, forward),
//! separated from the sockets for testing. [`DnsServer`] owns the listening
//! sockets and answers every datagram from its own task so a slow upstream
//! never stalls sibling queries.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};

use crate::blocklist::BlocklistSource;
use crate::dns::matcher::{self, DomainMatcher};
use crate::dns::DnsResolver;
use crate::error::{Error, NetworkError, Result};
use crate::metrics::{
    MALFORMED_QUERIES_TOTAL, QUERIES_BLOCKED_TOTAL, QUERIES_TOTAL, UPSTREAMS_EXHAUSTED_TOTAL,
};

/// Largest datagram read from a client.
const MAX_QUERY_SIZE: usize = 4096;

/// Idle TCP connections are closed after this long.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// DNS query handler: blocklist lookup, then block reply or forward.
pub struct QueryHandler<L, R>
where
    L: BlocklistSource,
    R: DnsResolver,
{
    blocklist: Arc<L>,
    resolver: R,
    matcher: Arc<DomainMatcher>,
}

impl<L, R> QueryHandler<L, R>
where
    L: BlocklistSource,
    R: DnsResolver,
{
    pub fn new(blocklist: L, resolver: R, matcher: DomainMatcher) -> Self {
        Self::with_shared_blocklist(Arc::new(blocklist), resolver, matcher)
    }

    pub fn with_shared_blocklist(blocklist: Arc<L>, resolver: R, matcher: DomainMatcher) -> Self {
        Self {
            blocklist,
            resolver,
            matcher: Arc::new(matcher),
        }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Answer one wire-format query.
    ///
    /// Exactly one reply is produced per well-formed query: the synthesized
    /// block reply, the upstream reply verbatim, or an empty reply when every
    /// upstream failed. Unparseable input yields [`Error::MalformedQuery`].
    #[instrument(skip(self, packet), fields(domain))]
    pub async fn handle_packet(&self, packet: &[u8]) -> Result<Vec<u8>> {
        metrics::counter!(QUERIES_TOTAL).increment(1);

        let query = match Message::from_bytes(packet) {
            Ok(query) if query.message_type() == MessageType::Query => query,
            _ => {
                metrics::counter!(MALFORMED_QUERIES_TOTAL).increment(1);
                return Err(Error::MalformedQuery);
            }
        };
        let Some(question) = query.queries().first() else {
            metrics::counter!(MALFORMED_QUERIES_TOTAL).increment(1);
            return Err(Error::MalformedQuery);
        };

        let domain = self.matcher.normalize(&question.name().to_utf8());
        tracing::Span::current().record("domain", domain.as_str());

        let blocked = self.blocklist.load().await;
        let decision = self
            .matcher
            .classify(&domain, question.query_type(), &blocked);

        if decision.is_blocked() {
            metrics::counter!(QUERIES_BLOCKED_TOTAL).increment(1);
            info!(%domain, "blocked");
            return Ok(matcher::blocked_response(&query, decision).to_bytes()?);
        }

        match self.resolver.resolve(packet).await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                metrics::counter!(UPSTREAMS_EXHAUSTED_TOTAL).increment(1);
                warn!(%domain, "forwarding failed: {err}");
                Ok(matcher::empty_response(&query).to_bytes()?)
            }
        }
    }
}

impl<L, R> Clone for QueryHandler<L, R>
where
    L: BlocklistSource,
    R: DnsResolver,
{
    fn clone(&self) -> Self {
        Self {
            blocklist: Arc::clone(&self.blocklist),
            resolver: self.resolver.clone(),
            matcher: Arc::clone(&self.matcher),
        }
    }
}

/// A listening DNS server.
///
/// Dropping the value without calling [`stop`](Self::stop) leaves the
/// listener tasks running until the runtime shuts down.
pub struct DnsServer {
    local_addrs: Vec<SocketAddr>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DnsServer {
    /// Bind every address and start answering.
    ///
    /// Addresses that fail to bind are logged and skipped; at least one UDP
    /// socket must bind.
    pub async fn bind<L, R>(
        addrs: &[SocketAddr],
        tcp: bool,
        handler: QueryHandler<L, R>,
    ) -> Result<Self>
    where
        L: BlocklistSource,
        R: DnsResolver,
    {
        let (shutdown, _) = watch::channel(false);
        let mut local_addrs = Vec::with_capacity(addrs.len());
        let mut tasks = Vec::new();

        for addr in addrs {
            let socket = match UdpSocket::bind(addr).await {
                Ok(socket) => socket,
                Err(err) => {
                    warn!(%addr, "failed to bind UDP listener: {err}");
                    continue;
                }
            };
            let local_addr = socket.local_addr()?;
            local_addrs.push(local_addr);
            info!(addr = %local_addr, "listening on UDP");
            tasks.push(tokio::spawn(serve_udp(
                socket,
                handler.clone(),
                shutdown.subscribe(),
            )));

            if tcp {
                match TcpListener::bind(local_addr).await {
                    Ok(listener) => {
                        info!(addr = %local_addr, "listening on TCP");
                        tasks.push(tokio::spawn(serve_tcp(
                            listener,
                            handler.clone(),
                            shutdown.subscribe(),
                        )));
                    }
                    Err(err) => warn!(addr = %local_addr, "failed to bind TCP listener: {err}"),
                }
            }
        }

        if local_addrs.is_empty() {
            return Err(NetworkError::NoListener.into());
        }

        Ok(Self {
            local_addrs,
            shutdown,
            tasks,
        })
    }

    /// Bound UDP addresses (with the actual port when 0 was requested).
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Stop listening.
    ///
    /// When this returns every socket is closed and in-flight handlers have
    /// been cancelled, so no further replies are sent.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!("listener task failed: {err}");
            }
        }
        info!("DNS listener stopped");
    }
}

async fn serve_udp<L, R>(
    socket: UdpSocket,
    handler: QueryHandler<L, R>,
    mut shutdown: watch::Receiver<bool>,
) where
    L: BlocklistSource,
    R: DnsResolver,
{
    let socket = Arc::new(socket);
    let mut handlers = JoinSet::new();
    let mut buf = vec![0u8; MAX_QUERY_SIZE];

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(err) => {
                        debug!("UDP receive failed: {err}");
                        continue;
                    }
                };
                let packet = buf[..len].to_vec();
                let handler = handler.clone();
                let socket = Arc::clone(&socket);
                handlers.spawn(async move {
                    match handler.handle_packet(&packet).await {
                        Ok(reply) => {
                            if let Err(err) = socket.send_to(&reply, peer).await {
                                warn!(%peer, "failed to send reply: {err}");
                            }
                        }
                        Err(err) => debug!(%peer, "dropping query: {err}"),
                    }
                });
            }
        }
    }

    // handlers hold clones of the socket: cancel them so it closes here
    handlers.shutdown().await;
}

async fn serve_tcp<L, R>(
    listener: TcpListener,
    handler: QueryHandler<L, R>,
    mut shutdown: watch::Receiver<bool>,
) where
    L: BlocklistSource,
    R: DnsResolver,
{
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        debug!("TCP accept failed: {err}");
                        continue;
                    }
                };
                let handler = handler.clone();
                connections.spawn(async move {
                    if let Err(err) = serve_tcp_connection(stream, &handler).await {
                        debug!(%peer, "TCP connection closed: {err}");
                    }
                });
            }
        }
    }

    connections.shutdown().await;
}

/// Length-prefixed queries on one connection until the peer goes quiet.
async fn serve_tcp_connection<L, R>(
    mut stream: TcpStream,
    handler: &QueryHandler<L, R>,
) -> Result<()>
where
    L: BlocklistSource,
    R: DnsResolver,
{
    loop {
        let len = match tokio::time::timeout(TCP_IDLE_TIMEOUT, stream.read_u16()).await {
            Ok(Ok(len)) => usize::from(len),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Ok(()),
        };

        let mut packet = vec![0u8; len];
        stream.read_exact(&mut packet).await?;

        // a malformed message ends the connection, there is no reply to frame
        let reply = handler.handle_packet(&packet).await?;
        let reply_len = u16::try_from(reply.len()).map_err(|_| Error::MalformedQuery)?;
        stream.write_u16(reply_len).await?;
        stream.write_all(&reply).await?;
    }
}
