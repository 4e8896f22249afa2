//! Forwarding of unblocked queries to upstream resolvers.
//!
//! Provides abstraction over resolution to enable:
//! - Testing with mock resolvers
//! - Failover across an ordered list of upstreams

use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics::UPSTREAM_TIMEOUTS_TOTAL;

/// Largest reply accepted from an upstream.
pub const MAX_UPSTREAM_REPLY_SIZE: usize = 4096;

/// Default per-upstream read timeout.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(3);

/// Trait for forwarding a raw wire-format query.
///
/// Implementations return the upstream reply verbatim.
pub trait DnsResolver: Send + Sync + Clone + 'static {
    fn resolve(&self, query: &[u8]) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Forwards over UDP to an ordered list of upstreams, first answer wins.
#[derive(Clone, Debug)]
pub struct UpstreamResolver {
    upstreams: Arc<[SocketAddr]>,
    timeout: Duration,
}

impl UpstreamResolver {
    /// Create a resolver; an empty list falls back to `fallback`.
    pub fn new(upstreams: Vec<SocketAddr>, fallback: SocketAddr) -> Self {
        let upstreams = if upstreams.is_empty() {
            vec![fallback]
        } else {
            upstreams
        };
        Self {
            upstreams: upstreams.into(),
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn upstreams(&self) -> &[SocketAddr] {
        &self.upstreams
    }

    /// Send the query to one upstream and wait for the reply carrying the same ID.
    ///
    /// The socket is owned by this call and released on every return path.
    async fn exchange(&self, upstream: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
        let bind_addr: SocketAddr = if upstream.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(upstream).await?;
        socket.send(query).await?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; MAX_UPSTREAM_REPLY_SIZE];
        loop {
            let len = timeout_at(deadline, socket.recv(&mut buf))
                .await
                .map_err(|_| Error::UpstreamTimeout { upstream })??;

            if len >= 2 && query.len() >= 2 && buf[..2] == query[..2] {
                buf.truncate(len);
                return Ok(buf);
            }
            debug!(%upstream, "ignoring reply with mismatched id");
        }
    }
}

impl DnsResolver for UpstreamResolver {
    async fn resolve(&self, query: &[u8]) -> Result<Vec<u8>> {
        for &upstream in self.upstreams.iter() {
            match self.exchange(upstream, query).await {
                Ok(reply) => return Ok(reply),
                Err(Error::UpstreamTimeout { upstream }) => {
                    metrics::counter!(UPSTREAM_TIMEOUTS_TOTAL).increment(1);
                    warn!(%upstream, "upstream resolver timed out");
                }
                Err(err) => {
                    warn!(%upstream, "upstream resolver failed: {err}");
                }
            }
        }
        Err(Error::UpstreamsExhausted)
    }
}
