//! Gateway lifecycle: the listener and the host override, started and
//! stopped together.
//!
//! The persisted runtime state records whether the gateway was last
//! intentionally active, so the next launch can redrive it.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::blocklist::BlocklistSource;
use crate::config::Config;
use crate::dns::{DomainMatcher, UpstreamResolver};
use crate::error::{Error, Result};
use crate::network::{DnsBackend, NetworkController, NetworkSnapshot};
use crate::schedule::Activation;
use crate::server::{DnsServer, QueryHandler};
use crate::state::runtime::RuntimeStateFile;

/// What launch-time recovery did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Nothing was active and the host was clean.
    Idle,
    /// The gateway was last enabled and has been started again.
    Redriven,
    /// A leftover override was cleaned up by an authorized operator.
    StaleOverrideRestored,
    /// A leftover override was found without authorization, so blocking
    /// was resumed instead.
    StaleOverrideReactivated,
}

pub struct Gateway<B: DnsBackend, L: BlocklistSource> {
    config: Config,
    network: NetworkController<B>,
    blocklist: Arc<L>,
    runtime: RuntimeStateFile,
    server: Mutex<Option<DnsServer>>,
}

impl<B: DnsBackend, L: BlocklistSource> Gateway<B, L> {
    pub fn new(config: Config, backend: B, blocklist: L) -> Self {
        Self {
            network: NetworkController::new(backend, config.snapshot_path()),
            runtime: RuntimeStateFile::new(config.runtime_state_path()),
            blocklist: Arc::new(blocklist),
            server: Mutex::new(None),
            config,
        }
    }

    pub fn network(&self) -> &NetworkController<B> {
        &self.network
    }

    pub async fn is_running(&self) -> bool {
        self.server.lock().await.is_some()
    }

    /// Running and the host still resolves through loopback. A failed check
    /// counts as blocking.
    pub async fn is_blocking(&self) -> bool {
        self.is_running().await
            && self
                .network
                .host_points_at_loopback()
                .await
                .unwrap_or(true)
    }

    /// Whether an operator interrupt may suspend the gateway. Lifting active
    /// blocking needs authorization.
    pub async fn may_suspend(&self, authorized: bool) -> bool {
        authorized || !self.is_blocking().await
    }

    /// Addresses the listener is bound to, if running.
    pub async fn local_addrs(&self) -> Option<Vec<SocketAddr>> {
        self.server
            .lock()
            .await
            .as_ref()
            .map(|server| server.local_addrs().to_vec())
    }

    /// Start blocking. A no-op while already running.
    ///
    /// The host configuration is captured before the override so the
    /// listener forwards to the host's own resolvers. If the override is only
    /// partly applied or the listener cannot bind, the override is rolled back.
    pub async fn start(&self) -> Result<()> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            debug!("gateway already running");
            return Ok(());
        }

        self.network.snapshot_and_persist().await?;
        if let Err(err) = self.network.apply_local_override().await {
            // part of the override may already be applied
            error!(error = %err, "DNS override failed, restoring automatic DNS");
            if let Err(restore_err) = self.network.restore_automatic().await {
                error!(error = %restore_err, "rollback of DNS override failed");
            }
            return Err(err);
        }

        let resolver = UpstreamResolver::new(self.network.upstreams(), self.config.fallback_upstream)
            .with_timeout(self.config.upstream_timeout());
        let upstreams = resolver.upstreams().to_vec();
        let handler = QueryHandler::with_shared_blocklist(
            Arc::clone(&self.blocklist),
            resolver,
            DomainMatcher::new(self.config.normalized_suffixes()),
        );

        let listener = match DnsServer::bind(&self.config.listen, self.config.tcp, handler).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(error = %err, "listener failed to start, rolling back DNS override");
                if let Err(restore_err) = self.network.restore_automatic().await {
                    error!(error = %restore_err, "rollback of DNS override failed");
                }
                return Err(err);
            }
        };

        if let Err(err) = self.runtime.save(true) {
            warn!(error = %err, "failed to persist runtime state");
        }
        info!(listen = ?listener.local_addrs(), ?upstreams, "gateway started");
        *server = Some(listener);
        Ok(())
    }

    /// Stop blocking and record the gateway as disabled.
    ///
    /// The listener is closed and the host restored independently of each
    /// other. When the restore fails the gateway stays recorded as enabled,
    /// since the host still resolves through loopback, and
    /// [`Error::StopIncomplete`] is returned.
    pub async fn stop(&self) -> Result<()> {
        match self.shutdown().await {
            Ok(stopped) => {
                self.runtime.save(false)?;
                if stopped {
                    info!("gateway stopped");
                } else {
                    info!("gateway already stopped");
                }
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "listener closed but DNS could not be restored");
                if let Err(save_err) = self.runtime.save(true) {
                    warn!(error = %save_err, "failed to persist runtime state");
                }
                Err(Error::StopIncomplete(err.to_string()))
            }
        }
    }

    /// Close the listener and restore the host for process exit, keeping the
    /// gateway recorded as enabled so the next launch resumes blocking.
    pub async fn suspend(&self) -> Result<()> {
        self.shutdown().await?;
        info!("gateway suspended");
        Ok(())
    }

    /// Restore automatic DNS regardless of what this process holds and record
    /// the gateway as disabled.
    pub async fn emergency_restore(&self, authorized: bool) -> Result<()> {
        if !authorized {
            warn!("emergency restore refused without authorization");
            return Err(Error::AuthorizationDenied);
        }
        if let Some(listener) = self.server.lock().await.take() {
            listener.stop().await;
        }
        self.network.restore_automatic().await?;
        self.runtime.save(false)?;
        info!("DNS restored by operator");
        Ok(())
    }

    /// Bring the host back to a consistent state at launch.
    pub async fn recover(&self, authorized: bool) -> Result<Recovery> {
        if self.runtime.load().enabled {
            info!("gateway was enabled before exit, starting it again");
            self.start().await?;
            return Ok(Recovery::Redriven);
        }

        if !self.network.host_points_at_loopback().await? {
            return Ok(Recovery::Idle);
        }

        if authorized {
            warn!("found leftover DNS override, restoring automatic DNS");
            self.network.restore_automatic().await?;
            self.runtime.save(false)?;
            Ok(Recovery::StaleOverrideRestored)
        } else {
            warn!("found leftover DNS override without authorization, resuming blocking");
            self.start().await?;
            Ok(Recovery::StaleOverrideReactivated)
        }
    }

    pub fn snapshot(&self) -> Option<NetworkSnapshot> {
        self.network.load_snapshot()
    }

    /// Close the listener, then restore the host if anything may still point
    /// at loopback. Returns `false` when there was nothing to undo.
    async fn shutdown(&self) -> Result<bool> {
        let mut server = self.server.lock().await;
        let was_running = match server.take() {
            Some(listener) => {
                listener.stop().await;
                true
            }
            None => false,
        };

        let needs_restore = was_running
            || self.network.is_override_active().await
            || self
                .network
                .host_points_at_loopback()
                .await
                .unwrap_or(true);
        if !needs_restore {
            return Ok(false);
        }
        self.network.restore_automatic().await?;
        Ok(true)
    }
}

impl<B: DnsBackend, L: BlocklistSource> Activation for Gateway<B, L> {
    async fn activate(&self) -> Result<()> {
        self.start().await
    }

    async fn deactivate(&self) -> Result<()> {
        self.stop().await
    }
}
