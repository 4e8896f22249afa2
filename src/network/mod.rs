//! Host resolver configuration: snapshot, override and restore.
//!
//! The controller captures the host's resolvers before pointing the active
//! interface at the local gateway. The snapshot is never refreshed while an
//! override is live, so the gateway keeps forwarding to the resolvers the
//! host used before, not to itself.

mod backend;
mod interface;

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{NetworkError, Result};
use crate::state;

pub use backend::{
    AddressFamily, DnsBackend, HostCommand, Platform, SystemBackend, parse_resolver_output,
};
pub use interface::find_active_interface;

/// Port upstream resolvers are queried on.
pub const DNS_PORT: u16 = 53;

/// Pre-override resolver configuration of the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub interface: Option<String>,
    #[serde(default)]
    pub dns_ipv4: Vec<IpAddr>,
    #[serde(default)]
    pub dns_ipv6: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
}

impl NetworkSnapshot {
    /// Upstream endpoints in snapshot order, IPv4 first.
    ///
    /// Loopback and unspecified addresses are skipped: forwarding to them
    /// would loop back into the gateway.
    pub fn upstreams(&self) -> Vec<SocketAddr> {
        self.dns_ipv4
            .iter()
            .chain(&self.dns_ipv6)
            .filter(|addr| !addr.is_loopback() && !addr.is_unspecified())
            .map(|addr| SocketAddr::new(*addr, DNS_PORT))
            .collect()
    }
}

fn points_at_loopback(resolvers: &[IpAddr]) -> bool {
    resolvers.iter().any(IpAddr::is_loopback)
}

/// Captures, overrides and restores the host's DNS configuration.
pub struct NetworkController<B: DnsBackend> {
    backend: B,
    snapshot_path: PathBuf,
    /// Whether this controller currently holds the override. Held across the
    /// host commands so override and restore never interleave.
    override_active: Mutex<bool>,
}

impl<B: DnsBackend> NetworkController<B> {
    pub fn new(backend: B, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            snapshot_path: snapshot_path.into(),
            override_active: Mutex::new(false),
        }
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub async fn is_override_active(&self) -> bool {
        *self.override_active.lock().await
    }

    pub async fn detect_active_interface(&self) -> Result<Option<String>> {
        self.backend.active_interface().await
    }

    async fn require_interface(&self) -> Result<String> {
        self.detect_active_interface()
            .await?
            .ok_or_else(|| NetworkError::NoActiveInterface.into())
    }

    /// Resolvers configured on `interface`, per address family.
    pub async fn capture_current_resolvers(
        &self,
        interface: &str,
    ) -> Result<(Vec<IpAddr>, Vec<IpAddr>)> {
        let ipv4 = self.backend.resolvers(interface, AddressFamily::V4).await?;
        let ipv6 = self.backend.resolvers(interface, AddressFamily::V6).await?;
        Ok((ipv4, ipv6))
    }

    /// Whether the host currently resolves through loopback, which means an
    /// override (ours or a leftover from a killed run) is in place.
    pub async fn host_points_at_loopback(&self) -> Result<bool> {
        let Some(interface) = self.detect_active_interface().await? else {
            return Ok(false);
        };
        let (ipv4, ipv6) = self.capture_current_resolvers(&interface).await?;
        Ok(points_at_loopback(&ipv4) || points_at_loopback(&ipv6))
    }

    /// Capture the host configuration and persist it.
    ///
    /// Returns `None` without touching the stored snapshot when the host is
    /// not in its pre-override condition: either this controller holds the
    /// override, or the host already resolves through loopback.
    pub async fn snapshot_and_persist(&self) -> Result<Option<NetworkSnapshot>> {
        let active = self.override_active.lock().await;
        if *active {
            warn!("override active, keeping existing network snapshot");
            return Ok(None);
        }

        let interface = self.detect_active_interface().await?;
        let (dns_ipv4, dns_ipv6) = match &interface {
            Some(interface) => self.capture_current_resolvers(interface).await?,
            None => (Vec::new(), Vec::new()),
        };

        if points_at_loopback(&dns_ipv4) || points_at_loopback(&dns_ipv6) {
            warn!("host already resolves through loopback, keeping existing network snapshot");
            return Ok(None);
        }

        let snapshot = NetworkSnapshot {
            interface,
            dns_ipv4,
            dns_ipv6,
            captured_at: Some(Utc::now()),
        };
        state::write_json(&self.snapshot_path, &snapshot)?;
        info!(
            interface = ?snapshot.interface,
            ipv4 = ?snapshot.dns_ipv4,
            ipv6 = ?snapshot.dns_ipv6,
            "network snapshot captured"
        );
        Ok(Some(snapshot))
    }

    /// Last persisted snapshot; missing or corrupt reads as `None`.
    pub fn load_snapshot(&self) -> Option<NetworkSnapshot> {
        state::read_json(&self.snapshot_path)
    }

    /// Upstreams from the persisted snapshot (possibly empty).
    pub fn upstreams(&self) -> Vec<SocketAddr> {
        self.load_snapshot()
            .map(|snapshot| snapshot.upstreams())
            .unwrap_or_default()
    }

    /// Point the active interface at loopback for both address families.
    ///
    /// Returns `false` when the override is already held.
    pub async fn apply_local_override(&self) -> Result<bool> {
        let mut active = self.override_active.lock().await;
        if *active {
            info!("local DNS override already active");
            return Ok(false);
        }

        let interface = self.require_interface().await?;
        self.backend.set_loopback(&interface).await?;
        *active = true;
        info!(%interface, "DNS pointed at loopback");
        Ok(true)
    }

    /// Return the active interface to automatically assigned resolvers.
    ///
    /// Also used to clean up an override left behind by a previous process,
    /// so it does not require this controller to hold the override.
    pub async fn restore_automatic(&self) -> Result<()> {
        let mut active = self.override_active.lock().await;
        let interface = self.require_interface().await?;
        self.backend.set_automatic(&interface).await?;
        *active = false;
        info!(%interface, "DNS restored to automatic");
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::Error;
    use parking_lot::Mutex as SyncMutex;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::Arc;

    /// Host state simulated by [`MockBackend`].
    #[derive(Debug, Default)]
    pub struct MockHost {
        pub interface: Option<String>,
        pub automatic_v4: Vec<IpAddr>,
        pub automatic_v6: Vec<IpAddr>,
        pub loopback: bool,
        pub fail_restore: bool,
        pub fail_override: bool,
        pub loopback_calls: usize,
        pub automatic_calls: usize,
    }

    /// In-memory [`DnsBackend`] recording the calls made to it.
    #[derive(Debug, Clone, Default)]
    pub struct MockBackend {
        pub host: Arc<SyncMutex<MockHost>>,
    }

    impl MockBackend {
        pub fn with_resolvers(interface: &str, v4: &[&str], v6: &[&str]) -> Self {
            let backend = Self::default();
            {
                let mut host = backend.host.lock();
                host.interface = Some(interface.to_string());
                host.automatic_v4 = v4.iter().map(|a| a.parse().unwrap()).collect();
                host.automatic_v6 = v6.iter().map(|a| a.parse().unwrap()).collect();
            }
            backend
        }

        pub fn without_interface() -> Self {
            Self::default()
        }
    }

    impl DnsBackend for MockBackend {
        async fn active_interface(&self) -> Result<Option<String>> {
            Ok(self.host.lock().interface.clone())
        }

        async fn resolvers(&self, _interface: &str, family: AddressFamily) -> Result<Vec<IpAddr>> {
            let host = self.host.lock();
            Ok(match (host.loopback, family) {
                (true, AddressFamily::V4) => vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
                (true, AddressFamily::V6) => vec![IpAddr::V6(Ipv6Addr::LOCALHOST)],
                (false, AddressFamily::V4) => host.automatic_v4.clone(),
                (false, AddressFamily::V6) => host.automatic_v6.clone(),
            })
        }

        async fn set_loopback(&self, _interface: &str) -> Result<()> {
            let mut host = self.host.lock();
            host.loopback_calls += 1;
            // the first command lands before the failing one
            host.loopback = true;
            if host.fail_override {
                return Err(NetworkError::Unsupported.into());
            }
            Ok(())
        }

        async fn set_automatic(&self, _interface: &str) -> Result<()> {
            let mut host = self.host.lock();
            host.automatic_calls += 1;
            if host.fail_restore {
                return Err(NetworkError::CommandFailed {
                    program: "mock".into(),
                    status: "exit status: 1".into(),
                    stderr: "restore refused".into(),
                }
                .into());
            }
            host.loopback = false;
            Ok(())
        }
    }

    fn controller(backend: MockBackend) -> (tempfile::TempDir, NetworkController<MockBackend>) {
        let dir = tempfile::tempdir().unwrap();
        let controller = NetworkController::new(backend, dir.path().join("dns_state.json"));
        (dir, controller)
    }

    #[tokio::test]
    async fn test_snapshot_captures_and_persists_both_families() {
        let backend = MockBackend::with_resolvers("wlan0", &["192.168.1.1"], &["fd00::1"]);
        let (_dir, controller) = controller(backend);

        let snapshot = controller.snapshot_and_persist().await.unwrap().unwrap();
        assert_eq!(snapshot.interface.as_deref(), Some("wlan0"));

        let stored = controller.load_snapshot().unwrap();
        assert_eq!(stored, snapshot);
        assert_eq!(
            controller.upstreams(),
            vec![
                "192.168.1.1:53".parse::<SocketAddr>().unwrap(),
                "[fd00::1]:53".parse().unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn test_snapshot_document_layout() {
        let backend = MockBackend::with_resolvers("eth0", &["1.1.1.1"], &[]);
        let (_dir, controller) = controller(backend);
        controller.snapshot_and_persist().await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(controller.snapshot_path()).unwrap()).unwrap();
        assert_eq!(raw["interface"], "eth0");
        assert_eq!(raw["dns_ipv4"], serde_json::json!(["1.1.1.1"]));
        assert_eq!(raw["dns_ipv6"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_snapshot_is_not_overwritten_while_override_active() {
        let backend = MockBackend::with_resolvers("eth0", &["10.0.0.1"], &[]);
        let (_dir, controller) = controller(backend.clone());

        controller.snapshot_and_persist().await.unwrap().unwrap();
        assert!(controller.apply_local_override().await.unwrap());
        backend.host.lock().automatic_v4 = vec!["10.9.9.9".parse().unwrap()];

        assert!(controller.snapshot_and_persist().await.unwrap().is_none());
        assert_eq!(
            controller.load_snapshot().unwrap().dns_ipv4,
            vec!["10.0.0.1".parse::<IpAddr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_snapshot_is_not_taken_from_a_leftover_override() {
        let backend = MockBackend::with_resolvers("eth0", &["10.0.0.1"], &[]);
        backend.host.lock().loopback = true;
        let (_dir, controller) = controller(backend);

        assert!(controller.snapshot_and_persist().await.unwrap().is_none());
        assert!(controller.load_snapshot().is_none());
        assert!(controller.host_points_at_loopback().await.unwrap());
    }

    #[tokio::test]
    async fn test_override_is_exclusive() {
        let backend = MockBackend::with_resolvers("eth0", &["10.0.0.1"], &[]);
        let (_dir, controller) = controller(backend.clone());

        assert!(controller.apply_local_override().await.unwrap());
        assert!(!controller.apply_local_override().await.unwrap());
        assert_eq!(backend.host.lock().loopback_calls, 1);
        assert!(controller.is_override_active().await);

        controller.restore_automatic().await.unwrap();
        assert!(!controller.is_override_active().await);
        assert!(!backend.host.lock().loopback);
    }

    #[tokio::test]
    async fn test_override_and_restore_need_an_interface() {
        let (_dir, controller) = controller(MockBackend::without_interface());

        assert!(matches!(
            controller.apply_local_override().await,
            Err(Error::Network(NetworkError::NoActiveInterface))
        ));
        assert!(matches!(
            controller.restore_automatic().await,
            Err(Error::Network(NetworkError::NoActiveInterface))
        ));
        assert!(!controller.is_override_active().await);
    }

    #[tokio::test]
    async fn test_failed_restore_keeps_override_held() {
        let backend = MockBackend::with_resolvers("eth0", &["10.0.0.1"], &[]);
        let (_dir, controller) = controller(backend.clone());

        controller.apply_local_override().await.unwrap();
        backend.host.lock().fail_restore = true;

        assert!(controller.restore_automatic().await.is_err());
        assert!(controller.is_override_active().await);
    }

    #[test]
    fn test_upstreams_skip_loopback_entries() {
        let snapshot = NetworkSnapshot {
            interface: Some("eth0".into()),
            dns_ipv4: vec!["127.0.0.53".parse().unwrap(), "9.9.9.9".parse().unwrap()],
            dns_ipv6: vec!["::1".parse().unwrap()],
            captured_at: None,
        };
        assert_eq!(
            snapshot.upstreams(),
            vec!["9.9.9.9:53".parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn test_snapshot_without_captured_at_is_accepted() {
        let raw = r#"{"interface": null, "dns_ipv4": ["8.8.4.4"], "dns_ipv6": []}"#;
        let snapshot: NetworkSnapshot = serde_json::from_str(raw).unwrap();
        assert!(snapshot.interface.is_none());
        assert_eq!(snapshot.upstreams().len(), 1);
    }
}
