//! Host DNS configuration through the platform's own tools.
//!
//! On Linux the link configuration of `systemd-resolved` is driven with
//! `resolvectl`. On Windows the interface servers are set with `netsh`
//! and the active adapter is found with PowerShell.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::process::Command;
use tracing::debug;

use super::interface::find_active_interface;
use crate::error::{NetworkError, Result};

/// IP address family of a resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub const fn matches(self, addr: &IpAddr) -> bool {
        matches!(
            (self, addr),
            (Self::V4, IpAddr::V4(_)) | (Self::V6, IpAddr::V6(_))
        )
    }
}

/// Operations the network controller needs from the host.
///
/// Every call returns a typed result; callers decide whether to retry, log
/// or abort.
pub trait DnsBackend: Send + Sync + 'static {
    /// Name of the first interface whose link is up.
    fn active_interface(&self) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Resolvers currently configured on `interface` for one family.
    fn resolvers(
        &self,
        interface: &str,
        family: AddressFamily,
    ) -> impl Future<Output = Result<Vec<IpAddr>>> + Send;

    /// Point both families of `interface` at the loopback resolver.
    fn set_loopback(&self, interface: &str) -> impl Future<Output = Result<()>> + Send;

    /// Return `interface` to automatically assigned resolvers.
    fn set_automatic(&self, interface: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Tool set used to configure DNS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Resolvectl,
    Netsh,
}

/// One external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: &'static str,
    pub args: Vec<String>,
}

impl HostCommand {
    fn new<I, S>(program: &'static str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Run to completion, mapping a non-zero exit to an error.
    pub async fn run(&self) -> Result<String> {
        debug!(program = self.program, args = ?self.args, "running host command");
        let output = Command::new(self.program)
            .args(&self.args)
            .output()
            .await
            .map_err(|source| NetworkError::Spawn {
                program: self.program.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(NetworkError::CommandFailed {
                program: self.program.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Platform {
    /// The platform this binary was built for, if supported.
    pub const fn current() -> Option<Self> {
        if cfg!(target_os = "linux") {
            Some(Self::Resolvectl)
        } else if cfg!(target_os = "windows") {
            Some(Self::Netsh)
        } else {
            None
        }
    }

    pub fn query_commands(self, interface: &str, family: AddressFamily) -> HostCommand {
        match self {
            Self::Resolvectl => HostCommand::new("resolvectl", ["dns", interface]),
            Self::Netsh => HostCommand::new(
                "netsh",
                [
                    "interface",
                    netsh_family(family),
                    "show",
                    "dnsservers",
                    format!("name={interface}").as_str(),
                ],
            ),
        }
    }

    pub fn loopback_commands(self, interface: &str) -> Vec<HostCommand> {
        let v4 = Ipv4Addr::LOCALHOST.to_string();
        let v6 = Ipv6Addr::LOCALHOST.to_string();
        match self {
            Self::Resolvectl => vec![
                HostCommand::new("resolvectl", ["dns", interface, v4.as_str(), v6.as_str()]),
                // route every lookup through this link
                HostCommand::new("resolvectl", ["domain", interface, "~."]),
            ],
            Self::Netsh => [(AddressFamily::V4, v4), (AddressFamily::V6, v6)]
                .into_iter()
                .map(|(family, addr)| {
                    HostCommand::new(
                        "netsh",
                        [
                            "interface",
                            netsh_family(family),
                            "set",
                            "dnsservers",
                            format!("name={interface}").as_str(),
                            "source=static",
                            format!("address={addr}").as_str(),
                            "register=none",
                            "validate=no",
                        ],
                    )
                })
                .collect(),
        }
    }

    pub fn automatic_commands(self, interface: &str) -> Vec<HostCommand> {
        match self {
            Self::Resolvectl => vec![HostCommand::new("resolvectl", ["revert", interface])],
            Self::Netsh => [AddressFamily::V4, AddressFamily::V6]
                .into_iter()
                .map(|family| {
                    HostCommand::new(
                        "netsh",
                        [
                            "interface",
                            netsh_family(family),
                            "set",
                            "dnsservers",
                            format!("name={interface}").as_str(),
                            "source=dhcp",
                        ],
                    )
                })
                .collect(),
        }
    }
}

const fn netsh_family(family: AddressFamily) -> &'static str {
    match family {
        AddressFamily::V4 => "ipv4",
        AddressFamily::V6 => "ipv6",
    }
}

/// Extract resolver addresses of one family from tool output.
///
/// Both `resolvectl dns` ("Link 2 (eth0): 192.168.1.1 fe80::1") and
/// `netsh ... show dnsservers` list addresses as whitespace separated
/// tokens; anything that is not an address is skipped.
pub fn parse_resolver_output(output: &str, family: AddressFamily) -> Vec<IpAddr> {
    let mut resolvers = Vec::new();
    for token in output.split_whitespace() {
        let token = token.trim_matches(|c: char| c == ',' || c == ';');
        // scoped IPv6 addresses ("fe80::1%eth0") carry a zone suffix
        let token = token.split('%').next().unwrap_or(token);
        if let Ok(addr) = token.parse::<IpAddr>()
            && family.matches(&addr)
            && !resolvers.contains(&addr)
        {
            resolvers.push(addr);
        }
    }
    resolvers
}

/// [`DnsBackend`] running the platform tools on the host.
#[derive(Debug, Clone, Copy)]
pub struct SystemBackend {
    platform: Option<Platform>,
}

impl SystemBackend {
    pub const fn new() -> Self {
        Self {
            platform: Platform::current(),
        }
    }

    fn platform(&self) -> Result<Platform> {
        self.platform.ok_or_else(|| NetworkError::Unsupported.into())
    }
}

impl Default for SystemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsBackend for SystemBackend {
    async fn active_interface(&self) -> Result<Option<String>> {
        match self.platform()? {
            Platform::Resolvectl => Ok(find_active_interface().map(|iface| iface.name)),
            Platform::Netsh => {
                // adapter aliases are what netsh expects, pnet only knows device paths
                let output = HostCommand::new(
                    "powershell",
                    [
                        "-NoProfile",
                        "-Command",
                        "Get-NetAdapter | Where-Object { $_.Status -eq 'Up' } | Select-Object -First 1 -ExpandProperty Name",
                    ],
                )
                .run()
                .await?;
                let name = output.trim();
                Ok((!name.is_empty()).then(|| name.to_string()))
            }
        }
    }

    async fn resolvers(&self, interface: &str, family: AddressFamily) -> Result<Vec<IpAddr>> {
        let output = self.platform()?.query_commands(interface, family).run().await?;
        Ok(parse_resolver_output(&output, family))
    }

    async fn set_loopback(&self, interface: &str) -> Result<()> {
        for command in self.platform()?.loopback_commands(interface) {
            command.run().await?;
        }
        Ok(())
    }

    async fn set_automatic(&self, interface: &str) -> Result<()> {
        for command in self.platform()?.automatic_commands(interface) {
            command.run().await?;
        }
        Ok(())
    }
}
