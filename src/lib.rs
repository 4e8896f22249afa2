//! dnsgate - a local DNS blocking gateway.
//!
//! dnsgate points the host's resolver configuration at a listener on
//! loopback, answers queries for blocked domains with unroutable addresses,
//! and forwards everything else to the resolvers the host used before.
//! Blocking can run indefinitely, inside a daily window, or for a fixed
//! number of minutes, and the actions that weaken it need the operator
//! password.
//!
//! # Architecture
//!
//! - [`config`]: Configuration loading and validation
//! - [`blocklist`]: Blocked domain set and its JSON store
//! - [`dns`]: Name matching, block replies and upstream forwarding
//! - [`server`]: UDP/TCP listener
//! - [`network`]: Host resolver snapshot, override and restore
//! - [`schedule`]: Interval and duration schedules
//! - [`security`]: Operator credential and audit log
//! - [`gateway`]: Start/stop orchestration and launch recovery
//! - [`state`]: Atomic JSON state files
//! - [`error`]: Error types
//!
//! # Testing
//!
//! Host access and upstream resolution sit behind traits so the pieces can
//! be exercised without touching the machine's DNS:
//!
//! ```rust
//! use dnsgate::blocklist::BlockedDomainSet;
//! use dnsgate::dns::{DomainMatcher, is_blocked};
//!
//! let blocked: BlockedDomainSet = ["example.com"].into_iter().collect();
//! let matcher = DomainMatcher::new(["lan"]);
//!
//! let name = matcher.normalize("ads.example.com.lan.");
//! assert!(is_blocked(&name, &blocked));
//! assert!(!is_blocked("notexample.com", &blocked));
//! ```

pub mod blocklist;
pub mod config;
pub mod dns;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod network;
pub mod schedule;
pub mod security;
pub mod server;
pub mod state;

pub use config::Config;
pub use error::{Error, Result};
pub use gateway::Gateway;
