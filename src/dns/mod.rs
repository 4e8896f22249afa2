//! DNS-related modules.

pub mod matcher;
pub mod resolver;

pub use matcher::{BlockDecision, DomainMatcher, is_blocked};
pub use resolver::{DnsResolver, UpstreamResolver};
