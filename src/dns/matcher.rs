//! Domain matching against the blocklist.
//!
//! Matching is suffix containment only: a name is blocked when it equals a
//! blocked entry or is a subdomain of one. There is no wildcard or regex
//! syntax, and the cost is linear in the size of the blocklist.

use std::net::{Ipv4Addr, Ipv6Addr};

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};

use crate::blocklist::BlockedDomainSet;

/// TTL of synthesized answers for blocked names, in seconds.
pub const BLOCK_TTL: u32 = 60;

/// Outcome of matching one question against the blocklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDecision {
    Allow,
    BlockV4,
    BlockV6,
    BlockOther,
}

impl BlockDecision {
    pub const fn is_blocked(self) -> bool {
        !matches!(self, Self::Allow)
    }
}

/// Normalizes query names and classifies them against a blocklist.
#[derive(Debug, Clone, Default)]
pub struct DomainMatcher {
    /// Lowercase suffixes without surrounding dots, checked in order.
    local_suffixes: Vec<String>,
}

impl DomainMatcher {
    pub fn new<I, S>(local_suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let local_suffixes = local_suffixes
            .into_iter()
            .map(|s| s.as_ref().trim().trim_matches('.').to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self { local_suffixes }
    }

    /// Lowercase the name, drop trailing dots, and strip a local network suffix.
    ///
    /// Suffixes are tried in configured order and the first one that matches is
    /// stripped, not the longest. The result is reduced until nothing changes,
    /// so `normalize(normalize(x)) == normalize(x)`. Stacked suffixes are all
    /// removed: with `home` and `lan` configured, `a.home.lan` becomes `a`,
    /// not `a.home`.
    pub fn normalize(&self, query_name: &str) -> String {
        let mut domain = query_name.to_lowercase();
        loop {
            let trimmed_len = domain.trim_end_matches('.').len();
            domain.truncate(trimmed_len);

            let Some(stripped_len) = self.local_suffixes.iter().find_map(|suffix| {
                domain
                    .strip_suffix(suffix.as_str())
                    .and_then(|rest| rest.strip_suffix('.'))
                    .map(str::len)
            }) else {
                return domain;
            };
            domain.truncate(stripped_len);
        }
    }

    /// Classify a normalized domain queried with `record_type`.
    pub fn classify(
        &self,
        domain: &str,
        record_type: RecordType,
        blocked: &BlockedDomainSet,
    ) -> BlockDecision {
        if !is_blocked(domain, blocked) {
            return BlockDecision::Allow;
        }
        match record_type {
            RecordType::A => BlockDecision::BlockV4,
            RecordType::AAAA => BlockDecision::BlockV6,
            _ => BlockDecision::BlockOther,
        }
    }
}

/// `true` when `domain` equals a blocked entry or is a strict subdomain of one.
pub fn is_blocked(domain: &str, blocked: &BlockedDomainSet) -> bool {
    if domain.is_empty() {
        return false;
    }
    blocked.iter().any(|entry| is_same_or_subdomain(domain, entry))
}

#[inline]
fn is_same_or_subdomain(candidate: &str, entry: &str) -> bool {
    match candidate.strip_suffix(entry) {
        Some("") => true,
        Some(rest) => rest.ends_with('.'),
        None => false,
    }
}

fn reply_to(query: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError);

    for q in query.queries() {
        response.add_query(q.clone());
    }
    response
}

/// Reply with no answer records ("no data").
pub fn empty_response(query: &Message) -> Message {
    reply_to(query)
}

/// Reply for a blocked question.
///
/// - A → one record `0.0.0.0`
/// - AAAA → one record `::`
/// - any other type → no answer records
pub fn blocked_response(query: &Message, decision: BlockDecision) -> Message {
    let mut response = reply_to(query);
    let Some(question) = query.queries().first() else {
        return response;
    };

    let rdata = match decision {
        BlockDecision::BlockV4 => RData::A(A(Ipv4Addr::UNSPECIFIED)),
        BlockDecision::BlockV6 => RData::AAAA(AAAA(Ipv6Addr::UNSPECIFIED)),
        BlockDecision::BlockOther | BlockDecision::Allow => return response,
    };
    response.add_answer(Record::from_rdata(question.name().clone(), BLOCK_TTL, rdata));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;
    use std::str::FromStr;

    fn matcher() -> DomainMatcher {
        DomainMatcher::new(["homenet.telecomitalia.it", "home", "lan"])
    }

    fn set(domains: &[&str]) -> BlockedDomainSet {
        domains.iter().collect()
    }

    fn query(domain: &str, record_type: RecordType) -> Message {
        let mut q = Query::new();
        q.set_name(Name::from_str(domain).unwrap());
        q.set_query_type(record_type);

        let mut message = Message::new();
        message.set_id(4321).set_recursion_desired(true);
        message.add_query(q);
        message
    }

    #[test]
    fn should_lowercase_and_strip_trailing_dot() {
        assert_eq!(matcher().normalize("WWW.Example.COM."), "www.example.com");
        assert_eq!(matcher().normalize("example.com.."), "example.com");
    }

    #[test]
    fn should_strip_local_suffix() {
        let m = matcher();
        assert_eq!(m.normalize("ads.example.com.lan."), "ads.example.com");
        assert_eq!(m.normalize("printer.home"), "printer");
        assert_eq!(m.normalize("ads.example.com.homenet.telecomitalia.it."), "ads.example.com");
        // the suffix must be a whole label
        assert_eq!(m.normalize("myhome"), "myhome");
        // a bare suffix is a name on its own
        assert_eq!(m.normalize("lan."), "lan");
    }

    #[test]
    fn should_prefer_first_configured_suffix() {
        let m = DomainMatcher::new(["it", "telecomitalia.it"]);
        // "it" is checked first, leaving "x.telecomitalia" which no longer matches
        assert_eq!(m.normalize("x.telecomitalia.it"), "x.telecomitalia");
    }

    #[test]
    fn should_strip_stacked_local_suffixes() {
        let m = matcher();
        assert_eq!(m.normalize("a.home.lan"), "a");
        assert_eq!(m.normalize("ads.example.com.home.lan."), "ads.example.com");
    }

    #[test]
    fn should_be_idempotent() {
        let m = matcher();
        let inputs = [
            "",
            ".",
            "..lan",
            "a.lan.lan",
            "a.home.lan.",
            "Foo.Bar.HOME.",
            "example.com",
            "x.homenet.telecomitalia.it.lan",
            "lan",
            ".home",
            "ÄBC.Example",
        ];
        for input in inputs {
            let once = m.normalize(input);
            assert_eq!(m.normalize(&once), once, "input {input:?}");
        }
    }

    #[test]
    fn should_block_exact_and_subdomains() {
        let blocked = set(&["example.com", "tracker.net"]);

        assert!(is_blocked("example.com", &blocked));
        assert!(is_blocked("ads.example.com", &blocked));
        assert!(is_blocked("a.b.c.tracker.net", &blocked));
        assert!(!is_blocked("com", &blocked));
        assert!(!is_blocked("", &blocked));
    }

    #[test]
    fn should_block_any_label_prefixed_to_blocked_domain() {
        let blocked = set(&["example.com", "x.y", "tracker.net"]);
        for entry in blocked.iter() {
            for label in ["a", "www", "0", "very-long-label", "a.b"] {
                let candidate = format!("{label}.{entry}");
                assert!(is_blocked(&candidate, &blocked), "{candidate}");
            }
        }
    }

    #[test]
    fn should_not_match_shared_substrings() {
        let blocked = set(&["example.com"]);

        assert!(!is_blocked("notblocked.example", &blocked));
        assert!(!is_blocked("notexample.com", &blocked));
        assert!(!is_blocked("example.com.evil.org", &blocked));
    }

    #[test]
    fn should_classify_by_record_type() {
        let m = matcher();
        let blocked = set(&["example.com"]);

        assert_eq!(m.classify("ads.example.com", RecordType::A, &blocked), BlockDecision::BlockV4);
        assert_eq!(m.classify("ads.example.com", RecordType::AAAA, &blocked), BlockDecision::BlockV6);
        assert_eq!(m.classify("ads.example.com", RecordType::MX, &blocked), BlockDecision::BlockOther);
        assert_eq!(m.classify("example.org", RecordType::A, &blocked), BlockDecision::Allow);
        assert!(!BlockDecision::Allow.is_blocked());
        assert!(BlockDecision::BlockOther.is_blocked());
    }

    #[test]
    fn should_answer_unspecified_ipv4_for_blocked_a_query() {
        let q = query("ads.example.com.", RecordType::A);
        let response = blocked_response(&q, BlockDecision::BlockV4);

        assert_eq!(response.id(), 4321);
        assert_eq!(response.message_type(), MessageType::Response);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.recursion_desired());
        assert_eq!(response.queries().len(), 1);
        assert_eq!(response.answers().len(), 1);

        let answer = &response.answers()[0];
        assert_eq!(answer.ttl(), BLOCK_TTL);
        assert_eq!(answer.data().as_a(), Some(&A(Ipv4Addr::UNSPECIFIED)));
    }

    #[test]
    fn should_answer_unspecified_ipv6_for_blocked_aaaa_query() {
        let q = query("ads.example.com.", RecordType::AAAA);
        let response = blocked_response(&q, BlockDecision::BlockV6);

        assert_eq!(response.answers().len(), 1);
        let answer = &response.answers()[0];
        assert_eq!(answer.ttl(), 60);
        assert_eq!(answer.data().as_aaaa(), Some(&AAAA(Ipv6Addr::UNSPECIFIED)));
    }

    #[test]
    fn should_answer_no_data_for_other_blocked_types() {
        let q = query("ads.example.com.", RecordType::TXT);
        let response = blocked_response(&q, BlockDecision::BlockOther);

        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
        assert_eq!(response.queries().len(), 1);
    }

    #[test]
    fn should_build_empty_response_matching_query_id() {
        let q = query("example.org.", RecordType::A);
        let response = empty_response(&q);

        assert_eq!(response.id(), q.id());
        assert_eq!(response.message_type(), MessageType::Response);
        assert!(response.answers().is_empty());
    }
}
