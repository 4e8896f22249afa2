//! Integration tests for the DNS listener.
//!
//! A real `DnsServer` is bound on loopback and forwards to fake upstream
//! resolvers, also on loopback.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::{Duration, Instant};

use dnsgate::blocklist::{DomainStore, FileBlocklist, MemoryBlocklist, save_domains};
use dnsgate::dns::{DomainMatcher, UpstreamResolver};
use dnsgate::server::{DnsServer, QueryHandler};
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;

const UPSTREAM_ANSWER: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

fn loopback() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

/// Unreachable fallback so tests never leave the machine.
fn fallback() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 9))
}

fn create_query(domain: &str, query_type: RecordType, id: u16) -> Vec<u8> {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_str(domain).unwrap(), query_type));
    message.to_bytes().unwrap()
}

/// Upstream answering every A query with [`UPSTREAM_ANSWER`].
async fn spawn_upstream() -> (SocketAddr, JoinHandle<()>) {
    let socket = UdpSocket::bind(loopback()).await.unwrap();
    let addr = socket.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let query = Message::from_bytes(&buf[..len]).unwrap();
            let mut reply = Message::new();
            reply
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .set_response_code(ResponseCode::NoError);
            for q in query.queries() {
                reply.add_query(q.clone());
                reply.add_answer(Record::from_rdata(
                    q.name().clone(),
                    300,
                    RData::A(A(UPSTREAM_ANSWER)),
                ));
            }
            socket
                .send_to(&reply.to_bytes().unwrap(), peer)
                .await
                .unwrap();
        }
    });
    (addr, handle)
}

async fn exchange_udp(server: SocketAddr, query: &[u8]) -> Message {
    let client = UdpSocket::bind(loopback()).await.unwrap();
    client.send_to(query, server).await.unwrap();
    let mut buf = [0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("no reply from gateway")
        .unwrap();
    Message::from_bytes(&buf[..len]).unwrap()
}

async fn bind_server(blocked: &[&str], upstreams: Vec<SocketAddr>) -> DnsServer {
    let resolver =
        UpstreamResolver::new(upstreams, fallback()).with_timeout(Duration::from_millis(200));
    let handler = QueryHandler::new(
        MemoryBlocklist::new(blocked.iter().copied()),
        resolver,
        DomainMatcher::new(["homenet.telecomitalia.it", "home", "lan"]),
    );
    DnsServer::bind(&[loopback()], true, handler).await.unwrap()
}

#[tokio::test]
async fn should_block_listed_domain_and_subdomains() {
    let server = bind_server(&["example.com"], vec![]).await;
    let addr = server.local_addrs()[0];

    for name in ["example.com.", "ads.example.com.", "ADS.Example.COM."] {
        let reply = exchange_udp(addr, &create_query(name, RecordType::A, 4242)).await;
        assert_eq!(reply.id(), 4242);
        assert_eq!(reply.message_type(), MessageType::Response);
        assert!(reply.recursion_available());
        assert_eq!(reply.answers().len(), 1, "{name}");
        assert_eq!(reply.answers()[0].ttl(), 60);
        assert_eq!(
            reply.answers()[0].data(),
            &RData::A(A(Ipv4Addr::UNSPECIFIED))
        );
    }

    server.stop().await;
}

#[tokio::test]
async fn should_block_aaaa_with_unspecified_address() {
    let server = bind_server(&["example.com"], vec![]).await;
    let reply = exchange_udp(
        server.local_addrs()[0],
        &create_query("cdn.example.com.", RecordType::AAAA, 9),
    )
    .await;

    assert_eq!(reply.answers().len(), 1);
    assert_eq!(
        reply.answers()[0].data(),
        &RData::AAAA(AAAA(Ipv6Addr::UNSPECIFIED))
    );
    server.stop().await;
}

#[tokio::test]
async fn should_strip_local_suffix_before_matching() {
    let server = bind_server(&["example.com"], vec![]).await;
    let reply = exchange_udp(
        server.local_addrs()[0],
        &create_query("ads.example.com.homenet.telecomitalia.it.", RecordType::A, 1),
    )
    .await;

    assert_eq!(reply.answers().len(), 1);
    server.stop().await;
}

#[tokio::test]
async fn should_forward_allowed_domain_verbatim() {
    let (upstream, upstream_task) = spawn_upstream().await;
    let server = bind_server(&["example.com"], vec![upstream]).await;

    let reply = exchange_udp(
        server.local_addrs()[0],
        &create_query("notexample.com.", RecordType::A, 77),
    )
    .await;

    assert_eq!(reply.id(), 77);
    assert_eq!(reply.answers().len(), 1);
    assert_eq!(reply.answers()[0].ttl(), 300);
    assert_eq!(reply.answers()[0].data(), &RData::A(A(UPSTREAM_ANSWER)));

    server.stop().await;
    upstream_task.abort();
}

#[tokio::test]
async fn should_fail_over_silent_upstreams_in_order() {
    // bound but never answering
    let silent_a = UdpSocket::bind(loopback()).await.unwrap();
    let silent_b = UdpSocket::bind(loopback()).await.unwrap();
    let (upstream, upstream_task) = spawn_upstream().await;

    let server = bind_server(
        &[],
        vec![
            silent_a.local_addr().unwrap(),
            silent_b.local_addr().unwrap(),
            upstream,
        ],
    )
    .await;

    let started = Instant::now();
    let reply = exchange_udp(
        server.local_addrs()[0],
        &create_query("allowed.test.", RecordType::A, 5),
    )
    .await;

    assert_eq!(reply.answers()[0].data(), &RData::A(A(UPSTREAM_ANSWER)));
    // two timeouts were waited out before the third upstream answered
    assert!(started.elapsed() >= Duration::from_millis(400));

    server.stop().await;
    upstream_task.abort();
}

#[tokio::test]
async fn should_answer_empty_when_every_upstream_fails() {
    let silent = UdpSocket::bind(loopback()).await.unwrap();
    let server = bind_server(&[], vec![silent.local_addr().unwrap()]).await;

    let reply = exchange_udp(
        server.local_addrs()[0],
        &create_query("allowed.test.", RecordType::A, 31337),
    )
    .await;

    assert_eq!(reply.id(), 31337);
    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert!(reply.answers().is_empty());
    assert_eq!(reply.queries().len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn should_survive_malformed_datagrams() {
    let server = bind_server(&["example.com"], vec![]).await;
    let addr = server.local_addrs()[0];

    let client = UdpSocket::bind(loopback()).await.unwrap();
    client.send_to(&[0xde, 0xad, 0xbe], addr).await.unwrap();
    let mut buf = [0u8; 512];
    let nothing =
        tokio::time::timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await;
    assert!(nothing.is_err(), "malformed input must not be answered");

    let reply = exchange_udp(addr, &create_query("example.com.", RecordType::A, 2)).await;
    assert_eq!(reply.answers().len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn should_answer_over_tcp() {
    let server = bind_server(&["example.com"], vec![]).await;
    let addr = server.local_addrs()[0];

    let query = create_query("example.com.", RecordType::A, 808);
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(&u16::try_from(query.len()).unwrap().to_be_bytes())
        .await
        .unwrap();
    stream.write_all(&query).await.unwrap();

    let len = stream.read_u16().await.unwrap();
    let mut buf = vec![0u8; usize::from(len)];
    stream.read_exact(&mut buf).await.unwrap();

    let reply = Message::from_bytes(&buf).unwrap();
    assert_eq!(reply.id(), 808);
    assert_eq!(reply.answers().len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn should_apply_blocklist_edits_without_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("domains.json");
    save_domains(&path, ["example.com"]).unwrap();

    let (upstream, upstream_task) = spawn_upstream().await;
    let resolver =
        UpstreamResolver::new(vec![upstream], fallback()).with_timeout(Duration::from_millis(200));
    let handler = QueryHandler::new(
        FileBlocklist::new(&path),
        resolver,
        DomainMatcher::new(["lan"]),
    );
    let server = DnsServer::bind(&[loopback()], false, handler).await.unwrap();
    let addr = server.local_addrs()[0];

    let reply = exchange_udp(addr, &create_query("tracker.test.", RecordType::A, 1)).await;
    assert_eq!(reply.answers()[0].data(), &RData::A(A(UPSTREAM_ANSWER)));

    assert!(DomainStore::new(&path).add("Tracker.Test").unwrap());

    let reply = exchange_udp(addr, &create_query("tracker.test.", RecordType::A, 2)).await;
    assert_eq!(
        reply.answers()[0].data(),
        &RData::A(A(Ipv4Addr::UNSPECIFIED))
    );

    server.stop().await;
    upstream_task.abort();
}

#[tokio::test]
async fn should_release_port_on_stop() {
    let server = bind_server(&[], vec![]).await;
    let addr = server.local_addrs()[0];
    server.stop().await;

    UdpSocket::bind(addr).await.unwrap();
}
