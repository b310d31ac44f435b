//! Recv-loop behavior over a real loopback socket: a malformed datagram is
//! dropped and the server keeps answering. Talks only to 127.0.0.1 with a
//! pre-seeded cache, so no upstream or privileged port is involved.

use hermod::answer::{DnsAnswer, JsonQuestion, JsonRecord};
use hermod::cache::{Cache, MemoryBackend};
use hermod::race::{RaceDispatcher, Resolver};
use hermod::server;
use hermod::stats::StatsRegistry;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::timeout;

fn query_bytes(id: u16, name: &str) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    message.to_vec().unwrap()
}

/// A dispatcher whose only entrant is the cache, pre-seeded so queries for
/// `example.com.` win instantly instead of waiting out the race deadline.
async fn cache_only_dispatcher() -> Arc<RaceDispatcher> {
    let cache = Arc::new(Cache::new(Box::new(MemoryBackend::new())));
    cache
        .store(&DnsAnswer {
            status: 0,
            rd: true,
            ra: true,
            question: vec![JsonQuestion {
                name: "example.com.".to_string(),
                rtype: 1,
            }],
            answer: vec![JsonRecord {
                name: "example.com.".to_string(),
                rtype: 1,
                ttl: 3600,
                data: "93.184.216.34".to_string(),
            }],
            name_client: "google".to_string(),
            ..DnsAnswer::default()
        })
        .await;
    let resolvers: Vec<Arc<dyn Resolver>> = vec![cache.clone() as Arc<dyn Resolver>];
    Arc::new(RaceDispatcher::new(
        resolvers,
        cache,
        Arc::new(StatsRegistry::new()),
    ))
}

#[tokio::test]
async fn malformed_datagram_does_not_kill_the_recv_loop() {
    let socket = server::bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = socket.local_addr().unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let server_task = tokio::spawn(server::serve(
        socket,
        cache_only_dispatcher().await,
        shutdown_tx.subscribe(),
    ));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // The 3-byte datagram must be dropped without a reply.
    client.send_to(&[0x12, 0x34, 0x00], addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // A well-formed query right after still gets answered.
    client
        .send_to(&query_bytes(0x4242, "example.com."), addr)
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let (len, from) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("server answered the well-formed query")
        .unwrap();
    assert_eq!(from, addr);

    let response = Message::from_vec(&buf[..len]).unwrap();
    assert_eq!(response.id(), 0x4242);
    assert_eq!(response.message_type(), MessageType::Response);
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 1);
    assert_eq!(response.queries()[0].name().to_utf8(), "example.com.");

    // Nothing else is queued: the garbage never produced a response.
    let extra = timeout(Duration::from_millis(100), client.recv_from(&mut buf)).await;
    assert!(extra.is_err(), "malformed datagram must get no reply");

    let _ = shutdown_tx.send(());
    let _ = timeout(Duration::from_secs(2), server_task).await;
}

#[tokio::test]
async fn listener_stops_on_shutdown() {
    let socket = server::bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let server_task = tokio::spawn(server::serve(
        socket,
        cache_only_dispatcher().await,
        shutdown_tx.subscribe(),
    ));

    let _ = shutdown_tx.send(());
    let stopped = timeout(Duration::from_secs(2), server_task).await;
    assert!(stopped.is_ok(), "serve loop exits on the shutdown signal");
}
