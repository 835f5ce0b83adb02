//! Node-level integration tests: broadcast fan-out, request/response
//! correlation, expiry, backoff and dynamic allocation over a real link.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use modlink::link::PartialFrame;
use modlink::node::{header, type_id, NullContinuation};
use modlink::serial::SerialDriver;
use modlink::{LinkConfig, Node, NodeConfig, Response};

fn link_config() -> LinkConfig {
    LinkConfig {
        pong_quota: 2,
        active_period: Duration::from_millis(1),
        idle_period: Duration::from_millis(20),
        cursor_reset_delay: Duration::from_millis(5),
        accumulation_period: Duration::from_millis(1),
        submit_timeout: Duration::from_secs(2),
        ..LinkConfig::default()
    }
}

fn node_config(self_id: u8) -> NodeConfig {
    NodeConfig {
        self_id,
        ..NodeConfig::default()
    }
}

type Streams = (
    tokio::io::ReadHalf<tokio::io::DuplexStream>,
    tokio::io::WriteHalf<tokio::io::DuplexStream>,
    tokio::io::ReadHalf<tokio::io::DuplexStream>,
    tokio::io::WriteHalf<tokio::io::DuplexStream>,
);

fn streams() -> Streams {
    let (side_a, side_b) = tokio::io::duplex(65536);
    let (a_read, a_write) = tokio::io::split(side_a);
    let (b_read, b_write) = tokio::io::split(side_b);
    (a_read, a_write, b_read, b_write)
}

#[tokio::test]
async fn test_broadcast_fan_out() {
    let (a_read, a_write, b_read, b_write) = streams();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let node_a = Node::builder()
        .link_config(link_config())
        .node_config(node_config(127))
        .spawn(a_read, a_write)
        .unwrap();
    let _node_b = Node::builder()
        .link_config(link_config())
        .node_config(node_config(1))
        .on_broadcast(
            move |source: u8, type_id: u16, transfer: u8, _priority: u8, payload: &[u8]| {
                let _ = seen_tx.send((source, type_id, transfer, payload.to_vec()));
            },
        )
        .spawn(b_read, b_write)
        .unwrap();

    for index in 0..3u8 {
        node_a
            .broadcast(type_id::PUBLISHED_FIELDS, 16, &[index, 0x55])
            .await
            .unwrap();
    }

    for expected in 0..3u8 {
        let (source, broadcast_type, transfer, payload) =
            tokio::time::timeout(Duration::from_secs(10), seen_rx.recv())
                .await
                .expect("broadcast delivery timed out")
                .expect("handler channel closed");
        assert_eq!(source, 127);
        assert_eq!(broadcast_type, type_id::PUBLISHED_FIELDS);
        // Transfer IDs advance per type, modulo 32.
        assert_eq!(transfer, expected);
        assert_eq!(payload, vec![expected, 0x55]);
    }
}

#[tokio::test]
async fn test_request_response_round_trip() {
    let (a_read, a_write, b_read, b_write) = streams();
    let (request_tx, mut request_rx) = mpsc::unbounded_channel();
    let node_a = Node::builder()
        .link_config(link_config())
        .node_config(node_config(127))
        .spawn(a_read, a_write)
        .unwrap();
    let node_b = Arc::new(
        Node::builder()
            .link_config(link_config())
            .node_config(node_config(5))
            .on_request(
                move |source: u8, type_id: u8, transfer: u8, _priority: u8, payload: &[u8]| {
                    let _ = request_tx.send((source, type_id, transfer, payload.to_vec()));
                },
            )
            .spawn(b_read, b_write)
            .unwrap(),
    );

    // B answers each captured request with a doubled payload byte.
    let responder = node_b.clone();
    tokio::spawn(async move {
        while let Some((source, type_id, transfer, payload)) = request_rx.recv().await {
            responder
                .respond(source, type_id, transfer, 20, &[payload[0].wrapping_mul(2)])
                .await
                .unwrap();
        }
    });

    let (response_tx, mut response_rx) = mpsc::unbounded_channel();
    node_a
        .request_callback(
            5,
            type_id::GET_PREFERRED_NAME,
            20,
            &[21],
            move |response: Response| {
                let _ = response_tx.send(response);
            },
        )
        .await
        .unwrap();
    assert_eq!(node_a.outstanding_requests(), 1);

    let response = tokio::time::timeout(Duration::from_secs(10), response_rx.recv())
        .await
        .expect("response timed out")
        .expect("callback channel closed");
    let Response::Payload(payload) = response else {
        panic!("expected payload, got timeout");
    };
    assert_eq!(&payload[..], &[42]);
    assert_eq!(node_a.outstanding_requests(), 0);
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let (a_read, a_write, b_read, b_write) = streams();
    let node_a = Node::builder()
        .link_config(link_config())
        .node_config(NodeConfig {
            self_id: 127,
            request_expiry: Duration::from_millis(200),
            sweep_period: Duration::from_millis(50),
            ..NodeConfig::default()
        })
        .spawn(a_read, a_write)
        .unwrap();
    let _node_b = Node::builder()
        .link_config(link_config())
        .node_config(node_config(1))
        .spawn(b_read, b_write)
        .unwrap();

    let (response_tx, mut response_rx) = mpsc::unbounded_channel();
    // Node 9 does not exist; nobody answers.
    node_a
        .request_callback(9, 7, 20, &[1, 2, 3], move |response: Response| {
            let _ = response_tx.send(response);
        })
        .await
        .unwrap();
    assert_eq!(node_a.outstanding_requests(), 1);

    let response = tokio::time::timeout(Duration::from_secs(5), response_rx.recv())
        .await
        .expect("timeout delivery timed out")
        .expect("callback channel closed");
    assert!(response.is_timeout());
    assert_eq!(node_a.outstanding_requests(), 0);

    // The timeout path fired exactly once.
    assert!(response_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_transfer_id_exhaustion_backs_off() {
    let (a_read, a_write, b_read, b_write) = streams();
    let node_a = Node::builder()
        .link_config(link_config())
        .node_config(node_config(127))
        .spawn(a_read, a_write)
        .unwrap();
    let _node_b = Node::builder()
        .link_config(link_config())
        .node_config(node_config(1))
        .spawn(b_read, b_write)
        .unwrap();

    for _ in 0..32 {
        node_a
            .request(1, 7, 20, &[0], Arc::new(NullContinuation))
            .await
            .unwrap();
    }
    assert_eq!(node_a.outstanding_requests(), 32);

    // The 33rd concurrent request for the same (peer, type) backs off.
    let result = node_a
        .request(1, 7, 20, &[0], Arc::new(NullContinuation))
        .await;
    assert!(matches!(result, Err(modlink::ModlinkError::Backoff)));

    // A different type is unaffected.
    node_a
        .request(1, 8, 20, &[0], Arc::new(NullContinuation))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_request_many_unwinds_on_exhaustion() {
    let (a_read, a_write, b_read, b_write) = streams();
    let node_a = Node::builder()
        .link_config(link_config())
        .node_config(node_config(127))
        .spawn(a_read, a_write)
        .unwrap();
    let _node_b = Node::builder()
        .link_config(link_config())
        .node_config(node_config(1))
        .spawn(b_read, b_write)
        .unwrap();

    for _ in 0..30 {
        node_a
            .request(1, 7, 20, &[0], Arc::new(NullContinuation))
            .await
            .unwrap();
    }

    // Five payloads cannot fit in the two remaining slots; the claims
    // that did succeed are released again.
    let payloads: Vec<&[u8]> = vec![&[1], &[2], &[3], &[4], &[5]];
    let result = node_a
        .request_many(1, 7, 20, &payloads, Arc::new(NullContinuation))
        .await;
    assert!(matches!(result, Err(modlink::ModlinkError::Backoff)));
    assert_eq!(node_a.outstanding_requests(), 30);
}

#[tokio::test]
async fn test_anonymous_peer_obtains_an_id() {
    // The allocator node on one side, a raw driver standing in for an
    // anonymous peer on the other.
    let (a_read, a_write, b_read, b_write) = streams();
    let _node_a = Node::builder()
        .link_config(link_config())
        .node_config(node_config(127))
        .spawn(a_read, a_write)
        .unwrap();
    let (driver_b, mut inbox_b) = SerialDriver::spawn(b_read, b_write, link_config()).unwrap();

    let unique_id: [u8; 16] = std::array::from_fn(|index| 0x30 + index as u8);

    async fn send_round(driver: &SerialDriver, payload: &[u8]) {
        let mut frame = PartialFrame::new();
        header::write_message(
            &mut frame,
            header::pack_broadcast(0, type_id::ALLOCATION, 20),
            0,
            payload,
        )
        .unwrap();
        driver.submit(frame).await.unwrap();
    }

    async fn next_allocation(inbox: &mut modlink::serial::InboxReceiver) -> Vec<u8> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), inbox.recv())
                .await
                .expect("allocation reply timed out")
                .expect("inbox closed");
            if let Some(message) = header::parse(&frame) {
                if message.kind == header::MessageKind::Broadcast
                    && message.type_id == type_id::ALLOCATION
                {
                    return message.payload.to_vec();
                }
            }
        }
    }

    // Round 1: first six identifier bytes, flagged as a new query.
    let mut round = vec![0x01];
    round.extend_from_slice(&unique_id[0..6]);
    send_round(&driver_b, &round).await;
    let reply = next_allocation(&mut inbox_b).await;
    assert_eq!(reply[0], 0); // Allocation incomplete.
    assert_eq!(&reply[1..7], &unique_id[0..6]);

    // Round 2: next six bytes.
    let mut round = vec![0x00];
    round.extend_from_slice(&unique_id[6..12]);
    send_round(&driver_b, &round).await;
    let reply = next_allocation(&mut inbox_b).await;
    assert_eq!(&reply[1..13], &unique_id[0..12]);

    // Round 3: final four bytes, no preferred ID.
    let mut round = vec![0x00];
    round.extend_from_slice(&unique_id[12..16]);
    send_round(&driver_b, &round).await;
    let reply = next_allocation(&mut inbox_b).await;
    assert_eq!(&reply[1..17], &unique_id);
    // Highest unused dynamic ID.
    assert_eq!((reply[0] & 0xFE) >> 1, 125);
}
