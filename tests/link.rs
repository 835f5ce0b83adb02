//! Link-level integration tests: two drivers conversing over in-memory
//! streams, including a lossy relay exercising the retransmit window.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use modlink::link::{command, PartialFrame};
use modlink::serial::SerialDriver;
use modlink::LinkConfig;

fn test_config() -> LinkConfig {
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

fn message_frame(payload: &[u8]) -> PartialFrame {
    let mut frame = PartialFrame::new();
    frame.write(command::MESSAGE).unwrap();
    frame.write_slice(payload).unwrap();
    frame
}

/// Forward bytes from `reader` to `writer`, dropping every `drop_nth`
/// complete wire frame (delimited by 0x00).
async fn lossy_relay<R, W>(mut reader: R, mut writer: W, drop_nth: u64)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut pending: Vec<u8> = Vec::new();
    let mut counter = 0u64;
    let mut chunk = [0u8; 4096];
    loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(read) => read,
        };
        pending.extend_from_slice(&chunk[..read]);
        while let Some(position) = pending.iter().position(|&b| b == 0x00) {
            let frame: Vec<u8> = pending.drain(..=position).collect();
            counter += 1;
            if counter % drop_nth == 0 {
                continue; // Lost in transit.
            }
            if writer.write_all(&frame).await.is_err() {
                return;
            }
            let _ = writer.flush().await;
        }
    }
}

#[tokio::test]
async fn test_delivery_survives_frame_loss() {
    // A talks to B through a relay that drops every 5th frame in each
    // direction, including handshake and acknowledgement traffic.
    let (a_local, a_remote) = tokio::io::duplex(65536);
    let (b_local, b_remote) = tokio::io::duplex(65536);
    let (a_remote_read, a_remote_write) = tokio::io::split(a_remote);
    let (b_remote_read, b_remote_write) = tokio::io::split(b_remote);
    tokio::spawn(lossy_relay(a_remote_read, b_remote_write, 5));
    tokio::spawn(lossy_relay(b_remote_read, a_remote_write, 5));

    let (a_read, a_write) = tokio::io::split(a_local);
    let (b_read, b_write) = tokio::io::split(b_local);
    let (driver_a, _inbox_a) = SerialDriver::spawn(a_read, a_write, test_config()).unwrap();
    let (_driver_b, mut inbox_b) = SerialDriver::spawn(b_read, b_write, test_config()).unwrap();

    for index in 0..20u8 {
        driver_a
            .submit(message_frame(&[index, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE]))
            .await
            .unwrap();
    }

    // Every frame is still delivered exactly once, in order.
    let mut received = Vec::new();
    while received.len() < 20 {
        let frame = tokio::time::timeout(Duration::from_secs(30), inbox_b.recv())
            .await
            .expect("delivery over lossy link timed out")
            .expect("inbox closed");
        assert_eq!(frame.as_slice()[1], command::MESSAGE);
        received.push(frame.as_slice()[2]);
    }
    assert_eq!(received, (0..20u8).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_bidirectional_traffic() {
    let (side_a, side_b) = tokio::io::duplex(65536);
    let (a_read, a_write) = tokio::io::split(side_a);
    let (b_read, b_write) = tokio::io::split(side_b);
    let (driver_a, mut inbox_a) = SerialDriver::spawn(a_read, a_write, test_config()).unwrap();
    let (driver_b, mut inbox_b) = SerialDriver::spawn(b_read, b_write, test_config()).unwrap();

    driver_a
        .submit(message_frame(b"from-a"))
        .await
        .unwrap();
    driver_b
        .submit(message_frame(b"from-b"))
        .await
        .unwrap();

    let at_b = tokio::time::timeout(Duration::from_secs(5), inbox_b.recv())
        .await
        .expect("delivery timed out")
        .expect("inbox closed");
    assert_eq!(&at_b.as_slice()[2..8], b"from-a");

    let at_a = tokio::time::timeout(Duration::from_secs(5), inbox_a.recv())
        .await
        .expect("delivery timed out")
        .expect("inbox closed");
    assert_eq!(&at_a.as_slice()[2..8], b"from-b");
}

#[tokio::test]
async fn test_queueing_ahead_of_handshake() {
    // Frames submitted before the handshake completes are buffered by
    // the collector and window, then delivered once the link comes up.
    let (side_a, side_b) = tokio::io::duplex(65536);
    let (a_read, a_write) = tokio::io::split(side_a);
    let (driver_a, _inbox_a) = SerialDriver::spawn(a_read, a_write, test_config()).unwrap();

    driver_a.submit(message_frame(b"early!")).await.unwrap();

    // Bring up the peer only afterwards.
    let (b_read, b_write) = tokio::io::split(side_b);
    let (_driver_b, mut inbox_b) = SerialDriver::spawn(b_read, b_write, test_config()).unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), inbox_b.recv())
        .await
        .expect("delivery timed out")
        .expect("inbox closed");
    assert_eq!(&frame.as_slice()[2..8], b"early!");
}
