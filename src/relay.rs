//! Broadcast relay: every accepted connection is a peer, and every received
//! message is fanned out, unmodified, to every open peer, including the
//! sender unless `echo_to_sender` is off. Stateless: no persistence, no
//! rooms, no authentication, no backpressure (payloads are small and
//! frame-rate bounded; per-peer outbound queues are unbounded by design).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::protocol;

type Peers = Arc<Mutex<BTreeMap<u64, mpsc::UnboundedSender<Bytes>>>>;

/// Accept connections and serve until cancelled.
pub async fn serve(listener: TcpListener, config: RelayConfig, cancel: CancellationToken) -> Result<()> {
    let peers: Peers = Arc::new(Mutex::new(BTreeMap::new()));
    let mut next_id: u64 = 0;

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        next_id += 1;
        let id = next_id;
        log::info!("peer {id} connected from {peer_addr}");

        let _ = stream.set_nodelay(true);
        tokio::spawn(handle_peer(
            id,
            stream,
            Arc::clone(&peers),
            config.clone(),
            cancel.clone(),
        ));
    }

    Ok(())
}

/// Read messages from one peer and fan each out to all registered peers.
/// Per-sender ordering is preserved: this is the only reader of the socket,
/// and it enqueues into every outbound queue before reading the next
/// message.
async fn handle_peer(
    id: u64,
    stream: TcpStream,
    peers: Peers,
    config: RelayConfig,
    cancel: CancellationToken,
) {
    let framed = protocol::framed_with_max(stream, config.max_frame_length);
    let (mut sink, mut reader) = framed.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    peers.lock().unwrap().insert(id, tx);

    // writer: drain the outbound queue into the socket
    let writer = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if sink.send(bytes).await.is_err() {
                break;
            }
        }
    });

    loop {
        let incoming = tokio::select! {
            _ = cancel.cancelled() => None,
            incoming = reader.next() => incoming,
        };
        match incoming {
            Some(Ok(bytes)) => {
                let payload = bytes.freeze();
                let peers = peers.lock().unwrap();
                for (peer_id, outbound) in peers.iter() {
                    if !config.echo_to_sender && *peer_id == id {
                        continue;
                    }
                    let _ = outbound.send(payload.clone());
                }
            }
            Some(Err(e)) => {
                log::warn!("peer {id} read error: {e}");
                break;
            }
            None => break,
        }
    }

    peers.lock().unwrap().remove(&id);
    writer.abort();
    log::info!("peer {id} disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::{ImageSize, Keypoint, Part, Pose, PoseFrame};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn start_relay(config: RelayConfig) -> (std::net::SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, config, cancel.clone()));
        (addr, cancel)
    }

    async fn connect(addr: std::net::SocketAddr) -> protocol::MessageStream {
        let sock = TcpStream::connect(addr).await.unwrap();
        protocol::message_stream(sock)
    }

    fn tagged_frame(score: f32) -> PoseFrame {
        PoseFrame::new(
            vec![Pose::new(
                score,
                vec![Keypoint::new(Part::Nose, 0.0, 0.0, score)],
            )],
            ImageSize {
                width: 640,
                height: 480,
            },
        )
    }

    async fn recv(stream: &mut protocol::MessageStream) -> PoseFrame {
        timeout(Duration::from_secs(5), protocol::recv_frame(stream))
            .await
            .expect("timed out waiting for relayed frame")
            .unwrap()
            .expect("peer closed")
    }

    #[tokio::test]
    async fn test_fan_out_reaches_all_peers_including_sender() {
        let (addr, _cancel) = start_relay(RelayConfig::default()).await;

        let mut a = connect(addr).await;
        let mut b = connect(addr).await;
        let mut c = connect(addr).await;
        // registration is asynchronous to the connect call; a short grace
        // period keeps the peer set deterministic for the assertion
        tokio::time::sleep(Duration::from_millis(100)).await;

        let frame = tagged_frame(0.5);
        protocol::send_frame(&mut a, &frame).await.unwrap();

        assert_eq!(recv(&mut a).await, frame, "sender receives its own echo");
        assert_eq!(recv(&mut b).await, frame);
        assert_eq!(recv(&mut c).await, frame);
    }

    #[tokio::test]
    async fn test_fan_out_preserves_per_sender_order() {
        let (addr, _cancel) = start_relay(RelayConfig::default()).await;

        let mut a = connect(addr).await;
        let mut b = connect(addr).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        for i in 0..10 {
            protocol::send_frame(&mut a, &tagged_frame(i as f32 / 10.0))
                .await
                .unwrap();
        }
        for i in 0..10 {
            let frame = recv(&mut b).await;
            assert_eq!(frame.poses[0].score, i as f32 / 10.0);
        }
        // exactly once: nothing further arrives
        let extra = timeout(Duration::from_millis(200), protocol::recv_frame(&mut b)).await;
        assert!(extra.is_err(), "no duplicate deliveries");
    }

    #[tokio::test]
    async fn test_echo_suppression_when_configured_off() {
        let config = RelayConfig {
            echo_to_sender: false,
            ..RelayConfig::default()
        };
        let (addr, _cancel) = start_relay(config).await;

        let mut a = connect(addr).await;
        let mut b = connect(addr).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let frame = tagged_frame(0.5);
        protocol::send_frame(&mut a, &frame).await.unwrap();

        assert_eq!(recv(&mut b).await, frame);
        let echo = timeout(Duration::from_millis(200), protocol::recv_frame(&mut a)).await;
        assert!(echo.is_err(), "sender must not receive its own message");
    }

    #[tokio::test]
    async fn test_departed_peer_is_removed_from_fan_out() {
        let (addr, _cancel) = start_relay(RelayConfig::default()).await;

        let mut a = connect(addr).await;
        let b = connect(addr).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(b);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let frame = tagged_frame(0.9);
        protocol::send_frame(&mut a, &frame).await.unwrap();
        assert_eq!(recv(&mut a).await, frame, "remaining peers still served");
    }

    #[tokio::test]
    async fn test_relay_payload_passes_through_byte_for_byte() {
        // the relay must not care whether payloads are valid pose frames
        let (addr, _cancel) = start_relay(RelayConfig::default()).await;

        let mut a = connect(addr).await;
        let mut b = connect(addr).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        a.send(Bytes::from_static(b"opaque payload")).await.unwrap();
        let received = timeout(Duration::from_secs(5), b.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&received[..], b"opaque payload");
    }

    #[tokio::test]
    async fn test_cancel_stops_accepting() {
        let (addr, cancel) = start_relay(RelayConfig::default()).await;
        let _existing = connect(addr).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // new connections are refused or immediately closed once the accept
        // loop has exited
        match TcpStream::connect(addr).await {
            Err(_) => {}
            Ok(sock) => {
                let mut framed = protocol::message_stream(sock);
                let eof = timeout(Duration::from_secs(1), framed.next()).await;
                match eof {
                    Ok(None) | Ok(Some(Err(_))) => {}
                    Ok(Some(Ok(_))) => panic!("unexpected frame after shutdown"),
                    Err(_) => {} // no listener backlog service; acceptable
                }
            }
        }
    }
}
