use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

use lora_replay::error::ReplayError;
use lora_replay::generator::{generate_records, GeneratorParams};
use lora_replay::replay::{JobStatus, LineStatus, ReplayJobManager, ReplayParams, ReplayStatus};
use lora_replay::store::InMemoryTokenStore;
use lora_replay::udp::protocol::{GwmpPacket, PushDataPayload};

async fn recv_fcnt(socket: &UdpSocket) -> u16 {
    let mut buf = vec![0u8; 2048];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for PUSH_DATA")
        .unwrap();

    let GwmpPacket::PushData { json_payload, .. } = GwmpPacket::parse(&buf[..len]).unwrap() else {
        panic!("expected PUSH_DATA");
    };
    let payload: PushDataPayload = serde_json::from_str(&json_payload).unwrap();
    let rxpk = &payload.rxpk.unwrap()[0];
    let phy = rxpk.phy_payload().unwrap();
    lora_replay::lorawan::parse_phy_payload(&phy).unwrap().fcnt
}

async fn wait_for(manager: &ReplayJobManager, token: &str, status: JobStatus) -> ReplayStatus {
    for _ in 0..500 {
        let current = manager.status(token, 0).await.unwrap();
        if current.status == status {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("replay {} never reached {:?}", token, status);
}

#[tokio::test]
async fn test_stop_then_resume_sends_every_record_once() {
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let records = generate_records(&GeneratorParams {
        frames: 10,
        ..Default::default()
    })
    .unwrap();

    let manager = ReplayJobManager::new(Arc::new(InMemoryTokenStore::default()));
    let params = ReplayParams {
        host: "127.0.0.1".to_string(),
        port: receiver.local_addr().unwrap().port(),
        delay_ms: 50,
        override_rxpk: false,
    };
    let first = manager.start(Arc::new(records), params).await.unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(recv_fcnt(&receiver).await);
    }
    manager.stop(&first).await.unwrap();

    let second = manager.resume(&first).await.unwrap();
    assert_ne!(second, first);

    let stopped = manager.status(&first, 0).await.unwrap();
    assert_eq!(stopped.status, JobStatus::Stopped);
    assert_eq!(stopped.current_index, 3);
    assert_eq!(stopped.sent, 3);

    for _ in 0..7 {
        received.push(recv_fcnt(&receiver).await);
    }
    assert_eq!(received, (0..10).collect::<Vec<u16>>());

    let done = wait_for(&manager, &second, JobStatus::Done).await;
    assert_eq!(done.sent, 10);
    assert_eq!(done.errors, 0);
    assert_eq!(done.current_index, 10);

    let indices: Vec<usize> = done
        .lines
        .iter()
        .filter(|line| matches!(line.status, LineStatus::Sent | LineStatus::Error))
        .filter_map(|line| line.index)
        .collect();
    assert_eq!(indices, (1..=10).collect::<Vec<usize>>());
    assert_eq!(
        done.lines
            .iter()
            .filter(|line| line.status == LineStatus::Stopped)
            .count(),
        1
    );

    // Nothing beyond the ten records
    let mut buf = [0u8; 64];
    assert!(
        tokio::time::timeout(Duration::from_millis(200), receiver.recv_from(&mut buf))
            .await
            .is_err()
    );
}

fn sent_indices(status: &ReplayStatus) -> Vec<usize> {
    status
        .lines
        .iter()
        .filter(|line| matches!(line.status, LineStatus::Sent | LineStatus::Error))
        .filter_map(|line| line.index)
        .collect()
}

#[tokio::test]
async fn test_immediate_resume_waits_for_in_flight_send() {
    const FRAMES: usize = 50;

    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let records = Arc::new(
        generate_records(&GeneratorParams {
            frames: FRAMES as u32,
            ..Default::default()
        })
        .unwrap(),
    );
    let manager = ReplayJobManager::new(Arc::new(InMemoryTokenStore::default()));
    let params = ReplayParams {
        host: "127.0.0.1".to_string(),
        port: receiver.local_addr().unwrap().port(),
        delay_ms: 0,
        override_rxpk: false,
    };

    for round in 0..20 {
        let first = manager.start(records.clone(), params.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_micros(300)).await;
        manager.stop(&first).await.unwrap();

        let last = match manager.resume(&first).await {
            Ok(second) => {
                // Everything the first worker sent is in the history handed over
                let before = manager.status(&first, 0).await.unwrap();
                assert_eq!(
                    sent_indices(&before),
                    (1..=before.current_index).collect::<Vec<_>>()
                );
                second
            }
            // Finished before the stop landed
            Err(ReplayError::NotResumable(status)) => {
                assert_eq!(status, "done", "round {}", round);
                first
            }
            Err(e) => panic!("round {}: {}", round, e),
        };

        let done = wait_for(&manager, &last, JobStatus::Done).await;
        assert_eq!(done.sent, FRAMES, "round {}", round);
        assert_eq!(done.errors, 0);
        assert_eq!(sent_indices(&done), (1..=FRAMES).collect::<Vec<_>>());

        let mut fcnts = Vec::new();
        for _ in 0..FRAMES {
            fcnts.push(recv_fcnt(&receiver).await);
        }
        fcnts.sort_unstable();
        assert_eq!(fcnts, (0..FRAMES as u16).collect::<Vec<_>>(), "round {}", round);

        let mut buf = [0u8; 64];
        assert!(
            tokio::time::timeout(Duration::from_millis(50), receiver.recv_from(&mut buf))
                .await
                .is_err(),
            "round {}: record sent twice",
            round
        );
    }
}
