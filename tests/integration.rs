//! End-to-end scenarios driven against a real `Client`, playing the role
//! of a single remote peer over a loopback TCP socket.

use std::sync::Arc;
use std::time::Duration;

use eosio_p2p_core::client::{Client, ClientOptions};
use eosio_p2p_core::peer::PeerConfig;
use eosio_p2p_core::store::{BlockStore, InMemoryBlockStore};
use eosio_p2p_core::wire::message::{
    GoAwayMessage, GoAwayReason, HandshakeMessage, Message, SignedBlock,
};
use eosio_p2p_core::wire::types::{Checksum256, PublicKey, Signature, Timestamp};
use eosio_p2p_core::wire::{self, Packet};
use tokio::net::{TcpListener, TcpStream};

fn chain_id_hex() -> String {
    "0".repeat(64)
}

fn remote_handshake(head_num: u32) -> Message {
    Message::Handshake(HandshakeMessage {
        network_version: 1206,
        chain_id: Checksum256::zero(),
        node_id: Checksum256([9; 32]),
        key: PublicKey::sentinel(),
        time: Timestamp::zero(),
        token: Checksum256::zero(),
        sig: Signature::zero(),
        p2p_address: "remote".into(),
        last_irreversible_block_num: 0,
        last_irreversible_block_id: Checksum256::zero(),
        head_num,
        head_id: Checksum256::zero(),
        os: "linux".into(),
        agent: "remote-test-peer".into(),
        generation: 1,
    })
}

fn block(n: u32) -> SignedBlock {
    SignedBlock {
        block_number: n,
        block_id: Checksum256([n as u8; 32]),
        previous: Checksum256([n.wrapping_sub(1) as u8; 32]),
        timestamp: Timestamp(n as u64),
        body: Vec::new(),
    }
}

async fn read_sync_request(stream: &mut TcpStream) -> (u32, u32) {
    let packet: Packet = wire::read_packet(stream).await.unwrap();
    match packet.message {
        Message::SyncRequest(m) => (m.start_block, m.end_block),
        other => panic!("expected a sync request, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn catch_up_single_window_then_announces_sync_finished() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let store = Arc::new(InMemoryBlockStore::new(Checksum256::zero(), 1));
    let options = ClientOptions::new()
        .with_need_sync(1)
        .with_storer(store.clone())
        .with_dial_timeout(Duration::from_secs(2));

    let _client = Client::new(
        &chain_id_hex(),
        vec![PeerConfig {
            name: None,
            address: addr.to_string(),
        }],
        options,
    )
    .unwrap();

    let (mut stream, _) = listener.accept().await.unwrap();

    // The client dials and sends its own handshake first.
    let initial = wire::read_packet(&mut stream).await.unwrap();
    assert!(matches!(initial.message, Message::Handshake(_)));

    // The remote peer then announces its head: 10 blocks, well within
    // one window, so the client should ask for all of them at once.
    wire::write_packet(&mut stream, &remote_handshake(10))
        .await
        .unwrap();

    let (start, end) = read_sync_request(&mut stream).await;
    assert_eq!((start, end), (1, 11));

    for n in 1..=10 {
        wire::write_packet(&mut stream, &Message::SignedBlock(block(n)))
            .await
            .unwrap();
    }

    // Catch-up completion is signaled by a fresh handshake reflecting
    // the new head.
    let finish = wire::read_packet(&mut stream).await.unwrap();
    match finish.message {
        Message::Handshake(h) => {
            assert_eq!(h.head_num, 10);
            assert_eq!(h.head_id, Checksum256([10; 32]));
        }
        other => panic!("expected the post-catch-up handshake, got {other:?}"),
    }

    assert_eq!(store.head_block_num(), 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn go_away_closes_the_peer_and_the_supervisor_redials() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let options = ClientOptions::new().with_dial_timeout(Duration::from_millis(200));
    let _client = Client::new(
        &chain_id_hex(),
        vec![PeerConfig {
            name: None,
            address: addr.to_string(),
        }],
        options,
    )
    .unwrap();

    let (mut stream, _) = listener.accept().await.unwrap();
    let _ = wire::read_packet(&mut stream).await.unwrap();

    wire::write_packet(
        &mut stream,
        &Message::GoAway(GoAwayMessage {
            reason: GoAwayReason::Duplicate,
            node_id: Checksum256::zero(),
        }),
    )
    .await
    .unwrap();

    // The client closes the connection; the read side observes EOF.
    let mut buf = [0u8; 1];
    use tokio::io::AsyncReadExt;
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);

    // Supervisor redial backoff has a 3s floor; a fresh inbound
    // connection attempt within that window confirms the peer wasn't
    // abandoned, and that a redial was actually scheduled.
    let (mut second, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("supervisor should redial the peer")
        .unwrap();
    let reconnect_handshake = wire::read_packet(&mut second).await.unwrap();
    assert!(matches!(reconnect_handshake.message, Message::Handshake(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_frame_closes_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let options = ClientOptions::new().with_dial_timeout(Duration::from_millis(200));
    let _client = Client::new(
        &chain_id_hex(),
        vec![PeerConfig {
            name: None,
            address: addr.to_string(),
        }],
        options,
    )
    .unwrap();

    let (mut stream, _) = listener.accept().await.unwrap();
    let _ = wire::read_packet(&mut stream).await.unwrap();

    use tokio::io::AsyncWriteExt;
    let oversized_length: u32 = wire::MAX_PACKET_LENGTH + 1;
    stream
        .write_all(&oversized_length.to_le_bytes())
        .await
        .unwrap();

    // The client must reject the frame before reading (and definitely
    // before allocating) the advertised body, then close. The socket
    // becomes either unwritable or EOF-on-read shortly after.
    tokio::time::sleep(Duration::from_millis(100)).await;
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 1];
    let result = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf)).await;
    match result {
        Ok(Ok(n)) => assert_eq!(n, 0, "expected end-of-stream after the oversized frame"),
        Ok(Err(_)) => {}
        Err(_) => panic!("client never closed the connection after the oversized frame"),
    }
}
