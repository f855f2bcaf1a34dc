// Relay hub integration tests over real sockets.
//
// Covers the registration handshake, close codes, heartbeat handling,
// byte-for-byte fan-out, both liveness mechanisms and fault isolation.

mod common;

use std::time::Duration;

use common::{expect_close, next_text, next_within, wait_for, TestRelay};
use geotrigger::constants::{CLOSE_POLICY_VIOLATION, CLOSE_PROCESSING_ERROR};
use geotrigger::identity::Identity;
use geotrigger::protocol::{heartbeat_frame, LocationUpdate, RegisterMessage};
use geotrigger::relay::PeerRole;
use geotrigger::ws::WsMessage;

#[tokio::test]
async fn test_unauthorized_key_is_rejected() {
    let relay = TestRelay::start(|_| {}).await;
    let (mut writer, mut reader) = relay.connect().await;

    let stranger = Identity::generate();
    writer
        .send_text(&RegisterMessage::signed(&stranger.signing_key).to_frame())
        .await
        .unwrap();

    expect_close(&mut reader, CLOSE_POLICY_VIOLATION, "Unauthorized client").await;
    assert_eq!(relay.registry.authenticated_count(), 0);
    relay.stop().await;
}

#[tokio::test]
async fn test_bad_signature_is_rejected() {
    let relay = TestRelay::start(|_| {}).await;
    let (mut writer, mut reader) = relay.connect().await;

    let mut register = RegisterMessage::signed(&Identity::generate().signing_key);
    register.public_key = relay.agent.public_key_base64();
    writer.send_text(&register.to_frame()).await.unwrap();

    expect_close(&mut reader, CLOSE_POLICY_VIOLATION, "Invalid signature").await;
    relay.stop().await;
}

#[tokio::test]
async fn test_frame_before_registration_is_rejected() {
    let relay = TestRelay::start(|_| {}).await;
    let (mut writer, mut reader) = relay.connect().await;

    writer
        .send_text(&LocationUpdate::now(1.0, 2.0).to_frame(None))
        .await
        .unwrap();

    expect_close(&mut reader, CLOSE_POLICY_VIOLATION, "Expected register message").await;
    relay.stop().await;
}

#[tokio::test]
async fn test_malformed_frame_is_processing_error() {
    let relay = TestRelay::start(|_| {}).await;

    // Before registration
    let (mut writer, mut reader) = relay.connect().await;
    writer.send_text("{definitely not json").await.unwrap();
    expect_close(&mut reader, CLOSE_PROCESSING_ERROR, "Malformed frame").await;

    // After registration
    let (mut writer, mut reader) = relay.connect().await;
    writer
        .send_text(&RegisterMessage::signed(&relay.agent.signing_key).to_frame())
        .await
        .unwrap();
    writer.send_text("\u{1}garbage").await.unwrap();
    expect_close(&mut reader, CLOSE_PROCESSING_ERROR, "Malformed frame").await;

    relay.stop().await;
}

#[tokio::test]
async fn test_registration_timeout_closes_connection() {
    let relay = TestRelay::start(|_| {}).await;
    let (_writer, mut reader) = relay.connect().await;

    expect_close(&mut reader, CLOSE_POLICY_VIOLATION, "Registration timeout").await;
    assert!(wait_for(|| relay.registry.connection_count() == 0).await);
    relay.stop().await;
}

#[tokio::test]
async fn test_heartbeat_consumed_location_forwarded_verbatim() {
    let relay = TestRelay::start(|_| {}).await;

    let (mut pub_writer, mut pub_reader) = relay.connect().await;
    pub_writer
        .send_text(&RegisterMessage::signed(&relay.publisher.signing_key).to_frame())
        .await
        .unwrap();

    let (mut agent_writer, mut agent_reader) = relay.connect().await;
    agent_writer
        .send_text(&RegisterMessage::signed(&relay.agent.signing_key).to_frame())
        .await
        .unwrap();

    assert!(wait_for(|| relay.registry.authenticated_count() == 2).await);

    // Unusual spacing and key order must survive untouched
    let location = r#"{ "timestamp":"2024-05-01T12:00:00.000Z", "type":"location", "longitude":-0.1278, "latitude":51.5074 }"#;
    pub_writer.send_text(&heartbeat_frame()).await.unwrap();
    pub_writer.send_text(location).await.unwrap();

    assert_eq!(next_text(&mut agent_reader).await, location);

    // Agent heartbeats are not forwarded either, and nothing echoes back
    agent_writer.send_text(&heartbeat_frame()).await.unwrap();
    assert!(next_within(&mut pub_reader, Duration::from_millis(300))
        .await
        .is_none());

    relay.stop().await;
}

#[tokio::test]
async fn test_agent_frames_reach_publisher() {
    let relay = TestRelay::start(|_| {}).await;

    let (mut pub_writer, mut pub_reader) = relay.connect().await;
    pub_writer
        .send_text(&RegisterMessage::signed(&relay.publisher.signing_key).to_frame())
        .await
        .unwrap();
    let (mut agent_writer, _agent_reader) = relay.connect().await;
    agent_writer
        .send_text(&RegisterMessage::signed(&relay.agent.signing_key).to_frame())
        .await
        .unwrap();
    assert!(wait_for(|| relay.registry.authenticated_count() == 2).await);

    let status = r#"{"type":"status","ok":true}"#;
    agent_writer.send_text(status).await.unwrap();
    assert_eq!(next_text(&mut pub_reader).await, status);

    relay.stop().await;
}

#[tokio::test]
async fn test_unregistered_peer_receives_nothing() {
    let relay = TestRelay::start(|config| {
        config.registration_timeout = Duration::from_secs(5);
    })
    .await;

    let (mut pub_writer, _pub_reader) = relay.connect().await;
    pub_writer
        .send_text(&RegisterMessage::signed(&relay.publisher.signing_key).to_frame())
        .await
        .unwrap();
    let (_lurker_writer, mut lurker_reader) = relay.connect().await;
    assert!(wait_for(|| relay.registry.connection_count() == 2).await);
    assert!(wait_for(|| relay.registry.authenticated_count() == 1).await);

    pub_writer
        .send_text(&LocationUpdate::now(1.0, 2.0).to_frame(None))
        .await
        .unwrap();
    assert!(next_within(&mut lurker_reader, Duration::from_millis(300))
        .await
        .is_none());

    relay.stop().await;
}

#[tokio::test]
async fn test_silent_connection_is_terminated() {
    let relay = TestRelay::start(|config| {
        config.liveness_window = Duration::from_millis(300);
    })
    .await;

    let (mut writer, mut reader) = relay.connect().await;
    writer
        .send_text(&RegisterMessage::signed(&relay.agent.signing_key).to_frame())
        .await
        .unwrap();
    assert!(wait_for(|| relay.registry.authenticated_count() == 1).await);

    // Terminated without a closing handshake: the stream errors or ends
    match next_within(&mut reader, Duration::from_secs(3)).await {
        Some(None | Some(Err(_))) => {}
        other => panic!("expected unclean termination, got {other:?}"),
    }
    assert_eq!(relay.registry.authenticated_count(), 0);
    relay.stop().await;
}

#[tokio::test]
async fn test_heartbeats_keep_connection_alive() {
    let relay = TestRelay::start(|config| {
        config.liveness_window = Duration::from_millis(300);
    })
    .await;

    let (mut writer, _reader) = relay.connect().await;
    writer
        .send_text(&RegisterMessage::signed(&relay.agent.signing_key).to_frame())
        .await
        .unwrap();
    assert!(wait_for(|| relay.registry.authenticated_count() == 1).await);

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        writer.send_text(&heartbeat_frame()).await.unwrap();
    }
    assert_eq!(relay.registry.authenticated_count(), 1);
    relay.stop().await;
}

#[tokio::test]
async fn test_sweep_spares_peer_inside_liveness_window() {
    let relay = TestRelay::start(|config| {
        config.liveness_window = Duration::from_millis(400);
        config.sweep_interval = Duration::from_millis(150);
    })
    .await;

    let (mut writer, _reader) = relay.connect().await;
    writer
        .send_text(&RegisterMessage::signed(&relay.agent.signing_key).to_frame())
        .await
        .unwrap();
    assert!(wait_for(|| relay.registry.authenticated_count() == 1).await);

    // Heartbeat gaps longer than the sweep interval but inside the window
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        writer.send_text(&heartbeat_frame()).await.unwrap();
    }
    assert_eq!(relay.registry.roles(), vec![PeerRole::Agent]);
    relay.stop().await;
}

#[tokio::test]
async fn test_sweep_pings_keep_reading_peer_alive() {
    let relay = TestRelay::start(|config| {
        config.liveness_window = Duration::from_millis(300);
        config.sweep_interval = Duration::from_millis(100);
    })
    .await;

    let (mut writer, mut reader) = relay.connect().await;
    writer
        .send_text(&RegisterMessage::signed(&relay.agent.signing_key).to_frame())
        .await
        .unwrap();
    assert!(wait_for(|| relay.registry.authenticated_count() == 1).await);

    // Never sends a frame of its own; the pong to each sweep ping counts
    let mut pings = 0;
    let until = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < until {
        match next_within(&mut reader, Duration::from_millis(50)).await {
            Some(Some(Ok(WsMessage::Ping(_)))) => pings += 1,
            None => {}
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(pings >= 3, "got {pings} pings");
    assert_eq!(relay.registry.authenticated_count(), 1);
    relay.stop().await;
}

#[tokio::test]
async fn test_peer_that_stops_reading_is_terminated() {
    let relay = TestRelay::start(|config| {
        config.liveness_window = Duration::from_millis(500);
        config.sweep_interval = Duration::from_millis(400);
    })
    .await;

    let (mut pub_writer, _pub_reader) = relay.connect().await;
    pub_writer
        .send_text(&RegisterMessage::signed(&relay.publisher.signing_key).to_frame())
        .await
        .unwrap();
    let (mut agent_writer, _agent_reader) = relay.connect().await;
    agent_writer
        .send_text(&RegisterMessage::signed(&relay.agent.signing_key).to_frame())
        .await
        .unwrap();
    assert!(wait_for(|| relay.registry.authenticated_count() == 2).await);

    // The agent never reads again; flood it until its socket backs up
    let padding = "x".repeat(64 * 1024);
    let frame = format!(r#"{{"type":"location","padding":"{padding}"}}"#);
    let until = tokio::time::Instant::now() + Duration::from_millis(1500);
    while tokio::time::Instant::now() < until {
        if pub_writer.send_text(&frame).await.is_err() {
            break;
        }
    }

    assert!(wait_for(|| relay.registry.roles() == vec![PeerRole::Publisher]).await);
    relay.stop().await;
}

#[tokio::test]
async fn test_second_register_is_rejected() {
    let relay = TestRelay::start(|_| {}).await;
    let (mut writer, mut reader) = relay.connect().await;
    let register = RegisterMessage::signed(&relay.agent.signing_key).to_frame();

    writer.send_text(&register).await.unwrap();
    writer.send_text(&register).await.unwrap();

    expect_close(&mut reader, CLOSE_POLICY_VIOLATION, "Already registered").await;
    relay.stop().await;
}

#[tokio::test]
async fn test_required_payload_signatures() {
    let relay = TestRelay::start(|config| {
        config.require_signed_payloads = true;
    })
    .await;

    let (mut agent_writer, mut agent_reader) = relay.connect().await;
    agent_writer
        .send_text(&RegisterMessage::signed(&relay.agent.signing_key).to_frame())
        .await
        .unwrap();

    let (mut pub_writer, mut pub_reader) = relay.connect().await;
    pub_writer
        .send_text(&RegisterMessage::signed(&relay.publisher.signing_key).to_frame())
        .await
        .unwrap();
    assert!(wait_for(|| relay.registry.authenticated_count() == 2).await);

    let signed = LocationUpdate::now(1.0, 2.0).to_frame(Some(&relay.publisher.signing_key));
    pub_writer.send_text(&signed).await.unwrap();
    assert_eq!(next_text(&mut agent_reader).await, signed);

    // Heartbeats need no signature
    pub_writer.send_text(&heartbeat_frame()).await.unwrap();

    pub_writer
        .send_text(&LocationUpdate::now(3.0, 4.0).to_frame(None))
        .await
        .unwrap();
    expect_close(&mut pub_reader, CLOSE_POLICY_VIOLATION, "Invalid signature").await;

    relay.stop().await;
}

#[tokio::test]
async fn test_ping_is_answered() {
    let relay = TestRelay::start(|_| {}).await;
    let (mut writer, mut reader) = relay.connect().await;
    writer
        .send_text(&RegisterMessage::signed(&relay.agent.signing_key).to_frame())
        .await
        .unwrap();
    assert!(wait_for(|| relay.registry.authenticated_count() == 1).await);

    writer.send_ping(b"are you there".to_vec()).await.unwrap();
    match next_within(&mut reader, Duration::from_secs(2)).await {
        Some(Some(Ok(WsMessage::Pong(data)))) => assert_eq!(data, b"are you there"),
        other => panic!("expected pong, got {other:?}"),
    }
    relay.stop().await;
}

#[tokio::test]
async fn test_health_probe_answers_plain_http() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let relay = TestRelay::start(|_| {}).await;
    let addr = relay.url.trim_start_matches("ws://").to_string();

    let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: relay\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.ends_with(r#"{"status":"ok"}"#), "{response}");
    assert_eq!(relay.registry.connection_count(), 0);

    relay.stop().await;
}

#[tokio::test]
async fn test_invalid_utf8_text_is_processing_error() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode};
    use tokio_tungstenite::tungstenite::protocol::frame::Frame;
    use tokio_tungstenite::tungstenite::Message;

    let relay = TestRelay::start(|_| {}).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(relay.url.as_str())
        .await
        .unwrap();

    let register = RegisterMessage::signed(&relay.agent.signing_key).to_frame();
    socket.send(Message::Text(register)).await.unwrap();
    assert!(wait_for(|| relay.registry.authenticated_count() == 1).await);

    let garbage = Frame::message(vec![0xff, 0xfe, b'{', b'}'], OpCode::Data(Data::Text), true);
    socket.send(Message::Frame(garbage)).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(3), socket.next())
        .await
        .unwrap();
    match reply {
        Some(Ok(Message::Close(Some(close)))) => {
            assert_eq!(u16::from(close.code), CLOSE_PROCESSING_ERROR);
            assert_eq!(close.reason, "Malformed frame");
        }
        other => panic!("expected close 1011, got {other:?}"),
    }
    relay.stop().await;
}

#[tokio::test]
async fn test_faulty_peer_does_not_disturb_others() {
    let relay = TestRelay::start(|config| {
        config.registration_timeout = Duration::from_secs(5);
    })
    .await;

    let (mut pub_writer, _pub_reader) = relay.connect().await;
    pub_writer
        .send_text(&RegisterMessage::signed(&relay.publisher.signing_key).to_frame())
        .await
        .unwrap();
    let (mut agent_writer, mut agent_reader) = relay.connect().await;
    agent_writer
        .send_text(&RegisterMessage::signed(&relay.agent.signing_key).to_frame())
        .await
        .unwrap();
    assert!(wait_for(|| relay.registry.authenticated_count() == 2).await);

    let (mut rogue_writer, mut rogue_reader) = relay.connect().await;
    rogue_writer.send_text("{{{ not json").await.unwrap();
    expect_close(&mut rogue_reader, CLOSE_PROCESSING_ERROR, "Malformed frame").await;
    assert!(wait_for(|| relay.registry.connection_count() == 2).await);

    let location = r#"{"type":"location","latitude":10.5,"longitude":-3.25,"timestamp":"2024-05-01T12:00:00.000Z"}"#;
    pub_writer.send_text(location).await.unwrap();
    assert_eq!(next_text(&mut agent_reader).await, location);
    assert_eq!(
        relay.registry.roles(),
        vec![PeerRole::Publisher, PeerRole::Agent]
    );

    relay.stop().await;
}
