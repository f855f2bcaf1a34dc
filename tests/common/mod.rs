// Shared helpers for the relay integration tests.
//
// Every test binds its own relay on 127.0.0.1:0 with short timers so tests
// can run in parallel without port clashes.

#![allow(dead_code)]

use std::time::Duration;

use geotrigger::config::RelayConfig;
use geotrigger::identity::Identity;
use geotrigger::relay::{PeerRegistry, RelayServer};
use geotrigger::ws::{self, WsMessage, WsReader, WsWriter};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A relay running in the background with one publisher and one agent key.
pub struct TestRelay {
    pub url: String,
    pub publisher: Identity,
    pub agent: Identity,
    pub registry: PeerRegistry,
    shutdown: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestRelay {
    /// Start a relay; `tweak` adjusts the config before binding.
    pub async fn start(tweak: impl FnOnce(&mut RelayConfig)) -> Self {
        let publisher = Identity::generate();
        let agent = Identity::generate();

        let mut config = RelayConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            publisher_key: publisher.public_key_base64(),
            agent_keys: vec![agent.public_key_base64()],
            registration_timeout: Duration::from_millis(300),
            liveness_window: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            ..RelayConfig::default()
        };
        tweak(&mut config);

        let server = RelayServer::bind(&config).await.unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        let registry = server.registry();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));

        Self {
            url,
            publisher,
            agent,
            registry,
            shutdown,
            task,
        }
    }

    /// Open a raw WebSocket to the relay.
    pub async fn connect(&self) -> (WsWriter, WsReader) {
        ws::connect(&self.url).await.unwrap()
    }

    /// Stop the relay and wait for it.
    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

/// Next message within `limit`, `None` on timeout.
pub async fn next_within(reader: &mut WsReader, limit: Duration) -> Option<Option<anyhow::Result<WsMessage>>> {
    tokio::time::timeout(limit, reader.recv()).await.ok()
}

/// Next text frame, skipping control frames.
pub async fn next_text(reader: &mut WsReader) -> String {
    loop {
        match next_within(reader, Duration::from_secs(2)).await {
            Some(Some(Ok(WsMessage::Text(text)))) => return text,
            Some(Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_)))) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

/// Assert the relay closes the connection with `code` and `reason`.
pub async fn expect_close(reader: &mut WsReader, code: u16, reason: &str) {
    match next_within(reader, Duration::from_secs(3)).await {
        Some(Some(Ok(WsMessage::Close {
            code: got_code,
            reason: got_reason,
        }))) => {
            assert_eq!(got_code, code);
            assert_eq!(got_reason, reason);
        }
        other => panic!("expected close {code} {reason}, got {other:?}"),
    }
}

/// Poll `condition` every 10ms for up to 3s.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
