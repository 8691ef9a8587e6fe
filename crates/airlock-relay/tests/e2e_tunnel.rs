//! End-to-end tunnel tests: a real relay, a real agent, real sockets
//!
//! Wires the axum relay and the WebSocket agent together on loopback and
//! drives external TCP clients against the relay's port listeners.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use airlock_agent::{Agent, AgentConfig, ReconnectConfig};
use airlock_config::ForwarderConfig;
use airlock_relay::listener::PortListener;
use airlock_relay::{server, RelayState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

/// Spawn a TCP echo service and return its address.
async fn echo_service() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = conn.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// Start a relay (no TLS) and return its state and HTTP address.
async fn start_relay(token: &str) -> (Arc<RelayState>, SocketAddr) {
    let state = Arc::new(RelayState::new(token));
    let app = server::router(state.clone());
    let handle = axum_server::Handle::new();

    let server_handle = handle.clone();
    tokio::spawn(async move {
        axum_server::bind("127.0.0.1:0".parse().unwrap())
            .handle(server_handle)
            .serve(app.into_make_service())
            .await
            .unwrap();
    });

    let addr = handle.listening().await.expect("relay failed to bind");
    (state, addr)
}

/// Reserve a port for a forwarder listener.
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn agent_config(relay_addr: SocketAddr, token: &str, agent_id: &str) -> AgentConfig {
    AgentConfig {
        server_url: format!("ws://{relay_addr}/tunnel"),
        auth_token: token.to_string(),
        agent_id: agent_id.to_string(),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_attempts: None,
        },
        ..Default::default()
    }
}

fn forwarder(port: u16, target: SocketAddr) -> ForwarderConfig {
    ForwarderConfig {
        name: "web".to_string(),
        port,
        target: target.to_string(),
        client_id: "a-web".to_string(),
        ..Default::default()
    }
}

async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>>,
{
    timeout(Duration::from_secs(10), async {
        loop {
            if condition().await {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_happy_path_byte_echo() {
    let echo = echo_service().await;
    let (state, relay_addr) = start_relay("t").await;

    let forward_port = free_port();
    let listener = Arc::new(PortListener::new("web", forward_port, "a-web"));
    let bound = listener.bind().await.unwrap();
    tokio::spawn(listener.run(state.clone(), bound));

    let mut config = agent_config(relay_addr, "t", "a-web");
    config.forwarders = vec![forwarder(forward_port, echo)];
    let agent = Arc::new(Agent::new(config).unwrap());
    {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await });
    }

    {
        let state = state.clone();
        wait_until(move || {
            let state = state.clone();
            Box::pin(async move { state.registry.get("a-web").is_some() })
        })
        .await;
    }

    // External client connects to the relay port; bytes round-trip
    // through agent and target unchanged and in order.
    let mut client = TcpStream::connect(("127.0.0.1", forward_port)).await.unwrap();
    let payload = b"GET / HTTP/1.0\r\n\r\n";
    client.write_all(payload).await.unwrap();

    let mut received = vec![0u8; payload.len()];
    timeout(Duration::from_secs(10), client.read_exact(&mut received))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&received, payload);

    // A second, larger exchange on a fresh session.
    let mut client2 = TcpStream::connect(("127.0.0.1", forward_port)).await.unwrap();
    let big: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    client2.write_all(&big).await.unwrap();

    let mut received = vec![0u8; big.len()];
    timeout(Duration::from_secs(10), client2.read_exact(&mut received))
        .await
        .expect("large echo timed out")
        .unwrap();
    assert_eq!(received, big);

    agent.stop();
    state.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_auth_failure_yields_401() {
    let (_state, relay_addr) = start_relay("t").await;

    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    let mut request = format!("ws://{relay_addr}/tunnel")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Authorization", HeaderValue::from_static("Bearer wrong"));
    request
        .headers_mut()
        .insert("X-Client-ID", HeaderValue::from_static("a-web"));

    let result = tokio_tungstenite::connect_async(request).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected HTTP 401 rejection, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_agent_closes_external_connection() {
    let (state, _relay_addr) = start_relay("t").await;

    let forward_port = free_port();
    let listener = Arc::new(PortListener::new("web", forward_port, "a-web"));
    let bound = listener.bind().await.unwrap();
    tokio::spawn(listener.run(state.clone(), bound));

    // No agent registered: the TCP connection closes with no bytes.
    let mut client = TcpStream::connect(("127.0.0.1", forward_port)).await.unwrap();
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("close timed out")
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(state.sessions.count().await, 0);

    state.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_target_unreachable_closes_with_no_bytes() {
    let (state, relay_addr) = start_relay("t").await;

    // Reserve a target port nobody is listening on.
    let dead_target: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();

    let forward_port = free_port();
    let listener = Arc::new(PortListener::new("web", forward_port, "a-web"));
    let bound = listener.bind().await.unwrap();
    tokio::spawn(listener.run(state.clone(), bound));

    let mut config = agent_config(relay_addr, "t", "a-web");
    config.forwarders = vec![forwarder(forward_port, dead_target)];
    let agent = Arc::new(Agent::new(config).unwrap());
    {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await });
    }

    {
        let state = state.clone();
        wait_until(move || {
            let state = state.clone();
            Box::pin(async move { state.registry.get("a-web").is_some() })
        })
        .await;
    }

    // The dial fails on the agent; the external client observes a close
    // before any application bytes have flowed.
    let mut client = TcpStream::connect(("127.0.0.1", forward_port)).await.unwrap();
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(10), client.read(&mut buf))
        .await
        .expect("close timed out")
        .unwrap();
    assert_eq!(n, 0);

    {
        let state = state.clone();
        wait_until(move || {
            let state = state.clone();
            Box::pin(async move { state.sessions.count().await == 0 })
        })
        .await;
    }

    agent.stop();
    state.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_agent_initiated_session_through_local_forward() {
    // Symmetric direction: the agent listens locally and the relay
    // dials the target in its own network.
    let echo = echo_service().await;
    let (state, relay_addr) = start_relay("t").await;

    let local_port = free_port();
    let mut config = agent_config(relay_addr, "t", "a-out");
    config.local_forwards = vec![airlock_agent::LocalForward {
        port: local_port,
        target: echo.to_string(),
    }];
    let agent = Arc::new(Agent::new(config).unwrap());
    {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await });
    }

    {
        let state = state.clone();
        wait_until(move || {
            let state = state.clone();
            Box::pin(async move { state.registry.get("a-out").is_some() })
        })
        .await;
    }
    {
        let agent = agent.clone();
        wait_until(move || {
            let agent = agent.clone();
            Box::pin(async move { agent.is_connected() })
        })
        .await;
    }

    let mut client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
    client.write_all(b"outbound path").await.unwrap();

    let mut received = vec![0u8; 13];
    timeout(Duration::from_secs(10), client.read_exact(&mut received))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&received, b"outbound path");

    agent.stop();
    state.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_agent_loss_cascades_to_sessions() {
    let echo = echo_service().await;
    let (state, relay_addr) = start_relay("t").await;

    let forward_port = free_port();
    let listener = Arc::new(PortListener::new("web", forward_port, "a-web"));
    let bound = listener.bind().await.unwrap();
    tokio::spawn(listener.run(state.clone(), bound));

    let mut config = agent_config(relay_addr, "t", "a-web");
    config.forwarders = vec![forwarder(forward_port, echo)];
    let agent = Arc::new(Agent::new(config).unwrap());
    {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await });
    }

    {
        let state = state.clone();
        wait_until(move || {
            let state = state.clone();
            Box::pin(async move { state.registry.get("a-web").is_some() })
        })
        .await;
    }

    let mut client = TcpStream::connect(("127.0.0.1", forward_port)).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut received = vec![0u8; 5];
    timeout(Duration::from_secs(10), client.read_exact(&mut received))
        .await
        .expect("echo timed out")
        .unwrap();

    // Sever the control channel: the relay must remove the agent record
    // and terminate the session, closing the external connection.
    agent.stop();

    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(10), client.read(&mut buf))
        .await
        .expect("cascade close timed out")
        .unwrap();
    assert_eq!(n, 0);

    {
        let state = state.clone();
        wait_until(move || {
            let state = state.clone();
            Box::pin(async move {
                state.sessions.count().await == 0 && state.registry.count() == 0
            })
        })
        .await;
    }

    state.shutdown.cancel();
}
