//! Integration tests for the roverlink client
//!
//! Each test runs an in-process mock controller: a TCP listener on an
//! ephemeral port upgraded to WebSocket with tokio-tungstenite, standing in
//! for the robot firmware. No external hardware or server is required.

use futures::{SinkExt, StreamExt};
use roverlink::{ConnectionState, RoverClient, RoverConfig, RoverError, TelemetryFrame};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn bind() -> (TcpListener, String, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr.ip().to_string(), addr.port())
}

fn test_config() -> RoverConfig {
    RoverConfig::default()
        .connect_timeout(Duration::from_secs(5))
        .handshake_delay(Duration::from_millis(20))
        .reconnect_interval(Duration::from_millis(80))
}

async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>, window: Duration) -> T {
    timeout(window, rx.recv())
        .await
        .expect("timed out waiting on channel")
        .expect("channel closed")
}

/// Keep a mock connection open until the peer goes away.
async fn hold(mut ws: WebSocketStream<TcpStream>) {
    while let Some(Ok(_)) = ws.next().await {}
}

/// Read text messages until one arrives, skipping control frames.
async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return text.to_string(),
            Some(Ok(_)) => continue,
            other => panic!("connection ended before a text message: {other:?}"),
        }
    }
}

#[tokio::test]
async fn connect_opens_and_identifies() {
    init_tracing();
    let (listener, host, port) = bind().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        next_text(&mut ws).await
    });

    let client = RoverClient::new(test_config());
    client.connect_to(host, port).await.unwrap();

    assert!(client.is_connected());
    assert_eq!(client.connection_state(), ConnectionState::Open);

    let ident = timeout(Duration::from_secs(2), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ident, "MOBILE");

    client.disconnect();
    assert!(!client.is_connected());
}

#[tokio::test]
async fn telemetry_fans_out_in_order_and_skips_control_lines() {
    init_tracing();
    let (listener, host, port) = bind().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        ws.send(Message::Text("ESP32_READY".into())).await.unwrap();
        ws.send(Message::Text(
            "100,200,1,2,128,128,128,130,126,129".into(),
        ))
        .await
        .unwrap();
        ws.send(Message::Text("1,2,3".into())).await.unwrap();
        ws.send(Message::Text("MOTOR_CMD_OK:forward".into()))
            .await
            .unwrap();
        ws.send(Message::Text(
            "sensor_data:5,6,7,8,9,10,11,12,13,14".into(),
        ))
        .await
        .unwrap();

        hold(ws).await;
    });

    let client = RoverClient::new(test_config());

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<TelemetryFrame>();
    let _sub = client.on_data(move |frame| {
        let _ = frame_tx.send(frame);
    });

    client.connect_to(host, port).await.unwrap();

    let first = recv_within(&mut frame_rx, Duration::from_secs(2)).await;
    assert_eq!(
        first,
        TelemetryFrame {
            us1: 100,
            us2: 200,
            gas1: 1,
            gas2: 2,
            imu1x: 128,
            imu1y: 128,
            imu1z: 128,
            imu2x: 130,
            imu2y: 126,
            imu2z: 129,
        }
    );

    let second = recv_within(&mut frame_rx, Duration::from_secs(2)).await;
    assert_eq!(second.us1, 5);
    assert_eq!(second.imu2z, 14);

    // control tokens and the short line produced no extra deliveries
    assert!(frame_rx.try_recv().is_err());

    client.disconnect();
    server.abort();
}

#[tokio::test]
async fn motor_command_hits_the_wire_verbatim() {
    init_tracing();
    let (listener, host, port) = bind().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        loop {
            let text = next_text(&mut ws).await;
            if text.starts_with("motor_ct:") {
                return text;
            }
        }
    });

    let client = RoverClient::new(test_config());
    client.connect_to(host, port).await.unwrap();
    client.send_motor_command("forward");

    let wire = timeout(Duration::from_secs(2), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(wire, "motor_ct:forward");

    client.disconnect();
}

#[tokio::test]
async fn unexpected_close_notifies_once_and_reconnects() {
    init_tracing();
    let (listener, host, port) = bind().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        drop(ws);

        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        hold(ws).await;
    });

    let client = RoverClient::new(test_config());

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<bool>();
    let _sub = client.on_connection(move |connected| {
        let _ = event_tx.send(connected);
    });

    client.connect_to(host, port).await.unwrap();

    assert!(recv_within(&mut event_rx, Duration::from_secs(2)).await);
    assert!(!recv_within(&mut event_rx, Duration::from_secs(2)).await);
    assert!(recv_within(&mut event_rx, Duration::from_secs(2)).await);

    // the successful reopen restores the full retry allowance
    assert_eq!(client.reconnect_attempts(), 0);
    assert!(client.is_connected());

    client.disconnect();
    server.abort();
}

#[tokio::test]
async fn retries_stop_at_budget_and_explicit_connect_resumes() {
    init_tracing();
    let (listener, host, port) = bind().await;

    let config = test_config().max_reconnect_attempts(2);
    let client = RoverClient::new(config);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<bool>();
    let _sub = client.on_connection(move |connected| {
        let _ = event_tx.send(connected);
    });

    // one good connection, then the controller goes away for good
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        drop(ws);
        drop(listener);
    });

    client.connect_to(host.clone(), port).await.unwrap();
    assert!(recv_within(&mut event_rx, Duration::from_secs(2)).await);
    assert!(!recv_within(&mut event_rx, Duration::from_secs(2)).await);

    server.await.unwrap();

    // both retries fail against the closed port, then the client gives up
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(client.reconnect_attempts(), 2);
    assert!(!client.is_connected());

    // the drop was notified exactly once; failed retries stay silent
    assert!(event_rx.try_recv().is_err());

    // an explicit connect resets the counter and resumes
    let (listener2, host2, port2) = bind().await;
    let server2 = tokio::spawn(async move {
        let (stream, _) = listener2.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        hold(ws).await;
    });

    client.connect_to(host2, port2).await.unwrap();
    assert!(client.is_connected());
    assert_eq!(client.reconnect_attempts(), 0);

    client.disconnect();
    server2.abort();
}

#[tokio::test]
async fn disconnect_suppresses_reconnect() {
    init_tracing();
    let (listener, host, port) = bind().await;

    let client = RoverClient::new(test_config());

    let accept_first = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        // hand the listener back so the test can watch for a reconnect
        (ws, listener)
    });

    client.connect_to(host, port).await.unwrap();
    let (ws, listener) = timeout(Duration::from_secs(2), accept_first)
        .await
        .unwrap()
        .unwrap();

    client.disconnect();
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    drop(ws);

    // well past the reconnect interval, nobody knocks
    let reconnect = timeout(Duration::from_millis(400), listener.accept()).await;
    assert!(reconnect.is_err(), "deliberate disconnect must not retry");

    // idempotent
    client.disconnect();
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn connect_times_out_when_handshake_stalls() {
    init_tracing();
    let (listener, host, port) = bind().await;

    // accept the TCP connection but never answer the websocket upgrade
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(stream);
    });

    let config = test_config().connect_timeout(Duration::from_millis(300));
    let client = RoverClient::new(config);

    let err = client.connect_to(host.clone(), port).await.unwrap_err();
    match err {
        RoverError::Timeout { target, .. } => {
            assert_eq!(target, format!("{host}:{port}"));
        }
        other => panic!("expected timeout, got {other}"),
    }
    assert!(!client.is_connected());

    server.abort();
}

#[tokio::test]
async fn connect_reports_refused_target() {
    init_tracing();
    let (listener, host, port) = bind().await;
    drop(listener);

    let client = RoverClient::new(test_config());
    let err = client.connect_to(host.clone(), port).await.unwrap_err();

    match err {
        RoverError::Connection { target, reason } => {
            assert_eq!(target, format!("{host}:{port}"));
            assert!(!reason.is_empty());
        }
        other => panic!("expected connection error, got {other}"),
    }

    // no auto-retry after a failed explicit connect
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.reconnect_attempts(), 0);
    assert!(!client.is_connected());
}
