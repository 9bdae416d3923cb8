use rudpping::{Client, Config, ProbeMode, ProgressCallback, ProgressEvent, Server};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Custom callback implementation using a struct
struct TestCallback {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl TestCallback {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ProgressCallback for TestCallback {
    fn on_progress(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

async fn start_server() -> (Arc<Server>, u16) {
    let server = Arc::new(Server::new(Config::server(0).with_trace_level(0)).unwrap());
    let socket = server.bind().await.unwrap();
    let port = socket.local_addr().unwrap().port();
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.serve(socket).await;
    });
    (server, port)
}

#[tokio::test]
async fn test_custom_callback_struct() {
    let (server, port) = start_server().await;

    let callback = TestCallback::new();
    let events_ref = callback.events.clone();

    let client_config = Config::client("127.0.0.1".to_string(), port)
        .with_interval(Duration::from_millis(1))
        .with_count(5)
        .with_trace_level(0);
    let client = Client::new(client_config).unwrap().with_callback(callback);
    client.run().await.unwrap();

    let events = events_ref.lock().unwrap();
    assert!(
        matches!(events.first(), Some(ProgressEvent::Started { .. })),
        "First event should be Started"
    );

    let sent = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::Sent { .. }))
        .count();
    assert_eq!(sent, 5);

    let replies: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Reply { sequence, rtt, .. } => {
                assert!(*rtt >= 0.0);
                Some(*sequence)
            }
            _ => None,
        })
        .collect();
    assert_eq!(replies, vec![1, 2, 3, 4, 5]);

    match events.last() {
        Some(ProgressEvent::Completed(summary)) => {
            assert_eq!(summary.number_sent, 5);
            assert_eq!(summary.number_rxed, 5);
        }
        other => panic!("Expected Completed as last event, got {:?}", other),
    }

    server.cancellation_token().cancel();
}

#[tokio::test]
async fn test_closure_callback() {
    let (server, port) = start_server().await;

    let completed = Arc::new(Mutex::new(0usize));
    let replies = Arc::new(Mutex::new(0usize));
    let completed_ref = completed.clone();
    let replies_ref = replies.clone();

    let client_config = Config::client("127.0.0.1".to_string(), port)
        .with_probe_mode(ProbeMode::Ack)
        .with_interval(Duration::ZERO)
        .with_count(10)
        .with_trace_level(0);
    let client = Client::new(client_config)
        .unwrap()
        .with_callback(move |event: ProgressEvent| match event {
            ProgressEvent::Reply { .. } => *replies_ref.lock().unwrap() += 1,
            ProgressEvent::Completed(_) => *completed_ref.lock().unwrap() += 1,
            _ => {}
        });
    client.run().await.unwrap();

    assert_eq!(*replies.lock().unwrap(), 10);
    assert_eq!(*completed.lock().unwrap(), 1);

    server.cancellation_token().cancel();
}

#[tokio::test]
async fn test_callback_sees_timeouts() {
    // Bound but never answered
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();

    let timeouts = Arc::new(Mutex::new(Vec::new()));
    let timeouts_ref = timeouts.clone();

    let client_config = Config::client("127.0.0.1".to_string(), port)
        .with_interval(Duration::from_millis(1))
        .with_reply_timeout(Duration::from_millis(30))
        .with_count(3)
        .with_trace_level(0);
    let client = Client::new(client_config)
        .unwrap()
        .with_callback(move |event: ProgressEvent| {
            if let ProgressEvent::Timeout { sequence } = event {
                timeouts_ref.lock().unwrap().push(sequence);
            }
        });
    let summary = client.run().await.unwrap();

    assert_eq!(*timeouts.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(summary.number_dropped, 3);
    drop(silent);
}

#[tokio::test]
async fn test_callback_without_events_is_optional() {
    let (server, port) = start_server().await;

    let client_config = Config::client("127.0.0.1".to_string(), port)
        .with_interval(Duration::ZERO)
        .with_count(2)
        .with_trace_level(0);
    let client = Client::new(client_config).unwrap();
    let summary = client.run().await.unwrap();
    assert_eq!(summary.number_rxed, 2);

    server.cancellation_token().cancel();
}
