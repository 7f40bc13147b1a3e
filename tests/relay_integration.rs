use mockito::Matcher;
use rapcom::agent::worker::BackgroundWorker;
use rapcom::commands::{CommandListener, CommandRouter, ConfigStore};
use rapcom::transport::http_polling::{PollTiming, RelayEndpoints, RelayPollClient};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::net::TcpListener;

const CHANNEL: &str = "dev";

struct EchoListener;

impl CommandListener for EchoListener {
    fn on_config_change(&self, _old: &Value, _new: &Value) {}

    fn on_command(&self, request: &Value, response: &mut Map<String, Value>) {
        response.insert("Status".into(), json!("Success"));
        response.insert("Echo".into(), request["Value1"].clone());
    }
}

fn timing(poll_wait_ms: u64, error_backoff: Duration) -> PollTiming {
    PollTiming {
        poll_timeout: Duration::from_secs(30),
        poll_wait: Duration::from_millis(poll_wait_ms),
        error_backoff,
    }
}

fn poll_client(
    relay_url: &str,
    timing: PollTiming,
    listener: Option<&Arc<dyn CommandListener>>,
) -> (TempDir, Arc<CommandRouter>, RelayPollClient) {
    let dir = tempdir().unwrap();
    let store = ConfigStore::new(dir.path().join("cfg.json"));
    let router = Arc::new(match listener {
        Some(listener) => CommandRouter::with_listener(store, listener),
        None => CommandRouter::new(store, None),
    });
    let client = RelayPollClient::new(
        router.clone(),
        RelayEndpoints::new(relay_url, CHANNEL),
        timing,
    )
    .unwrap();
    (dir, router, client)
}

fn new_data(command: &Value) -> String {
    json!({
        "Status": "NewData",
        "Data": urlencoding::encode(&command.to_string()),
    })
    .to_string()
}

async fn wait_until_matched(mock: &mockito::Mock) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !mock.matched_async().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("relay never saw the expected request");
}

#[tokio::test]
async fn relay_command_without_response_code_is_applied_silently() {
    let mut server = mockito::Server::new_async().await;
    let poll = server
        .mock("GET", "/LongPoll.php")
        .match_query(Matcher::UrlEncoded("key".into(), "devPoll".into()))
        .with_status(200)
        .with_body(new_data(&json!({"Command": "SetConfig", "Value1": {"on": true}})))
        .expect(1)
        .create_async()
        .await;
    let post = server
        .mock("POST", "/Blob.php")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let (_dir, router, client) = poll_client(&server.url(), timing(2000, Duration::from_secs(30)), None);

    assert!(client.do_work().await);
    assert_eq!(router.config(), json!({"on": true}));
    assert!(!client.is_waiting());

    poll.assert_async().await;
    post.assert_async().await;
}

#[tokio::test]
async fn relay_heartbeat_without_response_code_posts_nothing() {
    let mut server = mockito::Server::new_async().await;
    let poll = server
        .mock("GET", "/LongPoll.php")
        .match_query(Matcher::UrlEncoded("key".into(), "devPoll".into()))
        .with_status(200)
        .with_body(new_data(&json!({"Command": "Heartbeat"})))
        .expect(1)
        .create_async()
        .await;
    let post = server
        .mock("POST", "/Blob.php")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let (_dir, _router, client) = poll_client(&server.url(), timing(2000, Duration::from_secs(30)), None);

    assert!(client.do_work().await);
    assert!(!client.is_waiting());
    // Give a stray response post time to show up.
    tokio::time::sleep(Duration::from_millis(200)).await;

    poll.assert_async().await;
    post.assert_async().await;
}

#[tokio::test]
async fn relay_command_with_response_code_posts_result_back() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/LongPoll.php")
        .match_query(Matcher::UrlEncoded("key".into(), "devPoll".into()))
        .with_status(200)
        .with_body(new_data(
            &json!({"Command": "Blink", "Value1": 3, "ResponseCode": "42"}),
        ))
        .create_async()
        .await;
    let post = server
        .mock("POST", "/Blob.php")
        .match_query(Matcher::UrlEncoded("key".into(), "dev_resp42".into()))
        .match_body(Matcher::Regex("^data=".into()))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let listener: Arc<dyn CommandListener> = Arc::new(EchoListener);
    let (_dir, _router, client) = poll_client(
        &server.url(),
        timing(2000, Duration::from_secs(30)),
        Some(&listener),
    );

    assert!(client.do_work().await);
    wait_until_matched(&post).await;
    post.assert_async().await;
}

#[tokio::test]
async fn only_one_poll_is_outstanding_while_relay_holds_it() {
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = relay.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    // Accept connections and never answer them.
    let counter = accepted.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = relay.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(socket);
        }
    });

    let (_dir, _router, client) = poll_client(
        &format!("http://{addr}"),
        timing(50, Duration::from_secs(30)),
        None,
    );

    for _ in 0..4 {
        assert!(client.do_work().await);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(client.is_waiting());
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_poll_waits_for_backoff_before_retrying() {
    let mut server = mockito::Server::new_async().await;
    let poll = server
        .mock("GET", "/LongPoll.php")
        .match_query(Matcher::Any)
        .with_status(500)
        .expect(1)
        .create_async()
        .await;

    let (_dir, _router, client) = poll_client(&server.url(), timing(200, Duration::from_secs(60)), None);

    // First iteration sees the failure, the next ones sit out the backoff.
    for _ in 0..3 {
        assert!(client.do_work().await);
    }

    assert!(!client.is_waiting());
    poll.assert_async().await;
}

#[tokio::test]
async fn failed_poll_with_zero_backoff_retries_immediately() {
    let mut server = mockito::Server::new_async().await;
    let poll = server
        .mock("GET", "/LongPoll.php")
        .match_query(Matcher::Any)
        .with_status(500)
        .expect_at_least(2)
        .create_async()
        .await;

    let (_dir, _router, client) = poll_client(&server.url(), timing(1000, Duration::ZERO), None);

    for _ in 0..3 {
        assert!(client.do_work().await);
    }

    poll.assert_async().await;
}

#[tokio::test]
async fn started_client_exits_once_released() {
    let server = mockito::Server::new_async().await;
    let (_dir, _router, client) = poll_client(&server.url(), timing(50, Duration::ZERO), None);
    let client = Arc::new(client);
    assert!(client.start());

    let weak = Arc::downgrade(&client);
    drop(client);

    tokio::time::timeout(Duration::from_secs(5), async {
        while weak.strong_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("poll worker should stop after its last owner is dropped");
}
