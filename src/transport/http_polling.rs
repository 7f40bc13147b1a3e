//! Long-poll client for the relay.
//!
//! Devices without inbound connectivity keep one GET outstanding against
//! `LongPoll.php?key=<channel>Poll`. When the relay hands back a command the
//! client dispatches it and, if the request carried a response code, posts
//! the result to `Blob.php?key=<channel>_resp<code>` where the controller is
//! waiting for it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::agent::config::Settings;
use crate::agent::worker::{BackgroundWorker, Lifecycle};
use crate::commands::router::CommandRouter;
use crate::transport::{CommandResult, STATUS_FIELD};

pub const NEW_DATA: &str = "NewData";
pub const DATA_FIELD: &str = "Data";

// Grace period on top of the relay's own hold time before reqwest gives up.
const REQUEST_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// URLs for one channel on a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoints {
    base_url: String,
    channel: String,
}

impl RelayEndpoints {
    pub fn new(base_url: &str, channel: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            channel: urlencoding::encode(channel).into_owned(),
        }
    }

    /// Where the device waits for commands.
    pub fn poll_url(&self) -> String {
        format!(
            "{}/LongPoll.php?key={}Poll&clearValue=&expectingValue=",
            self.base_url, self.channel
        )
    }

    /// Where the device leaves the answer to a command.
    pub fn response_url(&self, response_code: &str) -> String {
        format!(
            "{}/Blob.php?key={}_resp{}",
            self.base_url,
            self.channel,
            urlencoding::encode(response_code)
        )
    }

    /// Where a controller drops a command for the device.
    pub fn command_url(&self) -> String {
        format!("{}/Blob.php?key={}Poll", self.base_url, self.channel)
    }

    /// Where a controller waits for the device's answer.
    pub fn response_poll_url(&self, response_code: &str) -> String {
        format!(
            "{}/LongPoll.php?key={}_resp{}",
            self.base_url,
            self.channel,
            urlencoding::encode(response_code)
        )
    }
}

/// Timing knobs for the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTiming {
    /// How long an outstanding poll is trusted before another is issued.
    pub poll_timeout: Duration,
    /// Longest single wait for relay traffic within one worker iteration.
    pub poll_wait: Duration,
    /// Pause before re-polling after a failed request.
    pub error_backoff: Duration,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(30),
            poll_wait: Duration::from_secs(10),
            error_backoff: Duration::from_secs(30),
        }
    }
}

impl PollTiming {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            poll_timeout: settings.poll_timeout(),
            poll_wait: settings.poll_wait(),
            error_backoff: settings.error_backoff(),
        }
    }
}

/// Idle / poll-in-flight bookkeeping. At most one poll counts as
/// outstanding; a new one is only issued once it is answered, fails, or
/// exceeds the poll timeout.
#[derive(Debug, Default)]
pub struct PollCycle {
    waiting: bool,
    last_poll: Option<Instant>,
    generation: u64,
    retry_after: Option<Instant>,
}

impl PollCycle {
    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn should_poll(&self, now: Instant, timeout: Duration) -> bool {
        if self.retry_after.is_some_and(|at| now < at) {
            return false;
        }
        match (self.waiting, self.last_poll) {
            (true, Some(issued)) => now.saturating_duration_since(issued) >= timeout,
            _ => true,
        }
    }

    /// Record a new poll and return its generation.
    pub fn begin_poll(&mut self, now: Instant) -> u64 {
        self.waiting = true;
        self.last_poll = Some(now);
        self.retry_after = None;
        self.generation += 1;
        self.generation
    }

    /// Returns false when the reply belongs to a poll that was superseded.
    pub fn reply_received(&mut self, generation: u64) -> bool {
        if generation == self.generation {
            self.waiting = false;
            true
        } else {
            false
        }
    }

    pub fn poll_failed(&mut self, generation: u64, now: Instant, backoff: Duration) {
        if generation == self.generation {
            self.waiting = false;
            self.retry_after = Some(now + backoff);
        }
    }

    /// How long the loop may wait before it has something to do again.
    fn idle_wait(&self, now: Instant, max: Duration) -> Duration {
        match (self.waiting, self.retry_after) {
            (false, Some(at)) => at.saturating_duration_since(now).min(max),
            _ => max,
        }
    }
}

#[derive(Debug)]
enum PollEvent {
    Reply { generation: u64, body: String },
    Failed { generation: u64, error: String },
}

/// Background worker that keeps a long-poll open against the relay.
pub struct RelayPollClient {
    lifecycle: Lifecycle,
    router: Arc<CommandRouter>,
    endpoints: RelayEndpoints,
    timing: PollTiming,
    http: Client,
    cycle: Mutex<PollCycle>,
    events_tx: mpsc::UnboundedSender<PollEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PollEvent>>,
}

impl RelayPollClient {
    pub fn new(router: Arc<CommandRouter>, endpoints: RelayEndpoints, timing: PollTiming) -> Result<Self> {
        let http = Client::builder().build().context("building http client")?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            lifecycle: Lifecycle::new(),
            router,
            endpoints,
            timing,
            http,
            cycle: Mutex::new(PollCycle::default()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        })
    }

    pub fn from_settings(router: Arc<CommandRouter>, settings: &Settings) -> Result<Self> {
        Self::new(
            router,
            RelayEndpoints::new(&settings.relay_url, &settings.channel),
            PollTiming::from_settings(settings),
        )
    }

    pub fn endpoints(&self) -> &RelayEndpoints {
        &self.endpoints
    }

    pub fn is_waiting(&self) -> bool {
        self.lock_cycle().is_waiting()
    }

    fn lock_cycle(&self) -> std::sync::MutexGuard<'_, PollCycle> {
        self.cycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a poll unless one is already outstanding and still fresh.
    fn maybe_issue_poll(&self) {
        let now = Instant::now();
        let generation = {
            let mut cycle = self.lock_cycle();
            if !cycle.should_poll(now, self.timing.poll_timeout) {
                return;
            }
            if cycle.is_waiting() {
                debug!(
                    timeout_secs = self.timing.poll_timeout.as_secs(),
                    "long poll unanswered past timeout, re-issuing"
                );
            }
            cycle.begin_poll(now)
        };

        let url = self.endpoints.poll_url();
        trace!(url = %url, generation, "sending long poll");

        let request = self
            .http
            .get(&url)
            .timeout(self.timing.poll_timeout + REQUEST_TIMEOUT_SLACK);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match request.send().await {
                Ok(resp) if resp.status().is_success() => match resp.text().await {
                    Ok(body) => PollEvent::Reply { generation, body },
                    Err(e) => PollEvent::Failed {
                        generation,
                        error: format!("reading poll body: {e}"),
                    },
                },
                Ok(resp) => PollEvent::Failed {
                    generation,
                    error: format!("unexpected status: {}", resp.status()),
                },
                Err(e) => PollEvent::Failed {
                    generation,
                    error: e.to_string(),
                },
            };
            // Receiver is gone once the client has been dropped.
            let _ = tx.send(event);
        });
    }

    async fn handle_event(&self, event: PollEvent) {
        match event {
            PollEvent::Reply { generation, body } => {
                let current = self.lock_cycle().reply_received(generation);
                if !current {
                    debug!(generation, "processing reply from a superseded poll");
                }
                if let Some(result) = self.process_reply(&body).await {
                    self.post_response(&result);
                }
            }
            PollEvent::Failed { generation, error } => {
                warn!(error = %error, url = %self.endpoints.poll_url(), "long poll to relay failed");
                self.lock_cycle()
                    .poll_failed(generation, Instant::now(), self.timing.error_backoff);
            }
        }
    }

    /// Decode a relay reply and dispatch any command in it. Returns the
    /// router's result, or `None` when the reply carried no command.
    ///
    /// Dispatch runs on the blocking pool since it may write the config file
    /// and call into the listener.
    pub async fn process_reply(&self, body: &str) -> Option<CommandResult> {
        let reply: Value = match serde_json::from_str(body) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "invalid poll data returned");
                return None;
            }
        };

        let status = match reply.get(STATUS_FIELD).and_then(Value::as_str) {
            Some(status) => status,
            None => {
                warn!(response_body = %body, "poll reply has no Status");
                return None;
            }
        };

        if status != NEW_DATA {
            trace!(status, "poll returned without data");
            return None;
        }

        let data = match reply.get(DATA_FIELD).and_then(Value::as_str) {
            Some(data) => data,
            None => {
                warn!("poll reply has NewData but no Data string");
                return None;
            }
        };

        let decoded = urlencoding::decode_binary(data.as_bytes()).into_owned();
        let router = Arc::clone(&self.router);
        let result = match tokio::task::spawn_blocking(move || router.dispatch(&decoded)).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "relay command dispatch aborted");
                return None;
            }
        };
        debug!(
            status = result.status.map(|s| s.as_str()).unwrap_or("unset"),
            response_code = result.response_code.as_deref().unwrap_or(""),
            "relay command dispatched"
        );
        Some(result)
    }

    /// Fire-and-forget post of a result back to the relay.
    fn post_response(&self, result: &CommandResult) {
        let code = match result.response_code.as_deref() {
            Some(code) if !code.is_empty() => code,
            _ => return,
        };
        let json = result.to_json_string();
        if json.is_empty() {
            return;
        }

        let url = self.endpoints.response_url(code);
        debug!(url = %url, "posting command response to relay");
        let request = self.http.post(&url).form(&[("data", json)]);
        tokio::spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    trace!(url = %url, "response delivered");
                }
                Ok(resp) => warn!(url = %url, status = %resp.status(), "relay rejected response"),
                Err(e) => warn!(url = %url, error = %e, "failed to post response"),
            }
        });
    }
}

#[async_trait]
impl BackgroundWorker for RelayPollClient {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn name(&self) -> &'static str {
        "relay-poll"
    }

    async fn do_work(&self) -> bool {
        self.maybe_issue_poll();

        let wait = self
            .lock_cycle()
            .idle_wait(Instant::now(), self.timing.poll_wait);
        let event = {
            let mut rx = self.events_rx.lock().await;
            tokio::time::timeout(wait, rx.recv()).await
        };

        if let Ok(Some(event)) = event {
            self.handle_event(event).await;
        }
        true
    }
}

impl Drop for RelayPollClient {
    fn drop(&mut self) {
        info!(channel = %self.endpoints.channel, "relay poll client released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::config_store::ConfigStore;
    use crate::commands::listener::CommandListener;
    use serde_json::{json, Map};
    use tempfile::tempdir;

    #[test]
    fn endpoints_follow_relay_key_scheme() {
        let ep = RelayEndpoints::new("http://relay.example.com/", "lamp");
        assert_eq!(
            ep.poll_url(),
            "http://relay.example.com/LongPoll.php?key=lampPoll&clearValue=&expectingValue="
        );
        assert_eq!(
            ep.response_url("123"),
            "http://relay.example.com/Blob.php?key=lamp_resp123"
        );
        assert_eq!(ep.command_url(), "http://relay.example.com/Blob.php?key=lampPoll");
        assert_eq!(
            ep.response_poll_url("9"),
            "http://relay.example.com/LongPoll.php?key=lamp_resp9"
        );
    }

    #[test]
    fn channel_names_are_escaped() {
        let ep = RelayEndpoints::new("http://r", "my lamp&co");
        assert_eq!(ep.command_url(), "http://r/Blob.php?key=my%20lamp%26coPoll");
    }

    #[test]
    fn cycle_holds_a_single_outstanding_poll() {
        let timeout = Duration::from_secs(30);
        let start = Instant::now();
        let mut cycle = PollCycle::default();

        assert!(cycle.should_poll(start, timeout));
        let gen = cycle.begin_poll(start);
        assert!(cycle.is_waiting());
        assert!(!cycle.should_poll(start + Duration::from_secs(1), timeout));
        assert!(!cycle.should_poll(start + Duration::from_secs(29), timeout));

        assert!(cycle.reply_received(gen));
        assert!(!cycle.is_waiting());
        assert!(cycle.should_poll(start + Duration::from_secs(2), timeout));
    }

    #[test]
    fn cycle_reissues_after_timeout() {
        let timeout = Duration::from_secs(30);
        let start = Instant::now();
        let mut cycle = PollCycle::default();
        let first = cycle.begin_poll(start);

        assert!(cycle.should_poll(start + timeout, timeout));
        let second = cycle.begin_poll(start + timeout);
        assert_ne!(first, second);

        // A late reply to the first poll does not free the second one.
        assert!(!cycle.reply_received(first));
        assert!(cycle.is_waiting());
        assert!(cycle.reply_received(second));
    }

    #[test]
    fn cycle_backs_off_after_failure() {
        let timeout = Duration::from_secs(30);
        let backoff = Duration::from_secs(5);
        let start = Instant::now();
        let mut cycle = PollCycle::default();
        let gen = cycle.begin_poll(start);

        cycle.poll_failed(gen, start, backoff);
        assert!(!cycle.is_waiting());
        assert!(!cycle.should_poll(start + Duration::from_secs(4), timeout));
        assert!(cycle.should_poll(start + backoff, timeout));
        assert_eq!(
            cycle.idle_wait(start + Duration::from_secs(2), Duration::from_secs(10)),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn zero_backoff_repolls_immediately() {
        let start = Instant::now();
        let mut cycle = PollCycle::default();
        let gen = cycle.begin_poll(start);
        cycle.poll_failed(gen, start, Duration::ZERO);
        assert!(cycle.should_poll(start, Duration::from_secs(30)));
    }

    struct Responder;

    impl CommandListener for Responder {
        fn on_config_change(&self, _old: &Value, _new: &Value) {}

        fn on_command(&self, request: &Value, response: &mut Map<String, Value>) {
            response.insert("Status".into(), json!("Success"));
            response.insert("Got".into(), request["Command"].clone());
        }
    }

    fn client(listener: &Arc<dyn CommandListener>) -> (tempfile::TempDir, RelayPollClient) {
        let dir = tempdir().unwrap();
        let router = Arc::new(CommandRouter::with_listener(
            ConfigStore::new(dir.path().join("cfg.json")),
            listener,
        ));
        let client = RelayPollClient::new(
            router,
            RelayEndpoints::new("http://127.0.0.1:9", "test"),
            PollTiming::default(),
        )
        .unwrap();
        (dir, client)
    }

    #[tokio::test]
    async fn process_reply_decodes_and_dispatches() {
        let listener: Arc<dyn CommandListener> = Arc::new(Responder);
        let (_dir, client) = client(&listener);
        let command = r#"{"Command":"Open","ResponseCode":"77"}"#;
        let reply = json!({"Status": "NewData", "Data": urlencoding::encode(command)});

        let result = client.process_reply(&reply.to_string()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.body["Got"], json!("Open"));
        assert_eq!(result.response_code.as_deref(), Some("77"));
    }

    #[tokio::test]
    async fn process_reply_ignores_junk_and_empty_polls() {
        let listener: Arc<dyn CommandListener> = Arc::new(Responder);
        let (_dir, client) = client(&listener);

        assert!(client.process_reply("not json").await.is_none());
        assert!(client.process_reply(r#"{"Data":"x"}"#).await.is_none());
        assert!(client.process_reply(r#"{"Status":5}"#).await.is_none());
        assert!(client.process_reply(r#"{"Status":"Timeout"}"#).await.is_none());
        assert!(client.process_reply(r#"{"Status":"NewData"}"#).await.is_none());
    }

    #[tokio::test]
    async fn undecodable_command_still_yields_error_result() {
        let listener: Arc<dyn CommandListener> = Arc::new(Responder);
        let (_dir, client) = client(&listener);
        let reply = json!({"Status": "NewData", "Data": "%7Bbroken"});

        let result = client.process_reply(&reply.to_string()).await.unwrap();
        assert_eq!(result.error_text.as_deref(), Some("Parse Error"));
        assert!(result.response_code.is_none());
    }

    #[tokio::test]
    async fn superseded_reply_is_dispatched_without_freeing_current_poll() {
        let listener: Arc<dyn CommandListener> = Arc::new(Responder);
        let (_dir, client) = client(&listener);
        let start = Instant::now();
        let first = client.lock_cycle().begin_poll(start);
        let second = client.lock_cycle().begin_poll(start + Duration::from_secs(30));

        let command = json!({"Command": "SetConfig", "Value1": {"late": true}}).to_string();
        let body = json!({"Status": "NewData", "Data": urlencoding::encode(&command)}).to_string();
        client
            .handle_event(PollEvent::Reply {
                generation: first,
                body,
            })
            .await;

        assert_eq!(client.router.config(), json!({"late": true}));
        assert!(client.is_waiting());

        client
            .handle_event(PollEvent::Reply {
                generation: second,
                body: r#"{"Status":"Timeout"}"#.to_string(),
            })
            .await;
        assert!(!client.is_waiting());
    }
}
