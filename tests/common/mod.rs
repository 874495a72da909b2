//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mentionbridge::data::{AccountRecord, Database};
use mentionbridge::error::AppError;
use mentionbridge::service::FeedCrawler;
use mentionbridge::silo::{
    Activity, ActivityPage, PollCursor, SiloAdapter, SiloClients, SiloConnector, SiloError,
    SiloKind,
};
use mentionbridge::tasks::{Task, TaskDispatcher};
use mentionbridge::webmention::html::HEntry;
use mentionbridge::webmention::{SendOutcome, WebmentionSender};
use mentionbridge::{AppState, config};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Silo whose recent activity is scripted by the test
#[derive(Default)]
pub struct FakeSilo {
    pub activities: Mutex<Vec<Activity>>,
    pub deauthorized: Mutex<bool>,
}

struct FakeAdapter {
    silo: Arc<FakeSilo>,
}

#[async_trait]
impl SiloAdapter for FakeAdapter {
    fn kind(&self) -> SiloKind {
        SiloKind::Twitter
    }

    async fn fetch_recent_activity(
        &self,
        _account: &AccountRecord,
        _cursor: &PollCursor,
    ) -> Result<ActivityPage, SiloError> {
        if *self.silo.deauthorized.lock().unwrap() {
            return Err(SiloError::Deauthorized("token revoked".to_string()));
        }
        Ok(ActivityPage {
            items: self.silo.activities.lock().unwrap().clone(),
            etag: None,
        })
    }
}

struct FakeConnector {
    silo: Arc<FakeSilo>,
}

#[async_trait]
impl SiloConnector for FakeConnector {
    fn kind(&self) -> SiloKind {
        SiloKind::Twitter
    }

    async fn connect(&self, _account: &AccountRecord) -> Result<Arc<dyn SiloAdapter>, SiloError> {
        Ok(Arc::new(FakeAdapter {
            silo: self.silo.clone(),
        }))
    }
}

/// Webmention sender with scripted per-target outcomes.
///
/// Targets without a scripted outcome are delivered.
#[derive(Default)]
pub struct FakeSender {
    pub outcomes: Mutex<HashMap<String, SendOutcome>>,
    pub sends: Mutex<Vec<(String, String)>>,
    pub endpoint: Mutex<Option<String>>,
}

impl FakeSender {
    pub fn script(&self, target: &str, outcome: SendOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(target.to_string(), outcome);
    }

    pub fn sent_to(&self) -> Vec<String> {
        self.sends
            .lock()
            .unwrap()
            .iter()
            .map(|(_, target)| target.clone())
            .collect()
    }
}

#[async_trait]
impl WebmentionSender for FakeSender {
    async fn send(&self, source: &str, target: &str) -> SendOutcome {
        self.sends
            .lock()
            .unwrap()
            .push((source.to_string(), target.to_string()));
        self.outcomes
            .lock()
            .unwrap()
            .get(target)
            .cloned()
            .unwrap_or(SendOutcome::Delivered {
                endpoint: "https://endpoint.example/wm".to_string(),
            })
    }

    async fn discover_endpoint(&self, _url: &str) -> Result<Option<String>, AppError> {
        Ok(self.endpoint.lock().unwrap().clone())
    }
}

/// Crawler that never finds any h-entries
pub struct NoopCrawler;

#[async_trait]
impl FeedCrawler for NoopCrawler {
    async fn fetch_entries(&self, _author_url: &str) -> Result<Vec<HEntry>, AppError> {
        Ok(Vec::new())
    }
}

/// Dispatcher that records tasks instead of running them
#[derive(Default)]
pub struct RecordingDispatcher {
    pub tasks: Mutex<Vec<(Task, Option<Duration>)>>,
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn dispatch(&self, task: Task, delay: Option<Duration>) -> Result<(), AppError> {
        self.tasks.lock().unwrap().push((task, delay));
        Ok(())
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub silo: Arc<FakeSilo>,
    pub sender: Arc<FakeSender>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
                domain: "test.example.com".to_string(),
                protocol: "https".to_string(),
            },
            database: config::DatabaseConfig { path: db_path },
            polling: config::PollingConfig::default(),
            propagation: config::PropagationConfig {
                max_send_attempts: 1,
                retry_backoff_ms: 0,
                ..config::PropagationConfig::default()
            },
            http: config::HttpConfig {
                timeout_seconds: 5,
                user_agent: "mentionbridge-test".to_string(),
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let db = Database::connect(&config.database.path).await.unwrap();
        let silo = Arc::new(FakeSilo::default());
        let sender = Arc::new(FakeSender::default());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let silos = SiloClients::new().with_connector(Arc::new(FakeConnector { silo: silo.clone() }));

        let state = AppState::with_collaborators(
            config,
            db,
            silos,
            sender.clone(),
            Arc::new(NoopCrawler),
            dispatcher.clone(),
        );

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = mentionbridge::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{addr}"),
            state,
            silo,
            sender,
            dispatcher,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Remove and return every recorded task
    pub fn take_tasks(&self) -> Vec<(Task, Option<Duration>)> {
        std::mem::take(&mut *self.dispatcher.tasks.lock().unwrap())
    }

    /// Run every recorded task that was dispatched without a delay.
    ///
    /// Delayed tasks (rescheduled polls) are dropped. Returns the tasks run.
    pub async fn run_immediate_tasks(&self) -> Vec<Task> {
        let runner = self.state.task_runner();
        let mut ran = Vec::new();
        for (task, delay) in self.take_tasks() {
            if delay.is_some_and(|delay| !delay.is_zero()) {
                continue;
            }
            runner.execute(task.clone()).await;
            ran.push(task);
        }
        ran
    }

    /// Link a listening Twitter account whose site is `https://alice.example.org/`
    pub async fn link_account(&self) -> serde_json::Value {
        let response = self
            .client
            .post(self.url("/accounts"))
            .json(&serde_json::json!({
                "silo": "twitter",
                "id": "alice",
                "name": "Alice",
                "url": "https://twitter.com/alice",
                "features": ["listen"],
                "domain_urls": ["https://alice.example.org/"],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
        response.json().await.unwrap()
    }

    /// Fetch a delivery record through the API
    pub async fn delivery(&self, key: &str) -> serde_json::Value {
        let response = self
            .client
            .get(self.url("/deliveries"))
            .query(&[("key", key)])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        response.json().await.unwrap()
    }
}

/// A public post with one public reply, linking to `original`
pub fn activity_with_reply(original: &str) -> Activity {
    serde_json::from_value(serde_json::json!({
        "id": "tag:twitter.com,2013:100",
        "url": "https://twitter.com/alice/status/100",
        "content": "new post",
        "links": [original],
        "responses": [{
            "id": "tag:twitter.com,2013:100_reply_1",
            "response_type": "comment",
            "url": "https://twitter.com/bob/status/101",
            "content": "nice post",
            "author": "Bob",
        }],
    }))
    .unwrap()
}

pub const REPLY_KEY: &str = "tag:twitter.com,2013:100_reply_1";
