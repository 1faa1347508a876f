//! Named message channels runner scripts post to
//!
//! Plain channels take a body and return nothing; reply channels resolve
//! the script's promise with a JSON reply.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::core::error::{BridgeError, Result};

/// Handler for a fire-and-forget channel
pub trait MessageHandler: Send + Sync {
    fn did_receive(&self, body: &str) -> Result<()>;
}

/// Handler for a channel whose messages expect a reply
#[async_trait]
pub trait ReplyHandler: Send + Sync {
    async fn did_receive(&self, body: String) -> Result<String>;
}

#[derive(Default)]
pub struct MessageChannels {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    reply_handlers: HashMap<String, Arc<dyn ReplyHandler>>,
}

impl MessageChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `logging`, `networking` and `store` channels every runner gets
    pub fn standard(runner: &str, http: reqwest::Client, store: Arc<dyn KeyValueStore>) -> Self {
        let mut channels = Self::new();
        channels.add("logging", Arc::new(LogHandler::new(runner)));
        channels.add_with_reply("networking", Arc::new(NetworkHandler::new(runner, http)));
        channels.add_with_reply("store", Arc::new(StoreHandler::new(runner, store)));
        channels
    }

    pub fn add(&mut self, name: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn add_with_reply(&mut self, name: &str, handler: Arc<dyn ReplyHandler>) {
        self.reply_handlers.insert(name.to_string(), handler);
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .handlers
            .keys()
            .chain(self.reply_handlers.keys())
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names
    }

    pub fn post(&self, channel: &str, body: &str) -> Result<()> {
        let handler = self
            .handlers
            .get(channel)
            .ok_or_else(|| BridgeError::Engine(format!("No handler for channel {}", channel)))?;
        handler.did_receive(body)
    }

    pub async fn request(&self, channel: &str, body: String) -> Result<String> {
        let handler = self
            .reply_handlers
            .get(channel)
            .cloned()
            .ok_or_else(|| BridgeError::Engine(format!("No reply handler for channel {}", channel)))?;
        handler.did_receive(body).await
    }
}

// ---------------------------------------------------------------------------
// logging

#[derive(Debug, Deserialize)]
struct LogRecord {
    #[serde(default)]
    level: Option<String>,
    message: String,
}

/// Forwards runner console output into tracing
pub struct LogHandler {
    runner: String,
}

impl LogHandler {
    pub fn new(runner: &str) -> Self {
        Self { runner: runner.to_string() }
    }
}

impl MessageHandler for LogHandler {
    fn did_receive(&self, body: &str) -> Result<()> {
        let record = serde_json::from_str::<LogRecord>(body).unwrap_or_else(|_| LogRecord {
            level: None,
            message: body.to_string(),
        });

        match record.level.as_deref().unwrap_or("info") {
            "debug" => debug!(runner = %self.runner, "{}", record.message),
            "warn" => warn!(runner = %self.runner, "{}", record.message),
            "error" => error!(runner = %self.runner, "{}", record.message),
            _ => info!(runner = %self.runner, "{}", record.message),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// networking

#[derive(Debug, Deserialize)]
struct NetworkRequest {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: Option<HashMap<String, String>>,
    #[serde(default)]
    params: Option<HashMap<String, String>>,
    #[serde(default)]
    body: Option<Value>,
    /// Seconds
    #[serde(default)]
    timeout: Option<f64>,
}

#[derive(Debug, Serialize)]
struct NetworkResponse {
    status: u16,
    headers: HashMap<String, String>,
    data: String,
}

/// Performs HTTP requests on behalf of runner scripts
pub struct NetworkHandler {
    runner: String,
    client: reqwest::Client,
}

impl NetworkHandler {
    pub fn new(runner: &str, client: reqwest::Client) -> Self {
        Self {
            runner: runner.to_string(),
            client,
        }
    }

    fn build(&self, request: NetworkRequest) -> Result<reqwest::RequestBuilder> {
        let method = request.method.as_deref().unwrap_or("GET").to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| BridgeError::Validation(format!("Invalid HTTP method {}", method)))?;
        let mut url = url::Url::parse(&request.url)
            .map_err(|e| BridgeError::Validation(format!("Invalid URL {}: {}", request.url, e)))?;

        if let Some(params) = &request.params {
            url.query_pairs_mut().extend_pairs(params.iter());
        }

        let mut builder = self.client.request(method, url);
        for (name, value) in request.headers.iter().flatten() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            Some(Value::String(text)) => builder.body(text),
            Some(Value::Null) | None => builder,
            Some(other) => builder.json(&other),
        };
        if let Some(seconds) = request.timeout.filter(|s| *s > 0.0) {
            let timeout = std::time::Duration::try_from_secs_f64(seconds)
                .map_err(|e| BridgeError::Validation(format!("Invalid timeout {}: {}", seconds, e)))?;
            builder = builder.timeout(timeout);
        }
        Ok(builder)
    }
}

#[async_trait]
impl ReplyHandler for NetworkHandler {
    async fn did_receive(&self, body: String) -> Result<String> {
        let request: NetworkRequest = serde_json::from_str(&body)
            .map_err(|e| BridgeError::Validation(format!("Invalid network request: {}", e)))?;
        debug!(runner = %self.runner, url = %request.url, "Runner network request");

        let response = self
            .build(request)?
            .send()
            .await
            .map_err(|e| BridgeError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
            .collect();
        let data = response
            .text()
            .await
            .map_err(|e| BridgeError::Network(e.to_string()))?;

        serde_json::to_string(&NetworkResponse { status, headers, data })
            .map_err(|e| BridgeError::Engine(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// store

/// Per-runner key-value persistence
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, runner: &str, key: &str) -> Result<Option<Value>>;
    async fn set(&self, runner: &str, key: &str, value: Value) -> Result<()>;
    async fn remove(&self, runner: &str, key: &str) -> Result<()>;
}

/// Process-local store; values do not survive a restart
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<(String, String), Value>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, runner: &str, key: &str) -> Result<Option<Value>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&(runner.to_string(), key.to_string())).cloned())
    }

    async fn set(&self, runner: &str, key: &str, value: Value) -> Result<()> {
        self.entries
            .write()
            .await
            .insert((runner.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn remove(&self, runner: &str, key: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .remove(&(runner.to_string(), key.to_string()));
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum StoreRequest {
    Get { key: String },
    Set { key: String, value: Value },
    Remove { key: String },
}

/// Serves the `store` channel from a `KeyValueStore`
pub struct StoreHandler {
    runner: String,
    store: Arc<dyn KeyValueStore>,
}

impl StoreHandler {
    pub fn new(runner: &str, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            runner: runner.to_string(),
            store,
        }
    }
}

#[async_trait]
impl ReplyHandler for StoreHandler {
    async fn did_receive(&self, body: String) -> Result<String> {
        let request: StoreRequest = serde_json::from_str(&body)
            .map_err(|e| BridgeError::Store(format!("Invalid store request: {}", e)))?;

        let value = match request {
            StoreRequest::Get { key } => self.store.get(&self.runner, &key).await?,
            StoreRequest::Set { key, value } => {
                self.store.set(&self.runner, &key, value).await?;
                None
            }
            StoreRequest::Remove { key } => {
                self.store.remove(&self.runner, &key).await?;
                None
            }
        };

        Ok(serde_json::json!({ "value": value }).to_string())
    }
}
