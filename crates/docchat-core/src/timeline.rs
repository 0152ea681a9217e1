//! File-generation timeline from an external backend.
//!
//! The backend exposes `GET /health` and a newline-delimited JSON event
//! stream at `GET /events`, one `{"event": ..., "data": {...}}` object per
//! line. [`TimelineMonitor`] keeps a connection up and forwards accepted
//! events as [`TimelineUpdate`]s.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TimelineConfig;
use crate::providers::shared::USER_AGENT;
use crate::reconciler::ingest::LineBuffer;

const HEALTH_PATH: &str = "/health";
const EVENTS_PATH: &str = "/events";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The event vocabulary the backend emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimelineEventKind {
    FileStateUpdate,
    ContentUpdate,
    BlockApproved,
    BlockRejected,
    FileApproved,
    AllFilesProcessed,
    InitialFileList,
    FileGenerationStatus,
}

impl TimelineEventKind {
    pub const ALL: [TimelineEventKind; 8] = [
        TimelineEventKind::FileStateUpdate,
        TimelineEventKind::ContentUpdate,
        TimelineEventKind::BlockApproved,
        TimelineEventKind::BlockRejected,
        TimelineEventKind::FileApproved,
        TimelineEventKind::AllFilesProcessed,
        TimelineEventKind::InitialFileList,
        TimelineEventKind::FileGenerationStatus,
    ];

    /// Wire name, e.g. `fileStateUpdate`.
    pub fn name(self) -> &'static str {
        match self {
            TimelineEventKind::FileStateUpdate => "fileStateUpdate",
            TimelineEventKind::ContentUpdate => "contentUpdate",
            TimelineEventKind::BlockApproved => "blockApproved",
            TimelineEventKind::BlockRejected => "blockRejected",
            TimelineEventKind::FileApproved => "fileApproved",
            TimelineEventKind::AllFilesProcessed => "allFilesProcessed",
            TimelineEventKind::InitialFileList => "initialFileList",
            TimelineEventKind::FileGenerationStatus => "fileGenerationStatus",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            TimelineEventKind::FileStateUpdate => "State Update",
            TimelineEventKind::ContentUpdate => "Content Change",
            TimelineEventKind::BlockApproved => "Block Approved",
            TimelineEventKind::BlockRejected => "Block Rejected",
            TimelineEventKind::FileApproved => "File Approved",
            TimelineEventKind::AllFilesProcessed => "Processing Complete",
            TimelineEventKind::InitialFileList => "File List",
            TimelineEventKind::FileGenerationStatus => "Generation Status",
        }
    }
}

impl fmt::Display for TimelineEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Event payload. Only `file` is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineData {
    pub file: String,
    #[serde(default)]
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
    /// Backend timestamp in milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// One line of the event stream, before validation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TimelineMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// An accepted event, stamped on receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event: TimelineEventKind,
    pub data: TimelineData,
}

impl TimelineEntry {
    /// Validates a raw message. Unknown event names and payloads without a
    /// `file` are rejected.
    pub fn from_message(message: TimelineMessage) -> Option<Self> {
        let Some(event) = TimelineEventKind::from_name(&message.event) else {
            debug!(event = %message.event, "Skipping unknown timeline event");
            return None;
        };

        let has_file = message
            .data
            .get("file")
            .and_then(Value::as_str)
            .is_some_and(|file| !file.is_empty());
        if !has_file {
            warn!(event = event.name(), "Timeline event without a file");
            return None;
        }

        match serde_json::from_value::<TimelineData>(message.data) {
            Ok(data) => Some(Self {
                id: uuid::Uuid::new_v4().to_string(),
                timestamp: Utc::now(),
                event,
                data,
            }),
            Err(err) => {
                warn!(event = event.name(), error = %err, "Invalid timeline payload");
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineError {
    /// The backend refused our credentials (HTTP 403).
    Auth,
    /// The backend answered with a non-success status.
    Server(u16),
    /// The backend could not be reached or the stream broke.
    Connection(String),
}

impl fmt::Display for TimelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimelineError::Auth => write!(f, "Authentication failed - please check your API key"),
            TimelineError::Server(status) => write!(f, "Server error: {status}"),
            TimelineError::Connection(message) => write!(f, "Connection failed: {message}"),
        }
    }
}

impl std::error::Error for TimelineError {}

/// A source of timeline messages.
pub trait TimelineSource: Send {
    /// Establishes a connection, replacing any previous one.
    fn connect(&mut self) -> impl Future<Output = Result<(), TimelineError>> + Send;

    /// Next message, or `None` once the connection closed cleanly.
    fn next_event(
        &mut self,
    ) -> impl Future<Output = Result<Option<TimelineMessage>, TimelineError>> + Send;
}

type EventStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// HTTP backend: health check, then an NDJSON event stream.
pub struct HttpTimelineSource {
    base_url: String,
    http: reqwest::Client,
    stream: Option<EventStream>,
    lines: LineBuffer,
    pending: VecDeque<Vec<u8>>,
}

impl fmt::Debug for HttpTimelineSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTimelineSource")
            .field("base_url", &self.base_url)
            .field("connected", &self.stream.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpTimelineSource {
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        url::Url::parse(&base_url)
            .with_context(|| format!("Invalid timeline URL: {base_url}"))?;
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url,
            http,
            stream: None,
            lines: LineBuffer::new(),
            pending: VecDeque::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

async fn get(
    http: &reqwest::Client,
    base_url: &str,
    path: &str,
) -> Result<reqwest::Response, TimelineError> {
    let url = format!("{base_url}{path}");
    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| TimelineError::Connection(e.to_string()))?;

    let status = response.status();
    if status == StatusCode::FORBIDDEN {
        return Err(TimelineError::Auth);
    }
    if !status.is_success() {
        return Err(TimelineError::Server(status.as_u16()));
    }
    Ok(response)
}

impl TimelineSource for HttpTimelineSource {
    async fn connect(&mut self) -> Result<(), TimelineError> {
        self.stream = None;
        self.lines = LineBuffer::new();
        self.pending.clear();

        get(&self.http, &self.base_url, HEALTH_PATH).await?;
        let response = get(&self.http, &self.base_url, EVENTS_PATH).await?;
        self.stream = Some(Box::pin(response.bytes_stream()));
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<TimelineMessage>, TimelineError> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<TimelineMessage>(&line) {
                    Ok(message) => return Ok(Some(message)),
                    Err(err) => {
                        warn!(error = %err, "Discarding malformed timeline line");
                        continue;
                    }
                }
            }

            let Some(stream) = self.stream.as_mut() else {
                return Ok(None);
            };
            match stream.next().await {
                Some(Ok(chunk)) => self.pending.extend(self.lines.push(&chunk)),
                Some(Err(err)) => {
                    self.stream = None;
                    return Err(TimelineError::Connection(err.to_string()));
                }
                None => {
                    self.stream = None;
                    self.pending.extend(self.lines.take_remainder());
                }
            }
        }
    }
}

/// Connection state reported by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    /// A connection attempt failed; another follows after the poll interval.
    Retrying {
        attempt: u32,
        max: u32,
        reason: String,
    },
    AuthFailed,
    GaveUp {
        reason: String,
    },
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "Connected"),
            ConnectionStatus::Disconnected => write!(f, "Disconnected"),
            ConnectionStatus::Retrying { attempt, max, reason } => {
                write!(f, "Connection attempt {attempt}/{max}: {reason}")
            }
            ConnectionStatus::AuthFailed => write!(f, "{}", TimelineError::Auth),
            ConnectionStatus::GaveUp { reason } => write!(
                f,
                "Unable to connect to backend service ({reason}). Please try again later."
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineUpdate {
    Status(ConnectionStatus),
    Entry(TimelineEntry),
}

/// Keeps a [`TimelineSource`] connected and forwards its entries.
#[derive(Debug)]
pub struct TimelineMonitor<S> {
    source: S,
    poll_interval: Duration,
    max_attempts: u32,
}

impl<S: TimelineSource> TimelineMonitor<S> {
    pub fn new(source: S, config: &TimelineConfig) -> Self {
        Self {
            source,
            poll_interval: config.poll_interval(),
            max_attempts: config.max_reconnect_attempts.max(1),
        }
    }

    /// Runs until the receiver is dropped or the monitor gives up.
    ///
    /// Consecutive failed connection attempts are counted; a successful
    /// connection resets the count. An auth failure stops immediately.
    ///
    /// # Errors
    /// Returns the last connection error when giving up, or
    /// [`TimelineError::Auth`].
    pub async fn run(mut self, tx: mpsc::Sender<TimelineUpdate>) -> Result<(), TimelineError> {
        let mut failures = 0u32;

        loop {
            if tx.is_closed() {
                return Ok(());
            }

            match self.source.connect().await {
                Ok(()) => {
                    failures = 0;
                    info!("Timeline connected");
                    if !send(&tx, TimelineUpdate::Status(ConnectionStatus::Connected)).await {
                        return Ok(());
                    }
                    if !self.forward(&tx).await {
                        return Ok(());
                    }
                }
                Err(TimelineError::Auth) => {
                    warn!("Timeline authentication failed");
                    send(&tx, TimelineUpdate::Status(ConnectionStatus::AuthFailed)).await;
                    return Err(TimelineError::Auth);
                }
                Err(err) => {
                    failures += 1;
                    debug!(attempt = failures, error = %err, "Timeline connection failed");
                    if failures >= self.max_attempts {
                        warn!(attempts = failures, error = %err, "Giving up on timeline backend");
                        let status = ConnectionStatus::GaveUp {
                            reason: err.to_string(),
                        };
                        send(&tx, TimelineUpdate::Status(status)).await;
                        return Err(err);
                    }
                    let status = ConnectionStatus::Retrying {
                        attempt: failures,
                        max: self.max_attempts,
                        reason: err.to_string(),
                    };
                    if !send(&tx, TimelineUpdate::Status(status)).await {
                        return Ok(());
                    }
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Forwards entries until the connection ends. Returns `false` once the
    /// receiver is gone.
    async fn forward(&mut self, tx: &mpsc::Sender<TimelineUpdate>) -> bool {
        loop {
            match self.source.next_event().await {
                Ok(Some(message)) => {
                    if let Some(entry) = TimelineEntry::from_message(message)
                        && !send(tx, TimelineUpdate::Entry(entry)).await
                    {
                        return false;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "Timeline stream broke");
                    break;
                }
            }
        }
        send(tx, TimelineUpdate::Status(ConnectionStatus::Disconnected)).await
    }
}

async fn send(tx: &mpsc::Sender<TimelineUpdate>, update: TimelineUpdate) -> bool {
    tx.send(update).await.is_ok()
}
