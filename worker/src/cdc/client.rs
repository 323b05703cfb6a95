//! Binlog stream client
//!
//! Connects to a binlog-streaming endpoint over TCP, sends a one-line JSON
//! subscription naming the destination and batch size, and then consumes
//! newline-delimited JSON row events until the connection drops. Reconnects
//! with jittered exponential backoff; events missed while disconnected are
//! not replayed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::config::CdcConfig;
use shared::Result;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Initial reconnect delay
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Row event types carried by the stream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Insert => "INSERT",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
        }
    }

    /// Case-insensitive parse, used for filter configuration
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Some(EventType::Insert),
            "UPDATE" => Some(EventType::Update),
            "DELETE" => Some(EventType::Delete),
            _ => None,
        }
    }
}

/// One row-level change from the upstream binlog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowEvent {
    pub database: String,
    pub table: String,
    pub event_type: EventType,
    /// Row image as produced upstream
    #[serde(default)]
    pub data: Value,
    /// Upstream event time, Unix seconds
    #[serde(default)]
    pub timestamp: i64,
}

/// Subscription line sent after connecting
#[derive(Serialize)]
struct Subscription<'a> {
    destination: &'a str,
    batch_size: u32,
}

/// Streaming client over one upstream connection
pub struct CdcClient {
    config: CdcConfig,
}

impl CdcClient {
    pub fn new(config: CdcConfig) -> Self {
        Self { config }
    }

    /// Stream row events into the channel until shutdown.
    ///
    /// Runs the connect / subscribe / read cycle forever, backing off
    /// exponentially (with jitter) after each failure and resetting the
    /// backoff once a connection has delivered at least one event.
    pub async fn run(
        &self,
        events_tx: mpsc::Sender<RowEvent>,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut backoff = BACKOFF_INITIAL;

        loop {
            tokio::select! {
                connected = self.stream_connection(&events_tx) => {
                    match connected {
                        Ok(delivered) => {
                            info!(
                                host = %self.config.host,
                                port = self.config.port,
                                delivered,
                                "Binlog stream closed by upstream"
                            );
                            if delivered > 0 {
                                backoff = BACKOFF_INITIAL;
                            }
                        }
                        Err(e) => {
                            warn!(
                                host = %self.config.host,
                                port = self.config.port,
                                "Binlog stream failed: {:#}", e
                            );
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("CDC client received shutdown signal");
                    return Ok(());
                }
            }

            // Jittered exponential backoff before the next connection attempt
            let jitter = 1.0 + (rand::random::<f64>() - 0.5) * 0.4;
            let delay = backoff.mul_f64(jitter).min(BACKOFF_MAX);
            debug!("Reconnecting to binlog stream in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => return Ok(()),
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    /// One connection lifetime: connect, subscribe, stream.
    ///
    /// # Returns
    /// The number of events delivered before the stream ended
    async fn stream_connection(&self, events_tx: &mpsc::Sender<RowEvent>) -> Result<u64> {
        let address = format!("{}:{}", self.config.host, self.config.port);
        let mut stream = TcpStream::connect(&address).await.map_err(|e| {
            shared::SchedulerError::CdcDisconnected(format!("{}: {}", address, e))
        })?;
        info!(address = %address, destination = %self.config.destination, "Connected to binlog stream");

        let subscription = serde_json::to_string(&Subscription {
            destination: &self.config.destination,
            batch_size: self.config.batch_size,
        })?;
        stream.write_all(subscription.as_bytes()).await?;
        stream.write_all(b"\n").await?;

        let mut lines = BufReader::new(stream).lines();
        let mut delivered = 0u64;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RowEvent>(&line) {
                Ok(event) => {
                    if events_tx.send(event).await.is_err() {
                        // Consumer side has shut down
                        return Ok(delivered);
                    }
                    delivered += 1;
                }
                Err(e) => {
                    // Unknown event kinds and malformed lines are skipped,
                    // never fatal for the stream
                    warn!("Skipping unparseable binlog line: {}", e);
                }
            }
        }

        Ok(delivered)
    }
}
