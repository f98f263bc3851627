//! Redis-streams fabric backend.
//!
//! One stream per topic (`relay:stream:{topic}`), appended with `XADD` under
//! an approximate length cap and a TTL refreshed on every publish so inactive
//! topics age out.  Subscriptions poll with short blocking `XREAD` calls and
//! resume from the last-seen id, so a dropped connection replays the missed
//! tail instead of losing it.

use crate::{FabricBackend, FabricError, FabricMessage, FabricSubscription};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Approximate per-topic stream retention.
const STREAM_MAX_LEN: usize = 1000;
/// Streams with no publishes for this long disappear.
const STREAM_TTL_SECS: i64 = 3600;
/// Blocking window of each `XREAD`; doubles as the polling cadence.
const POLL_BLOCK_MS: usize = 100;
/// Backoff after a failed read before the subscriber retries.
const RETRY_DELAY: Duration = Duration::from_secs(1);
const SUBSCRIPTION_CAP: usize = 256;
const PAYLOAD_FIELD: &str = "payload";

fn stream_key(topic: &str) -> String {
    format!("relay:stream:{topic}")
}

pub struct RedisFabric {
    conn: ConnectionManager,
    pollers: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Last-seen stream id per topic, kept across resubscribes.
    last_ids: Arc<Mutex<HashMap<String, String>>>,
}

impl RedisFabric {
    pub async fn connect(url: &str) -> Result<Self, FabricError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(RedisFabric {
            conn,
            pollers: Mutex::new(HashMap::new()),
            last_ids: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Current tail id of the stream, or the stream origin when empty.
    async fn tail_id(conn: &mut ConnectionManager, key: &str) -> Result<String, FabricError> {
        let entries: Vec<(String, HashMap<String, redis::Value>)> = redis::cmd("XREVRANGE")
            .arg(key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await?;
        Ok(entries
            .first()
            .map_or_else(|| "0-0".to_owned(), |(id, _)| id.clone()))
    }
}

#[async_trait]
impl FabricBackend for RedisFabric {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<String, FabricError> {
        let key = stream_key(topic);
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(&key)
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAX_LEN)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        let _: i64 = conn.expire(&key, STREAM_TTL_SECS).await?;
        Ok(id)
    }

    async fn subscribe(&self, topic: &str) -> Result<FabricSubscription, FabricError> {
        let key = stream_key(topic);
        let (tx, receiver) = mpsc::channel(SUBSCRIPTION_CAP);
        let mut conn = self.conn.clone();
        let last_ids = Arc::clone(&self.last_ids);
        let topic_name = topic.to_owned();

        let mut last_id = match last_ids.lock().await.get(topic).cloned() {
            Some(id) => id,
            None => Self::tail_id(&mut conn, &key).await?,
        };

        let poller = tokio::spawn(async move {
            let opts = StreamReadOptions::default().count(100).block(POLL_BLOCK_MS);
            loop {
                let reply: Result<StreamReadReply, redis::RedisError> = conn
                    .xread_options(&[key.as_str()], &[last_id.as_str()], &opts)
                    .await;
                let reply = match reply {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(topic = %topic_name, error = %e, "fabric read failed, retrying");
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                };
                for stream in reply.keys {
                    for entry in stream.ids {
                        last_id = entry.id.clone();
                        last_ids
                            .lock()
                            .await
                            .insert(topic_name.clone(), entry.id.clone());
                        let Some(value) = entry.map.get(PAYLOAD_FIELD) else {
                            debug!(topic = %topic_name, id = %entry.id, "entry without payload field");
                            continue;
                        };
                        let Ok(payload) = redis::from_redis_value::<Vec<u8>>(value) else {
                            debug!(topic = %topic_name, id = %entry.id, "non-bytes payload field");
                            continue;
                        };
                        if tx
                            .send(FabricMessage {
                                id: entry.id,
                                payload,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
        });

        let mut pollers = self.pollers.lock().await;
        if let Some(previous) = pollers.insert(topic.to_owned(), poller) {
            previous.abort();
        }
        Ok(FabricSubscription { receiver })
    }

    async fn unsubscribe(&self, topic: &str) {
        if let Some(poller) = self.pollers.lock().await.remove(topic) {
            poller.abort();
        }
    }

    async fn health_check(&self) -> Result<(), FabricError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(FabricError::Backend(format!("unexpected PING reply: {pong}")))
        }
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
