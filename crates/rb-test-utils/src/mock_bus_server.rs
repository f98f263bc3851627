// mock_bus_server: a scripted bus peer for client-side tests.
//
// Binds to port 0 (random) and speaks the 5-tuple frame protocol with
// configurable behavior: join replies can be scripted (error codes, silence
// to provoke timeouts), heartbeat replies can be withheld to trigger the
// client's liveness close, and `close_all` drops every live connection to
// simulate an unclean transport loss.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use rb_protocol::{EventKind, Frame, ReplyPayload, SYSTEM_TOPIC};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast};
use tokio_tungstenite::tungstenite::protocol::Message;

/// How the mock answers one `chan:join`.
#[derive(Debug, Clone)]
pub enum JoinReply {
    Ok,
    Error { code: String, reason: String },
    /// Never reply, provoking the client's request timeout.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct MockBusOptions {
    /// Replies consumed per join in order; exhausted script means `Ok`.
    pub join_script: Vec<JoinReply>,
    /// Withhold heartbeat replies to trigger the client's liveness close.
    pub answer_heartbeats: bool,
    /// Reply ok to broadcast requests carrying a sequence.
    pub ack_broadcasts: bool,
}

impl Default for MockBusOptions {
    fn default() -> Self {
        MockBusOptions {
            join_script: Vec::new(),
            answer_heartbeats: true,
            ack_broadcasts: true,
        }
    }
}

struct Shared {
    options: MockBusOptions,
    join_cursor: AtomicU64,
    log: Mutex<Vec<Frame>>,
    kill: broadcast::Sender<()>,
}

impl Shared {
    fn next_join_reply(&self) -> JoinReply {
        let index = self.join_cursor.fetch_add(1, Ordering::SeqCst) as usize;
        self.options
            .join_script
            .get(index)
            .cloned()
            .unwrap_or(JoinReply::Ok)
    }
}

pub struct MockBusServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockBusServer {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        Self::start_with(MockBusOptions::default()).await
    }

    pub async fn start_with(options: MockBusOptions) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (kill, _) = broadcast::channel(4);
        let shared = Arc::new(Shared {
            options,
            join_cursor: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
            kill,
        });

        let accept_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let conn_shared = Arc::clone(&accept_shared);
                        tokio::spawn(async move {
                            let _ = handle_connection(stream, conn_shared).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(MockBusServer {
            addr,
            shared,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Every frame received so far, in arrival order across connections.
    pub async fn received(&self) -> Vec<Frame> {
        self.shared.log.lock().await.clone()
    }

    /// Drop every live connection without a clean close.
    pub fn close_all(&self) {
        let _ = self.shared.kill.send(());
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    shared: Arc<Shared>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();
    let mut kill = shared.kill.subscribe();

    loop {
        tokio::select! {
            _ = kill.recv() => {
                // Dropped without a close handshake: an unclean loss.
                return Ok(());
            }
            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(_)) | None => return Ok(()),
                };
                let text = match msg {
                    Message::Text(t) => t,
                    Message::Close(_) => return Ok(()),
                    Message::Ping(data) => {
                        write.send(Message::Pong(data)).await?;
                        continue;
                    }
                    _ => continue,
                };
                let Ok(frame) = Frame::decode(text.as_str()) else {
                    continue;
                };
                shared.log.lock().await.push(frame.clone());

                let reply = match frame.event_kind() {
                    Some(EventKind::Heartbeat) if frame.topic == SYSTEM_TOPIC => {
                        if shared.options.answer_heartbeats {
                            frame.seq.clone().map(|seq| (seq, ReplyPayload::ok(json!({}))))
                        } else {
                            None
                        }
                    }
                    Some(EventKind::Join) => match shared.next_join_reply() {
                        JoinReply::Ok => frame
                            .seq
                            .clone()
                            .map(|seq| (seq, ReplyPayload::ok(json!({})))),
                        JoinReply::Error { code, reason } => frame
                            .seq
                            .clone()
                            .map(|seq| (seq, ReplyPayload::error(&code, &reason))),
                        JoinReply::Ignore => None,
                    },
                    Some(EventKind::Leave) | Some(EventKind::Presence) => frame
                        .seq
                        .clone()
                        .map(|seq| (seq, ReplyPayload::ok(json!({})))),
                    Some(EventKind::Broadcast) if shared.options.ack_broadcasts => frame
                        .seq
                        .clone()
                        .map(|seq| (seq, ReplyPayload::ok(json!({})))),
                    _ => None,
                };

                if let Some((seq, payload)) = reply {
                    let reply_frame = Frame::reply(seq, frame.topic.clone(), payload);
                    if let Ok(text) = reply_frame.encode() {
                        write.send(Message::Text(text.into())).await?;
                    }
                }
            }
        }
    }
}
