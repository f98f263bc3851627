use futures_util::{SinkExt, StreamExt};
use rb_protocol::{ChannelConfig, EventKind, Frame, JoinPayload};
use std::time::Duration;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A raw frame-level client for driving a bus server in tests, with none of
/// the client library's timers or state machines in the way.
pub struct TestLink {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
    next_seq: u64,
}

impl TestLink {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self {
            write,
            read,
            next_seq: 1,
        })
    }

    /// Allocate the next request sequence on this link.
    pub fn next_seq(&mut self) -> String {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq.to_string()
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), Box<dyn std::error::Error>> {
        let text = frame.encode()?;
        self.write.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Send raw text, for malformed-frame tests.
    pub async fn send_text(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    /// Next decodable frame; skips control messages.
    pub async fn recv_frame(&mut self) -> Result<Frame, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Frame::decode(text.as_str())?);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    pub async fn recv_frame_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Frame, Box<dyn std::error::Error>> {
        tokio::time::timeout(timeout, self.recv_frame())
            .await
            .map_err(|_| "timed out waiting for frame")?
    }

    /// True when nothing arrives within the window; used to assert that a
    /// frame was *not* delivered.
    pub async fn expect_silence(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.recv_frame()).await.is_err()
    }

    /// Send a `chan:join` and return the reply frame.
    pub async fn join(
        &mut self,
        topic: &str,
        config: &ChannelConfig,
    ) -> Result<Frame, Box<dyn std::error::Error>> {
        self.join_with_token(topic, config, None).await
    }

    pub async fn join_with_token(
        &mut self,
        topic: &str,
        config: &ChannelConfig,
        access_token: Option<&str>,
    ) -> Result<Frame, Box<dyn std::error::Error>> {
        let seq = self.next_seq();
        let payload = JoinPayload {
            config: config.clone(),
            access_token: access_token.map(ToOwned::to_owned),
        };
        let frame = Frame::new(
            Some(seq.clone()),
            Some(seq.clone()),
            topic,
            EventKind::Join,
            serde_json::to_value(payload)?,
        );
        self.send_frame(&frame).await?;
        loop {
            let reply = self.recv_frame_timeout(Duration::from_secs(5)).await?;
            if reply.event_kind() == Some(EventKind::Reply) && reply.seq.as_deref() == Some(&seq) {
                return Ok(reply);
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
