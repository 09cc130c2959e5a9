use futures::{StreamExt, stream::BoxStream};
use reqwest::{Client, header::ACCEPT};
use tracing::debug;
use uuid::Uuid;

use crate::dto::sse::{
    EVENT_FINISH, EVENT_GOAL, EVENT_INACTIVE, EVENT_INIT, EVENT_PING, FinishEvent, GoalEvent,
    InitEvent, PingEvent,
};

/// Which push stream to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTarget {
    /// Events of one match.
    Match(Uuid),
    /// Dashboard ticker following whichever match is live.
    Live,
}

impl StreamTarget {
    /// The match a per-match stream is bound to.
    pub fn match_id(self) -> Option<Uuid> {
        match self {
            StreamTarget::Match(match_id) => Some(match_id),
            StreamTarget::Live => None,
        }
    }
}

/// Decoded push message.
#[derive(Debug, Clone)]
pub enum PushMessage {
    /// Full log snapshot.
    Init(InitEvent),
    /// A goal was logged.
    Goal(GoalEvent),
    /// The match finished.
    Finish(FinishEvent),
    /// Keep-alive with the server clock.
    Ping(PingEvent),
    /// No match is live.
    Inactive,
    /// Event name this client does not know.
    Unknown(String),
}

impl PushMessage {
    /// Decode one SSE frame from its event name and data field.
    pub fn parse(event: &str, data: &str) -> serde_json::Result<Self> {
        Ok(match event {
            EVENT_INIT => Self::Init(serde_json::from_str(data)?),
            EVENT_GOAL => Self::Goal(serde_json::from_str(data)?),
            EVENT_FINISH => Self::Finish(serde_json::from_str(data)?),
            EVENT_PING => Self::Ping(serde_json::from_str(data)?),
            EVENT_INACTIVE => Self::Inactive,
            other => Self::Unknown(other.to_string()),
        })
    }
}

/// Lifecycle of one push subscription as seen by the sync channel.
#[derive(Debug, Clone)]
pub enum StreamSignal {
    /// The subscription is established.
    Opened,
    /// A decoded message.
    Message(PushMessage),
    /// The subscription failed; the stream ends after this signal.
    Error(String),
    /// The server closed the subscription.
    Closed,
}

/// Opens push subscriptions.
pub trait EventSubscriber: Send + Sync {
    /// Subscribe to `target`. The stream yields `Opened` first when it connects.
    fn subscribe(&self, target: StreamTarget) -> BoxStream<'static, StreamSignal>;
}

/// Incremental parser for `text/event-stream` bodies.
#[derive(Debug, Default)]
pub struct SseFrameParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseFrameParser {
    /// Feed a chunk and return every `(event, data)` frame it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<(String, String)> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(end) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        frames
    }

    fn dispatch(&mut self) -> Option<(String, String)> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some((event.unwrap_or_else(|| "message".to_string()), data))
    }
}

/// [`EventSubscriber`] reading the server's SSE routes.
#[derive(Clone)]
pub struct SseSubscriber {
    client: Client,
    base_url: String,
}

impl SseSubscriber {
    /// The client must not carry a total request timeout, or it would cut long streams.
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, target: StreamTarget) -> String {
        match target {
            StreamTarget::Match(match_id) => format!("{}/sse/matches/{match_id}", self.base_url),
            StreamTarget::Live => format!("{}/sse/live", self.base_url),
        }
    }
}

impl EventSubscriber for SseSubscriber {
    fn subscribe(&self, target: StreamTarget) -> BoxStream<'static, StreamSignal> {
        let request = self
            .client
            .get(self.url(target))
            .header(ACCEPT, "text/event-stream");

        let stream = async_stream::stream! {
            let response = match request.send().await {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    yield StreamSignal::Error(format!("server answered {}", response.status()));
                    return;
                }
                Err(err) => {
                    yield StreamSignal::Error(err.to_string());
                    return;
                }
            };

            yield StreamSignal::Opened;

            let mut parser = SseFrameParser::default();
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield StreamSignal::Error(err.to_string());
                        return;
                    }
                };
                for (event, data) in parser.feed(&chunk) {
                    match PushMessage::parse(&event, &data) {
                        Ok(message) => yield StreamSignal::Message(message),
                        Err(err) => debug!(?target, event = %event, error = %err, "dropping malformed push message"),
                    }
                }
            }

            yield StreamSignal::Closed;
        };

        stream.boxed()
    }
}
