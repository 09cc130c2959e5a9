use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    dto::sse::{EVENT_PING, PingEvent, ServerEvent},
    error::ServiceError,
    services::sse_events::{finish_event, inactive_event, init_event},
    state::{
        SharedState,
        match_session::{MatchStatus, now_ms},
    },
};

/// Identifies the stream in logs once the client goes away.
#[derive(Clone, Copy, Debug)]
pub enum StreamKind {
    /// Stream of one match.
    Match(Uuid),
    /// Dashboard ticker.
    Live,
}

/// What a new subscriber receives: a preamble sent once, then the live feed if any.
pub struct Subscription {
    /// Events sent before the live feed.
    pub preamble: Vec<ServerEvent>,
    /// Live feed; `None` once the match is over.
    pub receiver: Option<broadcast::Receiver<ServerEvent>>,
    /// Which stream this is.
    pub kind: StreamKind,
}

/// Subscribe to one match: `init` first, then live events. A finished match gets `init`
/// and `finish` and nothing more.
pub async fn subscribe_match(
    state: &SharedState,
    match_id: Uuid,
) -> Result<Subscription, ServiceError> {
    let store = state.store();
    let session = store
        .find_match(match_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("match `{match_id}` not found")))?;

    let finished = session.status == MatchStatus::Finished;
    // Subscribe before reading the log so nothing appended in between is missed.
    let receiver = (!finished).then(|| state.match_sse(match_id).subscribe());
    let stats = store.list_stats(match_id).await?;

    let mut preamble: Vec<ServerEvent> = init_event(Some(match_id), stats).into_iter().collect();
    if finished {
        preamble.extend(finish_event(&session));
    }

    Ok(Subscription {
        preamble,
        receiver,
        kind: StreamKind::Match(match_id),
    })
}

/// Subscribe to the dashboard ticker: `inactive` when nothing is live, else the live
/// match's `init`.
pub async fn subscribe_live(state: &SharedState) -> Result<Subscription, ServiceError> {
    let receiver = state.live_sse().subscribe();
    let preamble = match state.live_match().await {
        Some(match_id) => {
            let stats = state.store().list_stats(match_id).await?;
            init_event(Some(match_id), stats).into_iter().collect()
        }
        None => vec![inactive_event()],
    };

    Ok(Subscription {
        preamble,
        receiver: Some(receiver),
        kind: StreamKind::Live,
    })
}

fn to_event(payload: ServerEvent) -> Event {
    let mut event = Event::default().data(payload.data);
    if let Some(name) = payload.event {
        event = event.event(name);
    }
    event
}

fn ping_event() -> Option<Event> {
    ServerEvent::json(Some(EVENT_PING.to_string()), &PingEvent { ts: now_ms() })
        .ok()
        .map(to_event)
}

/// Convert a subscription into an SSE response. The preamble goes out first, then
/// broadcast events interleaved with pings. A missing receiver ends the stream after the
/// preamble.
pub fn to_sse_stream(
    subscription: Subscription,
    ping_interval: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let Subscription {
        preamble,
        receiver,
        kind,
    } = subscription;
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);

    tokio::spawn(async move {
        for payload in preamble {
            if tx.send(Ok(to_event(payload))).await.is_err() {
                return;
            }
        }

        let Some(mut receiver) = receiver else {
            debug!(?kind, "SSE stream closed after preamble");
            return;
        };

        let mut ping = tokio::time::interval(ping_interval.max(Duration::from_millis(10)));
        // The first tick completes immediately.
        ping.tick().await;

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                _ = ping.tick() => {
                    if let Some(event) = ping_event()
                        && tx.send(Ok(event)).await.is_err()
                    {
                        break;
                    }
                }
                recv_result = receiver.recv() => {
                    match recv_result {
                        Ok(payload) => {
                            if tx.send(Ok(to_event(payload))).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(skipped)) => {
                            // Receivers re-read the log on the next goal or poll.
                            debug!(?kind, skipped, "SSE subscriber lagged");
                            continue;
                        }
                    }
                }
            }
        }

        info!(?kind, "SSE stream disconnected");
    });

    let stream = ReceiverStream::new(rx);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
