//! Downstream event emitter.
//!
//! Merges the agent loop's event channel with a keep-alive timer into one
//! stream of frames. Every event becomes its own SSE message, flushed as
//! soon as it is produced. Between events a comment frame goes out on a
//! fixed interval so idle proxies do not cut the connection. The timer lives
//! inside the stream and is stopped once, when the event channel closes or
//! the stream is dropped.

use std::time::Duration;

use axum::response::sse::Event as SseEvent;
use futures::{Stream, StreamExt};
use loopwire_agent::DownstreamEvent;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::debug;

/// Text of the keep-alive comment frame.
pub const HEARTBEAT_COMMENT: &str = "keep-alive";

/// One unit written to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(DownstreamEvent),
    Heartbeat,
}

impl Frame {
    /// Wire text of this frame, exactly as SSE sends it.
    pub fn render(&self) -> String {
        match self {
            Self::Event(event) => format!("data: {}\n\n", event_json(event)),
            Self::Heartbeat => format!(": {HEARTBEAT_COMMENT}\n\n"),
        }
    }

    pub fn into_sse(self) -> SseEvent {
        match self {
            Self::Event(event) => SseEvent::default().data(event_json(&event)),
            Self::Heartbeat => SseEvent::default().comment(HEARTBEAT_COMMENT),
        }
    }
}

fn event_json(event: &DownstreamEvent) -> String {
    serde_json::to_string(event).unwrap_or_default()
}

struct Emitter {
    events: mpsc::Receiver<DownstreamEvent>,
    heartbeat: Option<Interval>,
}

impl Emitter {
    fn stop_heartbeat(&mut self) {
        if self.heartbeat.take().is_some() {
            debug!("Heartbeat stopped");
        }
    }
}

enum Next {
    Event(Option<DownstreamEvent>),
    Tick,
}

/// Stream every event from `events`, interleaved with heartbeats every
/// `interval` while the channel stays open.
pub fn with_heartbeat(
    events: mpsc::Receiver<DownstreamEvent>,
    interval: Duration,
) -> impl Stream<Item = Frame> {
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let emitter = Emitter {
        events,
        heartbeat: Some(heartbeat),
    };

    futures::stream::unfold(emitter, |mut emitter| async move {
        let next = {
            let Some(heartbeat) = emitter.heartbeat.as_mut() else {
                return None;
            };
            tokio::select! {
                biased;
                event = emitter.events.recv() => Next::Event(event),
                _ = heartbeat.tick() => Next::Tick,
            }
        };

        match next {
            Next::Event(Some(event)) => Some((Frame::Event(event), emitter)),
            Next::Event(None) => {
                emitter.stop_heartbeat();
                None
            }
            Next::Tick => Some((Frame::Heartbeat, emitter)),
        }
    })
    .fuse()
}
