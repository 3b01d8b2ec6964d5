//! In-memory event bus.
//!
//! Broadcast-backed [`EventBus`] for embedders and tests. Subscribers
//! filter on routing subjects with the same wildcard rules a messaging
//! backend would apply: `*` matches one token, `>` matches the rest.

use async_trait::async_trait;
use futures::StreamExt;
use gantry_core::events::Event;
use gantry_core::ports::{EventBus, EventStream};
use gantry_core::Result;
use tokio::sync::broadcast;

pub struct InMemoryBus {
    tx: broadcast::Sender<Event>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, event: Event) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        let rx = self.tx.subscribe();
        let pattern = pattern.to_string();

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    // Slow subscribers drop missed events rather than
                    // block the engine.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |event| futures::future::ready(subject_matches(&pattern, &event.subject())))
        .map(Ok);

        Ok(Box::pin(stream))
    }
}

/// Token-wise subject match: `*` is one token, a trailing `>` matches
/// all remaining tokens.
fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), _) => return true,
            (Some(p), Some(s)) => {
                if p != "*" && p != s {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gantry_core::events::RunStartedPayload;
    use gantry_core::ids::RunId;

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("run.>", "run.queued.run_x"));
        assert!(subject_matches("run.queued.*", "run.queued.run_x"));
        assert!(subject_matches("run.*.matrix.*", "run.run_x.matrix.test"));
        assert!(!subject_matches("run.queued.*", "run.started.run_x"));
        assert!(!subject_matches("run.queued", "run.queued.run_x"));
        assert!(subject_matches(">", "anything.at.all"));
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("run.started.*").await.unwrap();

        let run_id = RunId::new();
        bus.publish(Event::RunStarted(RunStartedPayload {
            run_id,
            started_at: Utc::now(),
        }))
        .await
        .unwrap();

        let event = stream.next().await.unwrap().unwrap();
        match event {
            Event::RunStarted(payload) => assert_eq!(payload.run_id, run_id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_filtered_out_events_not_delivered() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("run.completed.*").await.unwrap();

        bus.publish(Event::RunStarted(RunStartedPayload {
            run_id: RunId::new(),
            started_at: Utc::now(),
        }))
        .await
        .unwrap();
        drop(bus);

        // Only the close, never the mismatched event.
        assert!(stream.next().await.is_none());
    }
}
