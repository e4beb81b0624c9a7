//! Per-crawl event bus: broadcast fan-out plus a capped replay buffer.
//!
//! Publishing never blocks on slow subscribers (lagging receivers drop the
//! oldest events, per `tokio::sync::broadcast` semantics) and publishing
//! with zero subscribers is not an error; the event still lands in the
//! replay buffer.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::types::CrawlEvent;

/// Broadcast channel capacity per crawl.
const CHANNEL_CAPACITY: usize = 1024;

/// Default number of events retained for replay per crawl.
const DEFAULT_REPLAY_LIMIT: usize = 1000;

struct Channel {
    sender: broadcast::Sender<CrawlEvent>,
    replay: Mutex<VecDeque<CrawlEvent>>,
}

/// Event bus handle. Cheap to clone; all clones share the channel registry.
#[derive(Clone)]
pub struct EventBus {
    channels: Arc<DashMap<String, Arc<Channel>>>,
    replay_limit: usize,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_replay_limit(DEFAULT_REPLAY_LIMIT)
    }

    #[must_use]
    pub fn with_replay_limit(replay_limit: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            replay_limit,
        }
    }

    fn channel(&self, crawl_id: &str) -> Arc<Channel> {
        self.channels
            .entry(crawl_id.to_string())
            .or_insert_with(|| {
                let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
                Arc::new(Channel {
                    sender,
                    replay: Mutex::new(VecDeque::new()),
                })
            })
            .clone()
    }

    /// Publish an event on the crawl's channel and append it to the replay
    /// buffer. Returns the number of live subscribers that received it.
    pub fn publish(&self, crawl_id: &str, event: CrawlEvent) -> usize {
        let channel = self.channel(crawl_id);

        {
            let mut replay = channel.replay.lock();
            if replay.len() >= self.replay_limit {
                replay.pop_front();
            }
            replay.push_back(event.clone());
        }

        // Err here just means no live subscribers; the replay append above
        // is the durable-ish part.
        channel.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to future events on a crawl's channel. History is not
    /// delivered; use [`EventBus::replay`] for that.
    #[must_use]
    pub fn subscribe(&self, crawl_id: &str) -> broadcast::Receiver<CrawlEvent> {
        self.channel(crawl_id).sender.subscribe()
    }

    /// The retained event history for a crawl, oldest first.
    #[must_use]
    pub fn replay(&self, crawl_id: &str) -> Vec<CrawlEvent> {
        match self.channels.get(crawl_id) {
            Some(channel) => channel.replay.lock().iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Number of live subscribers on a crawl's channel.
    #[must_use]
    pub fn subscriber_count(&self, crawl_id: &str) -> usize {
        self.channels
            .get(crawl_id)
            .map_or(0, |c| c.sender.receiver_count())
    }

    /// Drop a crawl's channel. Live receivers observe closure and end their
    /// streams; called once the owning crawl reaches a terminal state.
    pub fn close(&self, crawl_id: &str) {
        self.channels.remove(crawl_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
