//! Message bus contract and an in-process implementation.
//!
//! Streams are ordered per topic, ids increase monotonically, and readers keep
//! their own [`TopicCursor`] so every consumer sees each entry exactly once.

use crate::error::{LinkError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;

/// One bus entry: string keys to byte values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicMessage {
    pub id: String,
    pub fields: BTreeMap<String, Vec<u8>>,
}

impl TopicMessage {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.fields.get(key).map(Vec::as_slice)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// `"true"` in any case is true; anything else, or absence, is false.
    pub fn flag(&self, key: &str) -> bool {
        self.get_str(key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get_str(key).and_then(|v| v.trim().parse().ok())
    }
}

/// Per-consumer read position over a fixed topic list.
#[derive(Debug, Clone, Default)]
pub struct TopicCursor {
    offsets: Vec<(String, Option<String>)>,
}

impl TopicCursor {
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.offsets.iter().map(|(t, _)| t.as_str())
    }

    pub fn offset(&self, topic: &str) -> Option<&str> {
        self.offsets
            .iter()
            .find(|(t, _)| t == topic)
            .and_then(|(_, id)| id.as_deref())
    }

    pub fn advance(&mut self, topic: &str, id: &str) {
        if let Some(entry) = self.offsets.iter_mut().find(|(t, _)| t == topic) {
            entry.1 = Some(id.to_string());
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Appends to `topic`, trimming it to roughly `maxlen` entries. Returns the id.
    async fn write_topic(&self, topic: &str, message: TopicMessage, maxlen: usize) -> Result<String>;

    /// Blocks up to `timeout` for entries newer than the cursor. An empty
    /// result means the timeout elapsed.
    async fn read_topics(&self, cursor: &mut TopicCursor, timeout: Duration) -> Result<Vec<(String, TopicMessage)>>;

    async fn newest_message(&self, topic: &str) -> Result<Option<TopicMessage>>;

    async fn clear_topics(&self, topics: &[String]) -> Result<()>;

    /// Cursor positioned after the newest entry of each topic.
    async fn cursor(&self, topics: Vec<String>) -> Result<TopicCursor> {
        let mut offsets = Vec::with_capacity(topics.len());
        for topic in topics {
            let last = self.newest_message(&topic).await?.map(|m| m.id);
            offsets.push((topic, last));
        }
        Ok(TopicCursor { offsets })
    }
}

#[derive(Debug, Default)]
struct BusInner {
    next_seq: u64,
    streams: HashMap<String, VecDeque<(u64, TopicMessage)>>,
}

/// In-process bus with stream semantics, for standalone runs and tests.
#[derive(Debug, Default)]
pub struct MemoryBus {
    inner: Mutex<BusInner>,
    notify: Notify,
}

fn parse_seq(id: &str) -> Result<u64> {
    id.split('-')
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| LinkError::Bus(format!("Invalid message id: {id}")))
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry currently retained on `topic`, oldest first.
    pub fn messages(&self, topic: &str) -> Vec<TopicMessage> {
        self.inner
            .lock()
            .streams
            .get(topic)
            .map(|s| s.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default()
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().streams.keys().cloned().collect();
        names.sort();
        names
    }

    fn collect_new(&self, cursor: &TopicCursor) -> Result<Vec<(String, TopicMessage)>> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for topic in cursor.topics() {
            let after = match cursor.offset(topic) {
                Some(id) => parse_seq(id)?,
                None => 0,
            };
            if let Some(stream) = inner.streams.get(topic) {
                out.extend(
                    stream
                        .iter()
                        .filter(|(seq, _)| *seq > after)
                        .map(|(_, m)| (topic.to_string(), m.clone())),
                );
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn write_topic(&self, topic: &str, mut message: TopicMessage, maxlen: usize) -> Result<String> {
        let id = {
            let mut inner = self.inner.lock();
            inner.next_seq += 1;
            let seq = inner.next_seq;
            let id = format!("{seq}-0");
            message.id = id.clone();
            let stream = inner.streams.entry(topic.to_string()).or_default();
            stream.push_back((seq, message));
            while maxlen > 0 && stream.len() > maxlen {
                stream.pop_front();
            }
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn read_topics(&self, cursor: &mut TopicCursor, timeout: Duration) -> Result<Vec<(String, TopicMessage)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let found = self.collect_new(cursor)?;
            if !found.is_empty() {
                for (topic, message) in &found {
                    cursor.advance(topic, &message.id);
                }
                return Ok(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn newest_message(&self, topic: &str) -> Result<Option<TopicMessage>> {
        Ok(self
            .inner
            .lock()
            .streams
            .get(topic)
            .and_then(|s| s.back())
            .map(|(_, m)| m.clone()))
    }

    async fn clear_topics(&self, topics: &[String]) -> Result<()> {
        let mut inner = self.inner.lock();
        for topic in topics {
            inner.streams.remove(topic);
        }
        Ok(())
    }
}
