//! Composite `topic:partition:offset` positions exchanged with the host pipeline.
//!
//! The host reports the lowest position it has fully processed as a single
//! string covering every partition, e.g. `orders:0:100,orders:1:55`. Entries
//! that do not parse are skipped so the well-formed partitions still make
//! commit progress.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartitionOffset {
    pub topic: String,
    pub partition: i32,
    /// Last offset that is safe to commit. The broker is given `offset + 1`.
    pub offset: i64,
}

impl TopicPartitionOffset {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// Offset to hand to the broker: the next one to read on resume.
    pub fn commit_offset(&self) -> i64 {
        self.offset + 1
    }
}

impl fmt::Display for TopicPartitionOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.topic, self.partition, self.offset)
    }
}

pub fn decode(encoded: &str) -> Vec<TopicPartitionOffset> {
    if encoded.is_empty() {
        return Vec::new();
    }

    encoded
        .split(',')
        .filter_map(|entry| {
            let fields: Vec<&str> = entry.split(':').collect();
            let [topic, partition, offset] = fields.as_slice() else {
                return None;
            };
            let partition = partition.parse::<i32>().ok()?;
            let offset = offset.parse::<i64>().ok()?;
            Some(TopicPartitionOffset::new(*topic, partition, offset))
        })
        .collect()
}

pub fn encode(positions: &[TopicPartitionOffset]) -> String {
    positions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
