//! Identifiers for stream partitions and tasks.
//!
//! A container subscribes to partitions at `(system, stream, partition)`
//! granularity. With elasticity enabled, a partition is further split into
//! key buckets so several tasks can share one source partition; the bucket
//! is part of the partition's identity within the container.

use std::fmt;

/// The numeric shard of an input stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Partition(pub u32);

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fully-qualified partition identity within a container.
///
/// Equality covers all four fields: an id without a key bucket is distinct
/// from the same id with bucket 0.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartitionId {
    system: String,
    stream: String,
    partition: Partition,
    key_bucket: Option<u32>,
}

impl PartitionId {
    pub fn new(system: impl Into<String>, stream: impl Into<String>, partition: Partition) -> Self {
        Self {
            system: system.into(),
            stream: stream.into(),
            partition,
            key_bucket: None,
        }
    }

    /// The same stream partition, narrowed to one key bucket.
    pub fn with_key_bucket(&self, key_bucket: u32) -> Self {
        Self {
            system: self.system.clone(),
            stream: self.stream.clone(),
            partition: self.partition,
            key_bucket: Some(key_bucket),
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn key_bucket(&self) -> Option<u32> {
        self.key_bucket
    }

    /// True when both ids name the same `(system, stream, partition)`,
    /// ignoring key buckets. End-of-stream and watermark fan-out matches on
    /// this triple.
    pub fn same_stream_partition(&self, other: &PartitionId) -> bool {
        self.system == other.system
            && self.stream == other.stream
            && self.partition == other.partition
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key_bucket {
            Some(bucket) => write!(
                f,
                "{}.{}.{}#{}",
                self.system, self.stream, self.partition, bucket
            ),
            None => write!(f, "{}.{}.{}", self.system, self.stream, self.partition),
        }
    }
}

/// Name of a task hosted by the container.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskName(String);

impl TaskName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for TaskName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_bucket_is_part_of_identity() {
        let raw = PartitionId::new("test-system", "test-stream", Partition(0));
        let bucket0 = raw.with_key_bucket(0);
        let bucket1 = raw.with_key_bucket(1);

        assert_ne!(raw, bucket0);
        assert_ne!(bucket0, bucket1);
        assert!(raw.same_stream_partition(&bucket0));
        assert!(bucket0.same_stream_partition(&bucket1));
    }

    #[test]
    fn different_streams_do_not_match() {
        let a = PartitionId::new("test-system", "stream-a", Partition(0));
        let b = PartitionId::new("test-system", "stream-b", Partition(0));
        assert!(!a.same_stream_partition(&b));
    }

    #[test]
    fn display_includes_bucket_when_present() {
        let id = PartitionId::new("kafka", "events", Partition(3));
        assert_eq!(id.to_string(), "kafka.events.3");
        assert_eq!(id.with_key_bucket(1).to_string(), "kafka.events.3#1");
    }
}
