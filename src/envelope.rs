//! Message envelopes pulled from the consumer multiplexer.
//!
//! An envelope is a single message plus its metadata: owning partition,
//! source offset, optional key, payload, and timestamps. Two sentinel
//! shapes share the type: end-of-stream envelopes (reserved offset, no
//! key) and watermark envelopes (no offset, payload carrying a monotonic
//! timestamp).
//!
//! This module also owns the elasticity routing decision: a pure function
//! of `(key, offset, elasticity_factor)` that narrows a raw partition to a
//! key bucket. The bucket hash is xxh3-64 folded to its upper 32 bits; it
//! is a deployment contract and must match the hash the upstream writer
//! used to shard keys.

use bytes::Bytes;
use xxhash_rust::xxh3::xxh3_64;

use crate::partition::PartitionId;

/// Reserved offset marking end-of-stream envelopes. Offsets starting with
/// a NUL byte are reserved; equality is byte-for-byte.
pub const END_OF_STREAM_OFFSET: &str = "\0END_OF_STREAM";

/// Sentinel payload of an end-of-stream envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndOfStreamMessage {
    /// The stream partition that has ended.
    pub partition: PartitionId,
}

/// Sentinel payload carrying event-time progress for its partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatermarkMessage {
    /// Monotonic event-time watermark in epoch milliseconds.
    pub timestamp: i64,
}

/// Message payload: ordinary bytes or one of the control sentinels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Data(Bytes),
    EndOfStream(EndOfStreamMessage),
    Watermark(WatermarkMessage),
}

/// A single message received from a partition of an input stream.
#[derive(Clone, Debug)]
pub struct Envelope {
    partition: PartitionId,
    offset: Option<String>,
    key: Option<Bytes>,
    payload: Payload,
    size: usize,
    event_time: i64,
    arrival_time: i64,
}

impl Envelope {
    /// An ordinary data envelope. Arrival time is stamped with the current
    /// wall clock; event time 0 means unassigned.
    pub fn new(
        partition: PartitionId,
        offset: impl Into<String>,
        key: Option<Bytes>,
        payload: Bytes,
    ) -> Self {
        let size = key.as_ref().map_or(0, Bytes::len) + payload.len();
        Self {
            partition,
            offset: Some(offset.into()),
            key,
            payload: Payload::Data(payload),
            size,
            event_time: 0,
            arrival_time: wall_clock_ms(),
        }
    }

    /// Sets both timestamps explicitly (epoch milliseconds).
    pub fn with_times(mut self, event_time: i64, arrival_time: i64) -> Self {
        self.event_time = event_time;
        self.arrival_time = arrival_time;
        self
    }

    /// The end-of-stream envelope for a partition: reserved offset, no
    /// key, sentinel payload carrying the partition.
    pub fn end_of_stream(partition: PartitionId) -> Self {
        Self {
            partition: partition.clone(),
            offset: Some(END_OF_STREAM_OFFSET.to_string()),
            key: None,
            payload: Payload::EndOfStream(EndOfStreamMessage { partition }),
            size: 0,
            event_time: 0,
            arrival_time: wall_clock_ms(),
        }
    }

    /// A watermark envelope: no offset, payload carrying a monotonic
    /// timestamp.
    pub fn watermark(partition: PartitionId, timestamp: i64) -> Self {
        Self {
            partition,
            offset: None,
            key: None,
            payload: Payload::Watermark(WatermarkMessage { timestamp }),
            size: 0,
            event_time: 0,
            arrival_time: wall_clock_ms(),
        }
    }

    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    pub fn offset(&self) -> Option<&str> {
        self.offset.as_deref()
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn event_time(&self) -> i64 {
        self.event_time
    }

    pub fn arrival_time(&self) -> i64 {
        self.arrival_time
    }

    /// True iff the offset equals the reserved end-of-stream literal.
    pub fn is_end_of_stream(&self) -> bool {
        self.offset
            .as_deref()
            .is_some_and(|offset| offset.as_bytes() == END_OF_STREAM_OFFSET.as_bytes())
    }

    pub fn is_watermark(&self) -> bool {
        matches!(self.payload, Payload::Watermark(_))
    }

    /// The partition this envelope routes to under the given elasticity
    /// factor.
    ///
    /// With `factor <= 1` this is the raw partition. Otherwise the bucket
    /// is derived from the key, falling back to the offset; envelopes with
    /// neither (watermarks) land in bucket 0. Sentinels that must reach
    /// every key bucket of the partition are the caller's responsibility
    /// to fan out.
    pub fn effective_partition(&self, elasticity_factor: u32) -> PartitionId {
        if elasticity_factor <= 1 {
            return self.partition.clone();
        }
        let hashable = self
            .key
            .as_deref()
            .or_else(|| self.offset.as_deref().map(str::as_bytes));
        match hashable {
            Some(bytes) => self
                .partition
                .with_key_bucket(key_bucket_for(bytes, elasticity_factor)),
            None => self.partition.with_key_bucket(0),
        }
    }
}

/// Envelope identity ignores timestamps, matching how scripted test
/// doubles and routing compare messages.
impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.partition == other.partition
            && self.offset == other.offset
            && self.key == other.key
            && self.payload == other.payload
    }
}

impl Eq for Envelope {}

/// Key bucket for a hashable key or offset.
///
/// The hash code is spread modulo 31 before the final fold so poorly
/// distributed inputs still cover all buckets; the factor is capped at 16
/// by configuration, so 31 is safe as the intermediate modulus.
pub fn key_bucket_for(hashable: &[u8], elasticity_factor: u32) -> u32 {
    let hash = (xxh3_64(hashable) >> 32) as u32;
    (hash % 31) % elasticity_factor
}

fn wall_clock_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Partition;

    fn ssp() -> PartitionId {
        PartitionId::new("test-system", "test-stream", Partition(0))
    }

    #[test]
    fn end_of_stream_offset_is_recognized_bytewise() {
        let eos = Envelope::end_of_stream(ssp());
        assert!(eos.is_end_of_stream());
        assert_eq!(eos.offset(), Some(END_OF_STREAM_OFFSET));
        assert!(eos.offset().unwrap().as_bytes().starts_with(&[0]));

        let ordinary = Envelope::new(ssp(), "END_OF_STREAM", None, Bytes::new());
        assert!(!ordinary.is_end_of_stream());
    }

    #[test]
    fn watermark_has_no_offset() {
        let wm = Envelope::watermark(ssp(), 42);
        assert!(wm.is_watermark());
        assert!(!wm.is_end_of_stream());
        assert_eq!(wm.offset(), None);
        assert_eq!(
            wm.payload(),
            &Payload::Watermark(WatermarkMessage { timestamp: 42 })
        );
    }

    #[test]
    fn factor_one_keeps_the_raw_partition() {
        let env = Envelope::new(ssp(), "7", Some(Bytes::from_static(b"key")), Bytes::new());
        assert_eq!(env.effective_partition(1), ssp());
        assert_eq!(env.effective_partition(0), ssp());
    }

    #[test]
    fn key_takes_precedence_over_offset() {
        let keyed = Envelope::new(ssp(), "7", Some(Bytes::from_static(b"key0")), Bytes::new());
        let expected = ssp().with_key_bucket(key_bucket_for(b"key0", 4));
        assert_eq!(keyed.effective_partition(4), expected);
    }

    #[test]
    fn keyless_envelope_routes_by_offset() {
        let unkeyed = Envelope::new(ssp(), "7", None, Bytes::new());
        let expected = ssp().with_key_bucket(key_bucket_for(b"7", 4));
        assert_eq!(unkeyed.effective_partition(4), expected);
    }

    #[test]
    fn watermark_without_key_or_offset_lands_in_bucket_zero() {
        let wm = Envelope::watermark(ssp(), 99);
        assert_eq!(wm.effective_partition(4), ssp().with_key_bucket(0));
    }

    #[test]
    fn bucket_follows_the_documented_fold() {
        let keys: [&[u8]; 4] = [b"a", b"key0", b"key1", b"\x00END_OF_STREAM"];
        for key in keys {
            for factor in 2..=16u32 {
                let bucket = key_bucket_for(key, factor);
                let expected = ((xxh3_64(key) >> 32) as u32 % 31) % factor;
                assert_eq!(bucket, expected);
                assert!(bucket < factor);
            }
        }
    }

    #[test]
    fn same_key_always_routes_to_the_same_bucket() {
        let a = Envelope::new(ssp(), "0", Some(Bytes::from_static(b"key")), Bytes::new());
        let b = Envelope::new(ssp(), "9", Some(Bytes::from_static(b"key")), Bytes::new());
        assert_eq!(a.effective_partition(8), b.effective_partition(8));
    }

    #[test]
    fn size_covers_key_and_payload() {
        let env = Envelope::new(
            ssp(),
            "0",
            Some(Bytes::from_static(b"key0")),
            Bytes::from_static(b"value0"),
        );
        assert_eq!(env.size(), 10);
    }

    #[test]
    fn equality_ignores_timestamps() {
        let a = Envelope::new(ssp(), "0", None, Bytes::from_static(b"v")).with_times(1, 2);
        let b = Envelope::new(ssp(), "0", None, Bytes::from_static(b"v")).with_times(3, 4);
        assert_eq!(a, b);
    }
}
