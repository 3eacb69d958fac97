//! Durable storage for raw data items and the fan-out that feeds it.

pub mod breaker;
pub mod cache;
pub mod fs;
pub mod kv;
pub mod object;
pub mod sink;
pub mod tap;

pub use breaker::{BreakerConfig, BreakerError, CircuitBreaker};
pub use cache::{CacheSink, PayloadCache, SharedPayloadCache};
pub use fs::{FsBackupStore, FsRawSink};
pub use kv::{DynamoDbKvRows, InMemoryKvRows, InlineKvSink, InlineRow, KvError, KvRows};
pub use object::{
    InMemoryObjectStore, MIN_PART_SIZE, MULTIPART_PREFIX, ObjectSink, ObjectStore,
    ObjectStoreError, PartEtag, RAW_DATA_ITEM_PREFIX, S3ObjectStore, multipart_key,
    raw_data_item_key,
};
pub use sink::{ByteSink, SinkError, SinkReport};
pub use tap::{TapError, tap_stream};
