//! Stream ingestion: consumer-group transport, workers and producer

mod consumer;
mod memory;
mod redis;
mod transport;

pub use consumer::{ConsumerStats, EventConsumer, EventHandler, EventProducer, StreamStats};
pub use memory::MemoryStreams;
pub use redis::RedisStreams;
pub use transport::{StreamMessage, StreamTransport, PAYLOAD_FIELD};
