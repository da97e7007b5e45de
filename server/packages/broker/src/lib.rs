//! Live value collection over a publish/subscribe broker.
//!
//! [`client`] is the thin subscribe/receive/unsubscribe layer (NATS in
//! production, an in-memory stream in tests). [`collector`] builds the
//! bounded "current value" and "N sequential values" semantics on top of it.

pub mod client;
pub mod collector;
pub mod memory;

pub use client::{BrokerConfig, BrokerError, NatsValueStream, TopicMessage, TopicSubscription, ValueStream};
pub use collector::{CollectionGate, Collector, CollectorError, Sample, MAX_SAMPLES};
pub use memory::MemoryValueStream;
