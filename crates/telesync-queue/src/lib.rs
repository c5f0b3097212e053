//! telesync-queue: durable outbound queue and at-least-once delivery.

pub mod consent;
pub mod courier;
pub mod error;
pub mod http;
pub mod store;

pub use consent::{ConsentClient, ConsentRequest};
pub use courier::{DeliveryCourier, FlushOutcome, RemoteSink};
pub use error::{DeliveryError, StoreError};
pub use http::{HttpSink, endpoint};
pub use store::{DurableQueueStore, MemoryQueueStore, SqliteQueueStore};
