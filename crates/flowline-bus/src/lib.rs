//! The Notification Bus (C) and Distributed Loop KV (D), both backed by
//! NATS JetStream, with an in-process fallback for D.

pub mod error;
pub mod loopkv;
pub mod notification;

pub use error::{BusError, BusResult};
pub use loopkv::{LoopCounters, LoopKey, LoopKv, LoopMode, LocalLoopKv, NatsLoopKv};
pub use notification::{BusConfig, NatsNotificationBus, Notification, NotificationPublisher};
