//! Publishing, supervised consumption and queue inspection

pub mod consumer;
pub mod monitor;
pub mod publisher;

pub use consumer::{
    ConsumerEvent, ConsumerOptions, ConsumerState, ConsumerSupervisor, Disposition,
    HandlerResult, MessageHandler, PoisonPolicy,
};
pub use monitor::{QueueHealth, QueueMonitor, QueueStatus, StatusReport};
pub use publisher::{PublishReceipt, Publisher};
