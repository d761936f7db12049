//! AMQP 0.9.1 (RabbitMQ) transport
//!
//! Every channel is opened in publisher-confirm mode, so `publish` resolves only
//! once the broker has accepted the message. Channel-level protocol errors
//! (missing queue, inequivalent declaration) close that channel; callers use a
//! dedicated channel for operations expected to fail that way.

pub mod client;
pub mod options;

pub use client::{AmqpBroker, AmqpChannel, AmqpConnection};
pub use options::{configure_amqp_target, AmqpTarget};
