//! Change-data-capture subsystem
//!
//! The client streams typed row events from a binlog endpoint; the consumer
//! manager fans them out to registered consumers, which trigger plugin
//! submissions through the broker gateway.

pub mod client;
pub mod consumers;

pub use client::{CdcClient, EventType, RowEvent};
pub use consumers::{ConsumerManager, EventConsumer, EventFilter};
