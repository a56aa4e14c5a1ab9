//! # Queue-Relay Core
//!
//! Delivers messages from an SQS queue to an HTTP endpoint, the way the AWS
//! Elastic Beanstalk worker daemon (`sqsd`) does.
//!
//! A [`Dispatcher`] long-polls the queue and spawns one task per message. Each
//! task POSTs the message to the target and deletes it from the queue only
//! when the target answers `200 OK`. Anything else leaves the message to
//! reappear after its visibility timeout. A [`ConcurrencyGate`] bounds the
//! number of deliveries in flight.
//!
//! ## Module Organization
//!
//! - [`config`] - Relay configuration and validation
//! - [`gate`] - Concurrency gate for open deliveries
//! - [`delivery`] - HTTP delivery and header mapping
//! - [`dispatcher`] - The receive and dispatch loop
//! - [`daemon`] - Startup and graceful shutdown

pub mod config;
pub mod daemon;
pub mod delivery;
pub mod dispatcher;
pub mod gate;

pub use config::{ConfigError, RelayConfig};
pub use daemon::{RelayDaemon, RelayError, RelayHandle};
pub use delivery::{
    build_headers, DeliveryError, HttpDeliveryConfig, HttpDeliveryExecutor, MessageDelivery,
};
pub use dispatcher::{process_message, DeliveryOutcome, Dispatcher, DispatcherSettings};
pub use gate::{ConcurrencyGate, GatePermit};
