#![allow(clippy::result_large_err)]

pub mod app;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod producer;
pub mod queue;
pub mod ratelimit;
pub mod retry;
pub mod runtime;
pub mod telemetry;
pub mod topology;

pub mod transport;

pub use error::{Error, Result};
