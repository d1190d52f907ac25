//! Job worker runtime: typed task handlers driven through a fixed lifecycle,
//! with cache-aside fan-out aggregation and bounded retries on outbound calls.

pub mod adapter;
pub mod aggregation;
pub mod cli;
pub mod config;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod http;
pub mod logging;
pub mod retry;
pub mod state_machine;
pub mod stores;
pub mod worker;
