pub mod broker;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod metrics_consts;
pub mod pg;
pub mod producer;
pub mod signals;
pub mod supervisor;
pub mod worker;
