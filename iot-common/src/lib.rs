pub mod broker;
pub mod config;
pub mod dedup;
pub mod health;
pub mod lifecycle;
pub mod metrics;
pub mod normalizer;
pub mod record;
pub mod retry;
pub mod sink;
pub mod validation;
