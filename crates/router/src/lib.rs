pub mod config;
pub mod http;

mod adapters;
mod compile;
mod dispatch;
mod metrics;
mod validate;
