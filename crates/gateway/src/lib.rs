pub mod agent;
pub mod config;
pub mod guardrail;
pub mod http;
pub mod metrics;
pub mod opa;
pub mod pipeline;
pub mod rate_limit;
pub mod sandbox;
pub mod sanitize;
