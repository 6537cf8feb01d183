pub mod channel;
pub mod concurrency;
pub mod config;
pub mod executor;
pub mod jobs;
pub mod lifecycle;
pub mod orchestrator;
pub mod output;
pub mod schedule;
pub mod scheduler;
pub mod session;
pub mod stream;
pub mod terminal;
