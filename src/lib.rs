pub mod automation;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod events;
pub mod history;
pub mod messaging;
pub mod models;
pub mod report;
pub mod runtime;
pub mod shrink;
pub mod worker_processing;
