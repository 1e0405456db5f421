pub mod builder;
pub mod credentials;
pub mod history;
pub mod metrics;
pub mod orchestrator;
pub mod output;
pub mod provider;
pub mod scheduler;
pub mod session;
