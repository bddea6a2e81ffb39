pub mod aggregator;
pub mod commands;
pub mod schedules;
pub mod session;
pub mod webhooks;
