pub mod agent;
pub mod board;
pub mod bus;
pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod processor;
pub mod projections;
