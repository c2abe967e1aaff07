pub mod acquire;
pub mod buffer;
pub mod campaign;
pub mod config;
pub mod database;
pub mod dispatch;
pub mod hosts;
pub mod job;
pub mod process;
pub mod producer;
pub mod progress;
pub mod queue;
pub mod report;
pub mod sampling;
pub mod sweep;
pub mod transport;
pub mod worker;
