pub mod manager;
pub mod worker;

pub use manager::JobManager;
pub use worker::Worker;
