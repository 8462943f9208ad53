pub mod proxy;
pub mod workflow;
