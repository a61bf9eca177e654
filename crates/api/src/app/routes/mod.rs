pub mod queues;
pub mod system;
