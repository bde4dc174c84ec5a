pub mod editor;
pub mod inbox;
pub mod publisher;
pub mod source;
pub mod worker_pool;
