/// Shared types, engine protocol, and database layer for you-get-web.
pub mod db;
pub mod engine;
pub mod errors;
pub mod models;
pub mod task_queue;
