pub mod arena;
pub mod connection;
pub mod scratch;
pub mod server;
pub mod server_internals;
pub mod thread_context;
pub mod uring;
pub mod utils;
