pub mod http;
pub mod kernel;
pub mod memory;
