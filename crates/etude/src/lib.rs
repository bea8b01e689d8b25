// src/lib.rs
pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod fs;
pub mod http;
pub mod logging;
pub mod parser;
pub mod pool;
pub mod response;
pub mod server;
pub mod state;
pub mod sync;
pub mod syscalls;
pub mod table;

// Re-exports for users
pub use config::Config;
pub use conn::{ConnState, Connection, Processed, WriteStatus};
pub use error::{EtudeError, EtudeResult};
pub use logging::{init_logging, init_logging_with_level};
pub use parser::HttpCode;
pub use server::{BoundServer, Server};
pub use state::ServerState;
