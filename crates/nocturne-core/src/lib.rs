// src/lib.rs
#[cfg(not(target_os = "linux"))]
compile_error!("nocturne-core drives epoll directly and only builds on Linux");

pub mod auth;
pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod response;
pub mod server;
pub mod slab;
pub mod syscalls;
pub mod timer;

// Re-exports for users
pub use auth::{Authenticator, RejectAll};
pub use buffer::ByteBuffer;
pub use config::{LogConfig, ServerConfig, TriggerMode};
pub use error::{NocturneError, NocturneResult};
pub use http::{Method, Status};
pub use logging::{LogGuard, init_logging};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use parser::{HttpRequest, ParseError};
pub use server::{Server, ShutdownHandle};
