//! Claudish：把 Claude Code 的 Anthropic Messages 请求转发到 OpenRouter 上的任意模型
//!
//! ```text
//! Claude Code ──> server ──> translator ──> middleware ──> upstream (OpenRouter)
//!                   ▲                                          │
//!                   └──── stream / translator::response <──────┘
//! ```

pub mod adapters;
pub mod config;
pub mod error;
pub mod logger;
pub mod middleware;
pub mod models;
pub mod server;
pub mod stream;
pub mod telemetry;
pub mod translator;
pub mod upstream;

pub use config::Config;
pub use error::ProxyError;
pub use server::{build_router, start_server, AppState};
