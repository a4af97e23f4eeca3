//! 上游聚合 API 客户端

mod client;

pub use client::UpstreamClient;
