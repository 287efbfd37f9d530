// Counter storage and rate limiting for the VeriCorp MCP server

pub mod kv;
pub mod rate_limit;

pub use kv::KvStore;
pub use rate_limit::RateLimiter;
