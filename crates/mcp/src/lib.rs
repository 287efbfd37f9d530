// MCP (Model Context Protocol) surface for the VeriCorp verification tools

pub mod protocol;
pub mod server;
pub mod tools;

pub use server::McpServer;
