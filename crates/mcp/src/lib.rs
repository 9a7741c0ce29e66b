//! `tg-mcp` — tool-protocol plumbing for ToolGate.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types for the line-delimited tool protocol.
//! - A stdio proxy that owns one backend process's streams and correlates
//!   requests with responses under per-call deadlines.
//! - A registry that supervises backend processes: spawn, handshake, tool
//!   discovery, health, restart, and shutdown.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tg_mcp::ServerRegistry;
//!
//! let registry = ServerRegistry::new(config.servers.clone());
//! registry.start_all().await;
//!
//! if let Some(server_id) = registry.find_server_for_tool("read_file") {
//!     let proxy = registry.proxy(&server_id)?;
//!     let result = proxy.call_tool("read_file", json!({"path": "/tmp/x"}), None).await?;
//! }
//! ```

pub mod protocol;
pub mod proxy;
pub mod registry;

// Re-exports for convenience.
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, ToolDef};
pub use proxy::{ProxyError, ToolProxy};
pub use registry::{ServerRegistry, ServerStatus, ServerStatusReport};
