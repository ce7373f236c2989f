//! Insight Core Library
//!
//! Conversational agent for industrial projects: an LLM tool-use loop over a
//! durable conversation store, plus a cron scheduler that replays prompts
//! through the same loop.

pub mod agent;
pub mod api;
pub mod builtin_tools;
pub mod chat;
pub mod compaction;
pub mod config;
pub mod cron;
pub mod llm;
pub mod models;
pub mod scheduler;
pub mod scheduler_tools;
pub mod schema;
pub mod storage;
pub mod tools;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use agent::{AgentConfig, Orchestrator};
pub use chat::ChatService;
pub use config::Config;
pub use scheduler::{SchedulerHandle, TaskScheduler};
pub use tools::{Tool, ToolRegistry};
