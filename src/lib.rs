// src/lib.rs

// Import the top-level `chitragupta` module.
pub mod chitragupta;

// Re-exporting key items for easier external access.
pub use chitragupta::agent::{Agent, AgentState, TreeContext};
pub use chitragupta::config::ChitraguptaConfig;
pub use chitragupta::provider::{
    CancellationToken, ChatRequest, ContentPart, Provider, ProviderRegistry, Role, StreamEvent,
    Turn,
};
pub use chitragupta::samiti::Samiti;
