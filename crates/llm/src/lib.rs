//! LLM mediation: the subprocess chat client, model selection, one-shot
//! calls, and the bounded tool loop; all with cost capture.

mod client;
mod error;
mod mediator;
mod policy;
mod tools;

pub use client::{ChatClient, ChatReply, ChatRequest, SubprocessClient};
pub use error::LlmError;
pub use mediator::{ChatOutcome, Mediator};
pub use policy::ModelPolicy;
pub use tools::{Tool, ToolOutput, ToolRegistry, ToolSpec, parse_tool_calls};
