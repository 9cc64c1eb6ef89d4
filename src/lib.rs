//! Journeyman - a story-driven workflow engine for an LLM coding agent
//!
//! One `CoderAgent` instance drives a single story through a fixed
//! workflow: receive the story, prepare a sandboxed workspace, plan under
//! architect review, code against an approved todo list, test, pass code
//! review, and merge. The architect (a peer agent, external to this crate)
//! answers questions, grants iteration-budget extensions, and approves
//! plans, code, and merges through correlated request/reply effects.
//!
//! The embedding application supplies the LLM client, the concrete
//! development tools, and the workspace/sandbox/build collaborators; this
//! crate owns the state machine, the budgeted tool-calling loop, the
//! effect runtime, the conversation context, and persistence/resume.

pub mod agent;
pub mod config;
pub mod context;
pub mod effects;
pub mod llm;
pub mod message;
pub mod persist;
pub mod telemetry;
pub mod toolloop;
pub mod tools;
pub mod workflow;

pub use agent::{AgentChannels, AgentError, CoderAgent, Collaborators};
pub use config::AgentConfig;
pub use workflow::CoderState;
