//! Restore a crashed or suspended agent from its persisted records
//!
//! Restoring installs the persisted state without transition validation,
//! reloads the state data and conversation context, and leaves pending
//! effects in place: the owning handler re-sends the persisted request on
//! its next entry, so a crash between request and reply is survivable.

use super::{AgentChannels, AgentError, CoderAgent, Collaborators, CONTEXT_TYPE};
use crate::config::AgentConfig;
use crate::context::ContextManager;
use crate::tools::ToolRegistry;
use tokio_util::sync::CancellationToken;

impl CoderAgent {
    /// Rebuild an agent from the store. Returns `None` when no record
    /// exists for `(session_id, agent_id)`; the caller starts fresh.
    pub async fn resume(
        config: AgentConfig,
        collaborators: Collaborators,
        channels: AgentChannels,
        planning_tools: ToolRegistry,
        coding_tools: ToolRegistry,
        cancel: CancellationToken,
    ) -> Result<Option<CoderAgent>, AgentError> {
        let record = collaborators
            .persist
            .load_coder(&config.session_id, &config.agent_id)
            .await?;
        let Some(record) = record else {
            return Ok(None);
        };

        let context_record = collaborators
            .persist
            .load_context(&config.session_id, &config.agent_id, CONTEXT_TYPE)
            .await?;

        let mut agent = CoderAgent::new(
            config,
            collaborators,
            channels,
            planning_tools,
            coding_tools,
            cancel,
        );
        agent.force_state(record.state);
        agent.data = record.data;
        if let Some(context_record) = context_record {
            agent.context = ContextManager::deserialize(&context_record.payload)?;
        }

        tracing::info!(
            agent_id = %agent.config.agent_id,
            state = %agent.state,
            story_id = %agent.story_id(),
            pending_effects = agent.data.pending_effect_count(),
            "agent restored from persisted state"
        );
        Ok(Some(agent))
    }
}
