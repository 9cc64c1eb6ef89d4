//! Trait abstractions over the agent's collaborators
//!
//! Workspace cloning, the sandboxed execution environment, and the build
//! backend live with the embedding application; the workflow only sees
//! these seams, which also makes the handlers testable with mocks.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Outcome of a test run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    pub passed: bool,
    pub output: String,
}

impl TestReport {
    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            passed: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
        }
    }
}

/// Prepares a per-story checkout
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Clone the repository and create a story branch under `work_dir`;
    /// returns the checkout path.
    async fn prepare(&self, story_id: &str, work_dir: &Path) -> Result<PathBuf, String>;
}

/// Access level of the execution environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    ReadOnly,
    ReadWrite,
}

/// The per-story sandboxed execution environment
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Start an environment over the workspace; returns the container name
    async fn start(&self, workspace: &Path, mode: SandboxMode) -> Result<String, String>;

    /// Destroy-and-recreate with a new mode; must succeed before the
    /// read-write consumer runs. Returns the (possibly new) container name.
    async fn reconfigure(
        &self,
        container: &str,
        workspace: &Path,
        mode: SandboxMode,
    ) -> Result<String, String>;

    /// Infrastructure self-check used for devops stories and stories that
    /// changed the container configuration
    async fn run_infra_check(&self, container: &str) -> Result<TestReport, String>;

    /// Promote the story's container configuration after merge; returns
    /// the promoted image id
    async fn promote_config(&self, container: &str) -> Result<String, String>;

    async fn stop(&self, container: &str) -> Result<(), String>;
}

/// Runs the project's test suite
#[async_trait]
pub trait BuildBackend: Send + Sync {
    async fn run_tests(&self, workspace: &Path) -> Result<TestReport, String>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: Workspace + ?Sized> Workspace for Arc<T> {
    async fn prepare(&self, story_id: &str, work_dir: &Path) -> Result<PathBuf, String> {
        (**self).prepare(story_id, work_dir).await
    }
}

#[async_trait]
impl<T: Sandbox + ?Sized> Sandbox for Arc<T> {
    async fn start(&self, workspace: &Path, mode: SandboxMode) -> Result<String, String> {
        (**self).start(workspace, mode).await
    }

    async fn reconfigure(
        &self,
        container: &str,
        workspace: &Path,
        mode: SandboxMode,
    ) -> Result<String, String> {
        (**self).reconfigure(container, workspace, mode).await
    }

    async fn run_infra_check(&self, container: &str) -> Result<TestReport, String> {
        (**self).run_infra_check(container).await
    }

    async fn promote_config(&self, container: &str) -> Result<String, String> {
        (**self).promote_config(container).await
    }

    async fn stop(&self, container: &str) -> Result<(), String> {
        (**self).stop(container).await
    }
}

#[async_trait]
impl<T: BuildBackend + ?Sized> BuildBackend for Arc<T> {
    async fn run_tests(&self, workspace: &Path) -> Result<TestReport, String> {
        (**self).run_tests(workspace).await
    }
}
