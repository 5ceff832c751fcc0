//! Per-build state shared by the steps of one execution.

use dashmap::DashMap;
use hangar_core::worker::{ExitStatus, VersionResult, WorkerPool};
use hangar_core::{ArtifactHandle, PlanId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a finished step left behind for later steps and the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepOutput {
    /// A task ran to completion.
    Exit(ExitStatus),
    /// A get fetched a version.
    Fetched(VersionResult),
    /// A put produced a version.
    Put(VersionResult),
    PipelineSet { changed: bool },
    /// An artifact was exposed as a build output.
    Artifact(ArtifactHandle),
}

/// Artifacts, step results and local vars of a build.
///
/// Cloning a `RunState` yields another handle to the same scope. A scope made
/// with [`RunState::new_local_scope`] reads through to its parent chain but
/// keeps its own writes: nothing stored in a child is ever visible to the
/// parent or to sibling scopes.
///
/// All operations are safe to call from concurrently running branches. Two
/// branches writing the same name race; the state stays consistent but which
/// write wins is unspecified.
#[derive(Clone)]
pub struct RunState {
    scope: Arc<Scope>,
}

struct Scope {
    parent: Option<Arc<Scope>>,
    artifacts: DashMap<String, ArtifactHandle>,
    results: DashMap<PlanId, StepOutput>,
    vars: DashMap<String, Value>,
    pool: Arc<dyn WorkerPool>,
}

impl Scope {
    fn root(pool: Arc<dyn WorkerPool>) -> Self {
        Self {
            parent: None,
            artifacts: DashMap::new(),
            results: DashMap::new(),
            vars: DashMap::new(),
            pool,
        }
    }

    /// Walk this scope and its ancestors, nearest first.
    fn chain(&self) -> impl Iterator<Item = &Scope> {
        std::iter::successors(Some(self), |scope| scope.parent.as_deref())
    }
}

impl RunState {
    pub fn new(pool: Arc<dyn WorkerPool>) -> Self {
        Self {
            scope: Arc::new(Scope::root(pool)),
        }
    }

    /// The worker pool shared by every scope of this build.
    pub fn pool(&self) -> Arc<dyn WorkerPool> {
        self.scope.pool.clone()
    }

    /// A child scope that shares the pool and reads through to this scope.
    pub fn new_local_scope(&self) -> RunState {
        Self {
            scope: Arc::new(Scope {
                parent: Some(self.scope.clone()),
                ..Scope::root(self.scope.pool.clone())
            }),
        }
    }

    pub fn store_artifact(&self, name: impl Into<String>, artifact: ArtifactHandle) {
        self.scope.artifacts.insert(name.into(), artifact);
    }

    pub fn artifact(&self, name: &str) -> Option<ArtifactHandle> {
        self.scope
            .chain()
            .find_map(|scope| scope.artifacts.get(name).map(|entry| entry.value().clone()))
    }

    /// Every artifact visible from this scope; nearer scopes shadow outer ones.
    pub fn artifacts(&self) -> BTreeMap<String, ArtifactHandle> {
        let scopes: Vec<&Scope> = self.scope.chain().collect();
        let mut visible = BTreeMap::new();
        for scope in scopes.into_iter().rev() {
            for entry in scope.artifacts.iter() {
                visible.insert(entry.key().clone(), entry.value().clone());
            }
        }
        visible
    }

    pub fn store_result(&self, plan_id: PlanId, output: StepOutput) {
        self.scope.results.insert(plan_id, output);
    }

    pub fn result(&self, plan_id: &PlanId) -> Option<StepOutput> {
        self.scope
            .chain()
            .find_map(|scope| scope.results.get(plan_id).map(|entry| entry.value().clone()))
    }

    pub fn add_local_var(&self, name: impl Into<String>, value: Value) {
        self.scope.vars.insert(name.into(), value);
    }

    pub fn local_var(&self, name: &str) -> Option<Value> {
        self.scope
            .chain()
            .find_map(|scope| scope.vars.get(name).map(|entry| entry.value().clone()))
    }
}

impl std::fmt::Debug for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunState")
            .field("artifacts", &self.artifacts())
            .field("depth", &self.scope.chain().count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePool;
    use serde_json::json;

    fn state() -> RunState {
        RunState::new(Arc::new(FakePool::default()))
    }

    #[test]
    fn test_store_and_read_artifact() {
        let state = state();
        assert!(state.artifact("repo").is_none());

        state.store_artifact("repo", ArtifactHandle::detached("v1"));
        state.store_artifact("repo", ArtifactHandle::detached("v2"));
        assert_eq!(state.artifact("repo").unwrap().handle, "v2");
    }

    #[test]
    fn test_local_scope_reads_through_to_parent() {
        let parent = state();
        parent.store_artifact("repo", ArtifactHandle::detached("parent"));

        let child = parent.new_local_scope();
        assert_eq!(child.artifact("repo").unwrap().handle, "parent");

        // parent writes after the fork are visible too
        parent.store_artifact("late", ArtifactHandle::detached("late"));
        assert!(child.artifact("late").is_some());
    }

    #[test]
    fn test_local_scope_writes_are_isolated() {
        let parent = state();
        parent.store_artifact("repo", ArtifactHandle::detached("parent"));

        let child = parent.new_local_scope();
        let sibling = parent.new_local_scope();
        child.store_artifact("repo", ArtifactHandle::detached("child"));
        child.store_artifact("built", ArtifactHandle::detached("binary"));
        child.store_result(PlanId::from("1"), StepOutput::Exit(ExitStatus(0)));
        drop(child);

        assert_eq!(parent.artifact("repo").unwrap().handle, "parent");
        assert!(parent.artifact("built").is_none());
        assert!(parent.result(&PlanId::from("1")).is_none());
        assert!(sibling.artifact("built").is_none());
    }

    #[test]
    fn test_artifacts_merges_chain_with_shadowing() {
        let parent = state();
        parent.store_artifact("a", ArtifactHandle::detached("a-parent"));
        parent.store_artifact("b", ArtifactHandle::detached("b-parent"));
        let child = parent.new_local_scope();
        child.store_artifact("b", ArtifactHandle::detached("b-child"));

        let visible = child.artifacts();
        assert_eq!(visible.len(), 2);
        assert_eq!(visible["a"].handle, "a-parent");
        assert_eq!(visible["b"].handle, "b-child");
    }

    #[test]
    fn test_results_and_vars_are_scoped() {
        let parent = state();
        parent.store_result(PlanId::from("get"), StepOutput::PipelineSet { changed: true });
        parent.add_local_var("env", json!("staging"));

        let child = parent.new_local_scope();
        child.add_local_var("env", json!("prod"));
        assert_eq!(child.local_var("env"), Some(json!("prod")));
        assert_eq!(parent.local_var("env"), Some(json!("staging")));
        assert_eq!(
            child.result(&PlanId::from("get")),
            Some(StepOutput::PipelineSet { changed: true })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_do_not_corrupt_state() {
        let state = state();
        let mut handles = Vec::new();
        for writer in 0..8 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..100 {
                    state.store_artifact(
                        format!("own-{}-{}", writer, i),
                        ArtifactHandle::detached("x"),
                    );
                    state.store_artifact(
                        "shared",
                        ArtifactHandle::detached(format!("w{}", writer)),
                    );
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(state.artifacts().len(), 8 * 100 + 1);
        assert!(state.artifact("shared").unwrap().handle.starts_with('w'));
    }
}
