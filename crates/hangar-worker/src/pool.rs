//! In-memory worker pool.

use async_trait::async_trait;
use dashmap::DashMap;
use hangar_core::worker::{
    ContainerKind, ContainerOwner, ContainerSpec, FetchOutcome, PlacementStrategy, ProcessIo,
    ProcessSpec, PutOutcome, ResourceRequest, TaskOutcome, WorkerClient, WorkerPool, WorkerSpec,
};
use hangar_core::{BuildId, Context, ExecError, Result, TeamName};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};
use uuid::Uuid;

/// What a worker advertises when it registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    pub platform: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Base resource types the worker ships images for.
    #[serde(default)]
    pub resource_types: Vec<String>,
    /// Team the worker is dedicated to; `None` serves every team.
    #[serde(default)]
    pub team: Option<TeamName>,
}

impl WorkerInfo {
    pub fn new(name: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platform: platform.into(),
            tags: Vec::new(),
            resource_types: Vec::new(),
            team: None,
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_resource_types(mut self, types: &[&str]) -> Self {
        self.resource_types = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(TeamName::new(team));
        self
    }

    /// Whether this worker may run a container with these constraints.
    ///
    /// Tagged workers only take tagged work: a spec without tags never lands
    /// on a tagged worker.
    pub fn satisfies(&self, spec: &WorkerSpec) -> bool {
        if let Some(platform) = &spec.platform {
            if &self.platform != platform {
                return false;
            }
        }

        if spec.tags.is_empty() {
            if !self.tags.is_empty() {
                return false;
            }
        } else if !spec.tags.iter().all(|tag| self.tags.contains(tag)) {
            return false;
        }

        if let Some(resource_type) = &spec.resource_type {
            if !self.resource_types.contains(resource_type) {
                return false;
            }
        }

        match (&self.team, &spec.team) {
            (None, _) => true,
            (Some(own), Some(wanted)) => own == wanted,
            (Some(_), None) => false,
        }
    }
}

struct Entry {
    info: WorkerInfo,
    client: Arc<dyn WorkerClient>,
    active_containers: AtomicUsize,
    active_tasks: AtomicUsize,
}

/// A registry of workers that places containers by strategy.
///
/// Placement decisions are serialized, and each placement reserves its load
/// on the chosen worker before the next decision is made. The reservation is
/// held by the returned client until it is dropped. A container owner that
/// was placed before is sent back to the same worker while that worker stays
/// registered and eligible.
pub struct InMemoryPool {
    workers: DashMap<String, Arc<Entry>>,
    owners: DashMap<ContainerOwner, String>,
    placement: Mutex<()>,
}

impl Default for InMemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPool {
    pub fn new() -> Self {
        Self {
            workers: DashMap::new(),
            owners: DashMap::new(),
            placement: Mutex::new(()),
        }
    }

    /// Register (or re-register) a worker.
    pub fn register(&self, info: WorkerInfo, client: Arc<dyn WorkerClient>) {
        info!(
            worker = %info.name,
            platform = %info.platform,
            tags = ?info.tags,
            "Registering worker"
        );
        let entry = Arc::new(Entry {
            info,
            client,
            active_containers: AtomicUsize::new(0),
            active_tasks: AtomicUsize::new(0),
        });
        self.workers.insert(entry.info.name.clone(), entry);
    }

    /// Remove a worker. Containers already running on it are unaffected.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.workers.remove(name).is_some();
        if removed {
            info!(worker = %name, "Unregistered worker");
            self.owners.retain(|_, worker| worker != name);
        }
        removed
    }

    /// Names of registered workers, sorted.
    pub fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Containers currently running on `name`.
    pub fn active_containers(&self, name: &str) -> Option<usize> {
        self.workers
            .get(name)
            .map(|e| e.active_containers.load(Ordering::SeqCst))
    }

    /// Tasks currently running on `name`.
    pub fn active_tasks(&self, name: &str) -> Option<usize> {
        self.workers
            .get(name)
            .map(|e| e.active_tasks.load(Ordering::SeqCst))
    }

    fn eligible(&self, spec: &WorkerSpec) -> Vec<Arc<Entry>> {
        let mut candidates: Vec<Arc<Entry>> = self
            .workers
            .iter()
            .filter(|e| e.info.satisfies(spec))
            .map(|e| e.value().clone())
            .collect();
        candidates.sort_by(|a, b| a.info.name.cmp(&b.info.name));
        candidates
    }

    fn previous_placement(&self, owner: &ContainerOwner, spec: &WorkerSpec) -> Option<Arc<Entry>> {
        let name = self.owners.get(owner)?.value().clone();
        let entry = self.workers.get(&name)?.value().clone();
        entry.info.satisfies(spec).then_some(entry)
    }
}

/// Pick one of `candidates`; empty input or a saturated pool yields `None`.
fn choose(
    strategy: PlacementStrategy,
    candidates: Vec<Arc<Entry>>,
    container_spec: &ContainerSpec,
) -> Option<Arc<Entry>> {
    match strategy {
        PlacementStrategy::VolumeLocality => {
            let local_inputs = |entry: &Arc<Entry>| {
                let name = entry.info.name.as_str();
                container_spec
                    .inputs
                    .iter()
                    .filter(|input| input.artifact.worker.as_deref() == Some(name))
                    .count()
            };
            let best = candidates.iter().map(|e| local_inputs(e)).max()?;
            let best: Vec<Arc<Entry>> = candidates
                .into_iter()
                .filter(|e| local_inputs(e) == best)
                .collect();
            pick_random(best)
        }
        PlacementStrategy::FewestBuildContainers => {
            let load = |entry: &Arc<Entry>| entry.active_containers.load(Ordering::SeqCst);
            let fewest = candidates.iter().map(|e| load(e)).min()?;
            let best: Vec<Arc<Entry>> = candidates
                .into_iter()
                .filter(|e| load(e) == fewest)
                .collect();
            pick_random(best)
        }
        PlacementStrategy::LimitActiveTasks { max } => candidates
            .into_iter()
            .map(|e| (e.active_tasks.load(Ordering::SeqCst), e))
            .filter(|(tasks, _)| *tasks < max)
            .min_by_key(|(tasks, _)| *tasks)
            .map(|(_, e)| e),
        PlacementStrategy::Random => pick_random(candidates),
    }
}

fn pick_random(mut candidates: Vec<Arc<Entry>>) -> Option<Arc<Entry>> {
    if candidates.is_empty() {
        return None;
    }
    let index = (Uuid::new_v4().as_u128() % candidates.len() as u128) as usize;
    Some(candidates.swap_remove(index))
}

#[async_trait]
impl WorkerPool for InMemoryPool {
    async fn select_worker(
        &self,
        owner: &ContainerOwner,
        container_spec: &ContainerSpec,
        worker_spec: &WorkerSpec,
        strategy: PlacementStrategy,
        create_timeout: Duration,
    ) -> Result<Option<Arc<dyn WorkerClient>>> {
        let _placement = timeout(create_timeout, self.placement.lock())
            .await
            .map_err(|_| {
                ExecError::WorkerSelection(format!(
                    "timed out after {:?} waiting for another placement",
                    create_timeout
                ))
            })?;

        if let Some(entry) = self.previous_placement(owner, worker_spec) {
            debug!(
                plan_id = %owner.plan_id,
                worker = %entry.info.name,
                "Reusing previous placement"
            );
            return Ok(Some(Arc::new(TrackedWorker::reserve(entry, container_spec.kind))));
        }

        let candidates = self.eligible(worker_spec);
        let Some(entry) = choose(strategy, candidates, container_spec) else {
            debug!(plan_id = %owner.plan_id, %strategy, "No eligible worker");
            return Ok(None);
        };

        debug!(plan_id = %owner.plan_id, worker = %entry.info.name, %strategy, "Placed container");
        self.owners.insert(owner.clone(), entry.info.name.clone());
        Ok(Some(Arc::new(TrackedWorker::reserve(entry, container_spec.kind))))
    }

    fn release_build(&self, build_id: &BuildId) {
        self.owners.retain(|owner, _| &owner.build_id != build_id);
    }
}

/// The client handed out by the pool. It counts as load on its worker, which
/// placement strategies read, from selection until it is dropped.
struct TrackedWorker {
    entry: Arc<Entry>,
    task: bool,
}

impl TrackedWorker {
    fn reserve(entry: Arc<Entry>, kind: ContainerKind) -> Self {
        let task = kind == ContainerKind::Task;
        entry.active_containers.fetch_add(1, Ordering::SeqCst);
        if task {
            entry.active_tasks.fetch_add(1, Ordering::SeqCst);
        }
        Self { entry, task }
    }
}

impl Drop for TrackedWorker {
    fn drop(&mut self) {
        self.entry.active_containers.fetch_sub(1, Ordering::SeqCst);
        if self.task {
            self.entry.active_tasks.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl WorkerClient for TrackedWorker {
    fn name(&self) -> &str {
        &self.entry.info.name
    }

    async fn run_task(
        &self,
        ctx: &Context,
        owner: &ContainerOwner,
        spec: &ContainerSpec,
        process: &ProcessSpec,
        io: ProcessIo,
    ) -> Result<TaskOutcome> {
        self.entry.client.run_task(ctx, owner, spec, process, io).await
    }

    async fn fetch(
        &self,
        ctx: &Context,
        owner: &ContainerOwner,
        spec: &ContainerSpec,
        request: &ResourceRequest,
        io: ProcessIo,
    ) -> Result<FetchOutcome> {
        self.entry.client.fetch(ctx, owner, spec, request, io).await
    }

    async fn put(
        &self,
        ctx: &Context,
        owner: &ContainerOwner,
        spec: &ContainerSpec,
        request: &ResourceRequest,
        io: ProcessIo,
    ) -> Result<PutOutcome> {
        self.entry.client.put(ctx, owner, spec, request, io).await
    }
}
