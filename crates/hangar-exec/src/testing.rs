//! Recording fakes for delegates, workers, pools and pipeline storage.
//!
//! Workers are scripted per key: a task's key is its run path, a get or put's
//! key is the resource name. Scripts queue up; the last one repeats.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use hangar_core::pipeline::{PipelineSaver, SetPipelineRequest};
use hangar_core::plan::{
    ArtifactInputPlan, ArtifactOutputPlan, GetPlan, ImageResource, PutInputs, PutPlan,
    SetPipelinePlan, TaskConfig, TaskPlan, TaskRunConfig, Version, VersionedResourceType,
};
use hangar_core::worker::{
    ContainerKind, ContainerOwner, ContainerSpec, ExitStatus, FetchOutcome, ImageSource,
    ImageSpec, LogSink, MetadataField, ProcessIo, ProcessSpec, PutOutcome, ResourceRequest,
    TaskOutcome, VersionResult, WorkerClient, WorkerPool, WorkerSpec,
};
use hangar_core::{
    ArtifactHandle, BuildId, BuildInfo, Context, ExecError, PlanId, Result, TeamName,
};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::pending;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::Span;

use crate::delegate::{
    BuildStepDelegate, DelegateFactory, GetDelegate, PutDelegate, SetPipelineDelegate,
    TaskDelegate,
};
use crate::run_state::RunState;
use crate::select::SelectionSettings;
use crate::step::{
    AcrossStep, AggregateStep, ArtifactInputStep, ArtifactOutputStep, DoStep, EnsureStep,
    GetStep, InParallelStep, OnAbortStep, OnErrorStep, OnFailureStep, OnSuccessStep, PutStep,
    RetryStep, SetPipelineStep, Step, StepFactory, TaskStep, TimeoutStep, TryStep,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A log sink that keeps everything written to it.
#[derive(Default)]
pub struct CapturedLog {
    buf: Mutex<Vec<u8>>,
}

impl CapturedLog {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.buf)).into_owned()
    }
}

impl LogSink for CapturedLog {
    fn write(&self, chunk: Bytes) {
        lock(&self.buf).extend_from_slice(&chunk);
    }
}

/// What a fake worker does for one run.
#[derive(Debug, Clone)]
pub enum Script {
    Exit(i32),
    Error(String),
    /// Sleep, then exit with the code.
    Sleep(Duration, i32),
    /// Never finish; only cancellation ends the run.
    Hang,
}

/// One run a fake worker performed.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub key: String,
    pub spec: ContainerSpec,
    pub version: Option<Version>,
    pub started: Instant,
    pub ended: Option<Instant>,
}

/// A scripted worker that records every run.
pub struct FakeWorker {
    name: String,
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    runs: Mutex<Vec<RunRecord>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

struct ActiveGuard<'a> {
    active: &'a AtomicUsize,
}

impl<'a> ActiveGuard<'a> {
    fn enter(active: &'a AtomicUsize, max_active: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        max_active.fetch_max(now, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: Mutex::new(HashMap::new()),
            runs: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Queue a script for `key`. Unscripted keys exit 0.
    pub fn script(&self, key: &str, script: Script) {
        lock(&self.scripts)
            .entry(key.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn script_exit(&self, key: &str, code: i32) {
        self.script(key, Script::Exit(code));
    }

    pub fn script_error(&self, key: &str, message: &str) {
        self.script(key, Script::Error(message.to_string()));
    }

    pub fn script_sleep(&self, key: &str, duration: Duration, code: i32) {
        self.script(key, Script::Sleep(duration, code));
    }

    pub fn script_hang(&self, key: &str) {
        self.script(key, Script::Hang);
    }

    fn next_script(&self, key: &str) -> Script {
        let mut scripts = lock(&self.scripts);
        match scripts.get_mut(key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Script::Exit(0)),
            Some(queue) => queue.front().cloned().unwrap_or(Script::Exit(0)),
            None => Script::Exit(0),
        }
    }

    /// Keys of every run, in start order.
    pub fn started(&self) -> Vec<String> {
        lock(&self.runs).iter().map(|run| run.key.clone()).collect()
    }

    pub fn run_count(&self) -> usize {
        lock(&self.runs).len()
    }

    /// Runs that returned, successfully or not. Cancelled runs never return.
    pub fn finished(&self) -> usize {
        lock(&self.runs).iter().filter(|run| run.ended.is_some()).count()
    }

    /// `(key, start, end)` of every run that returned.
    pub fn windows(&self) -> Vec<(String, Instant, Instant)> {
        lock(&self.runs)
            .iter()
            .filter_map(|run| run.ended.map(|ended| (run.key.clone(), run.started, ended)))
            .collect()
    }

    /// Highest number of runs ever in progress at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Container spec of the latest run of `key`.
    pub fn spec_of(&self, key: &str) -> Option<ContainerSpec> {
        lock(&self.runs)
            .iter()
            .rev()
            .find(|run| run.key == key)
            .map(|run| run.spec.clone())
    }

    pub fn env_of(&self, key: &str) -> BTreeMap<String, String> {
        self.spec_of(key).map(|spec| spec.env).unwrap_or_default()
    }

    /// Version requested by the latest get of `key`.
    pub fn requested_version(&self, key: &str) -> Option<Version> {
        lock(&self.runs)
            .iter()
            .rev()
            .find(|run| run.key == key)
            .and_then(|run| run.version.clone())
    }

    /// The version every successful put produces.
    pub fn put_version(&self) -> Version {
        Version::from([("ref".to_string(), "pushed".to_string())])
    }

    fn latest_version(&self) -> Version {
        Version::from([("ref".to_string(), "latest".to_string())])
    }

    fn metadata(&self) -> Vec<MetadataField> {
        vec![MetadataField {
            name: "worker".to_string(),
            value: self.name.clone(),
        }]
    }

    async fn perform(
        &self,
        key: &str,
        spec: &ContainerSpec,
        version: Option<Version>,
        io: &ProcessIo,
    ) -> Result<ExitStatus> {
        let index = {
            let mut runs = lock(&self.runs);
            runs.push(RunRecord {
                key: key.to_string(),
                spec: spec.clone(),
                version,
                started: Instant::now(),
                ended: None,
            });
            runs.len() - 1
        };
        let _active = ActiveGuard::enter(&self.active, &self.max_active);
        io.stdout.write(Bytes::from(format!("running {}\n", key)));

        let result = match self.next_script(key) {
            Script::Exit(code) => Ok(ExitStatus(code)),
            Script::Error(message) => Err(ExecError::Worker(message)),
            Script::Sleep(duration, code) => {
                sleep(duration).await;
                Ok(ExitStatus(code))
            }
            Script::Hang => pending().await,
        };

        if let Some(run) = lock(&self.runs).get_mut(index) {
            run.ended = Some(Instant::now());
        }
        result
    }
}

#[async_trait]
impl WorkerClient for FakeWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_task(
        &self,
        _ctx: &Context,
        _owner: &ContainerOwner,
        spec: &ContainerSpec,
        process: &ProcessSpec,
        io: ProcessIo,
    ) -> Result<TaskOutcome> {
        let exit_status = self.perform(&process.path, spec, None, &io).await?;
        let outputs = if exit_status.is_success() {
            spec.outputs
                .keys()
                .map(|name| (name.clone(), ArtifactHandle::generate(self.name.clone())))
                .collect()
        } else {
            BTreeMap::new()
        };
        Ok(TaskOutcome {
            exit_status,
            outputs,
        })
    }

    async fn fetch(
        &self,
        _ctx: &Context,
        _owner: &ContainerOwner,
        spec: &ContainerSpec,
        request: &ResourceRequest,
        io: ProcessIo,
    ) -> Result<FetchOutcome> {
        let exit_status = self
            .perform(&request.resource, spec, request.version.clone(), &io)
            .await?;
        if !exit_status.is_success() {
            return Ok(FetchOutcome {
                exit_status,
                result: None,
                artifact: None,
            });
        }
        Ok(FetchOutcome {
            exit_status,
            result: Some(VersionResult {
                version: request
                    .version
                    .clone()
                    .unwrap_or_else(|| self.latest_version()),
                metadata: self.metadata(),
            }),
            artifact: Some(ArtifactHandle::generate(self.name.clone())),
        })
    }

    async fn put(
        &self,
        _ctx: &Context,
        _owner: &ContainerOwner,
        spec: &ContainerSpec,
        request: &ResourceRequest,
        io: ProcessIo,
    ) -> Result<PutOutcome> {
        let exit_status = self.perform(&request.resource, spec, None, &io).await?;
        Ok(PutOutcome {
            exit_status,
            result: exit_status.is_success().then(|| VersionResult {
                version: self.put_version(),
                metadata: self.metadata(),
            }),
        })
    }
}

/// A pool that hands out its first worker and counts selections.
#[derive(Default)]
pub struct FakePool {
    workers: Vec<Arc<FakeWorker>>,
    selections: AtomicUsize,
    select_delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<WorkerSpec>>,
}

impl FakePool {
    pub fn with_worker(worker: impl Into<Arc<FakeWorker>>) -> Self {
        Self {
            workers: vec![worker.into()],
            ..Default::default()
        }
    }

    /// Number of `select_worker` calls so far.
    pub fn selections(&self) -> usize {
        self.selections.load(Ordering::SeqCst)
    }

    /// Make every selection take `delay`.
    pub fn set_select_delay(&self, delay: Duration) {
        *lock(&self.select_delay) = Some(delay);
    }

    pub fn last_request(&self) -> Option<WorkerSpec> {
        lock(&self.requests).last().cloned()
    }
}

#[async_trait]
impl WorkerPool for FakePool {
    async fn select_worker(
        &self,
        _owner: &ContainerOwner,
        _container_spec: &ContainerSpec,
        worker_spec: &WorkerSpec,
        _strategy: hangar_core::worker::PlacementStrategy,
        _create_timeout: Duration,
    ) -> Result<Option<Arc<dyn WorkerClient>>> {
        self.selections.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(worker_spec.clone());

        let delay = *lock(&self.select_delay);
        if let Some(delay) = delay {
            sleep(delay).await;
        }

        Ok(self
            .workers
            .first()
            .map(|worker| worker.clone() as Arc<dyn WorkerClient>))
    }
}

/// A delegate that records every callback as a short event string.
#[derive(Default)]
pub struct RecordingDelegate {
    events: Mutex<Vec<String>>,
    stdout: Arc<CapturedLog>,
    stderr: Arc<CapturedLog>,
    image_error: Mutex<Option<String>>,
}

impl RecordingDelegate {
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    pub fn stdout_contents(&self) -> String {
        self.stdout.contents()
    }

    pub fn stderr_contents(&self) -> String {
        self.stderr.contents()
    }

    /// Make image fetches fail with `message`.
    pub fn fail_image_fetch(&self, message: &str) {
        *lock(&self.image_error) = Some(message.to_string());
    }

    fn record(&self, event: impl Into<String>) {
        lock(&self.events).push(event.into());
    }
}

#[async_trait]
impl BuildStepDelegate for RecordingDelegate {
    fn initializing(&self) {
        self.record("initializing");
    }

    fn starting(&self) {
        self.record("starting");
    }

    fn finished(&self, status: ExitStatus, worker: Option<&str>) {
        self.record(format!("finished:{}:{}", status, worker.unwrap_or("-")));
    }

    fn errored(&self, message: &str) {
        self.record(format!("errored:{}", message));
    }

    fn selected_worker(&self, name: &str) {
        self.record(format!("selected_worker:{}", name));
    }

    fn stdout(&self) -> Arc<dyn LogSink> {
        self.stdout.clone()
    }

    fn stderr(&self) -> Arc<dyn LogSink> {
        self.stderr.clone()
    }

    fn start_span(&self, step: &'static str, name: &str) -> Span {
        tracing::info_span!("step", step, name)
    }

    async fn fetch_image(
        &self,
        _ctx: &Context,
        image: &ImageResource,
        _resource_types: &[VersionedResourceType],
        privileged: bool,
    ) -> Result<ImageSpec> {
        self.record(format!("fetch_image:{}", image.type_));
        let error = lock(&self.image_error).clone();
        match error {
            Some(message) => Err(ExecError::ImageFetch(message)),
            None => Ok(ImageSpec {
                source: ImageSource::Url(format!("fetched:{}", image.type_)),
                privileged,
            }),
        }
    }
}

impl TaskDelegate for RecordingDelegate {
    fn set_task_config(&self, _config: &TaskConfig) {
        self.record("task_config");
    }
}

impl GetDelegate for RecordingDelegate {
    fn update_version(&self, resource: &str, _result: &VersionResult) {
        self.record(format!("update_version:{}", resource));
    }
}

impl PutDelegate for RecordingDelegate {
    fn save_output(&self, resource: &str, _result: &VersionResult) {
        self.record(format!("save_output:{}", resource));
    }
}

impl SetPipelineDelegate for RecordingDelegate {
    fn set_pipeline_changed(&self, team: &TeamName, name: &str, changed: bool) {
        self.record(format!("pipeline_changed:{}/{}:{}", team, name, changed));
    }
}

/// Hands out one [`RecordingDelegate`] per plan id, shared by every kind.
#[derive(Default)]
pub struct RecordingDelegateFactory {
    delegates: DashMap<PlanId, Arc<RecordingDelegate>>,
}

impl RecordingDelegateFactory {
    pub fn delegate(&self, plan_id: &PlanId) -> Arc<RecordingDelegate> {
        self.delegates
            .entry(plan_id.clone())
            .or_default()
            .value()
            .clone()
    }
}

impl DelegateFactory for RecordingDelegateFactory {
    fn task_delegate(&self, _build: &BuildInfo, plan_id: &PlanId) -> Arc<dyn TaskDelegate> {
        self.delegate(plan_id)
    }

    fn get_delegate(&self, _build: &BuildInfo, plan_id: &PlanId) -> Arc<dyn GetDelegate> {
        self.delegate(plan_id)
    }

    fn put_delegate(&self, _build: &BuildInfo, plan_id: &PlanId) -> Arc<dyn PutDelegate> {
        self.delegate(plan_id)
    }

    fn set_pipeline_delegate(
        &self,
        _build: &BuildInfo,
        plan_id: &PlanId,
    ) -> Arc<dyn SetPipelineDelegate> {
        self.delegate(plan_id)
    }
}

/// Pipeline storage that remembers which pipelines it has seen.
#[derive(Default)]
pub struct FakePipelineSaver {
    requests: Mutex<Vec<SetPipelineRequest>>,
    saved: Mutex<HashSet<(TeamName, String)>>,
    failure: Mutex<Option<String>>,
}

impl FakePipelineSaver {
    pub fn requests(&self) -> Vec<SetPipelineRequest> {
        lock(&self.requests).clone()
    }

    pub fn fail_with(&self, message: &str) {
        *lock(&self.failure) = Some(message.to_string());
    }
}

#[async_trait]
impl PipelineSaver for FakePipelineSaver {
    async fn save(&self, _ctx: &Context, request: SetPipelineRequest) -> Result<bool> {
        if let Some(message) = lock(&self.failure).clone() {
            return Err(ExecError::PipelineSave(message));
        }
        let key = (request.team.clone(), request.name.clone());
        lock(&self.requests).push(request);
        Ok(lock(&self.saved).insert(key))
    }
}

/// A minimal container spec.
pub fn container_spec() -> ContainerSpec {
    ContainerSpec {
        kind: ContainerKind::Task,
        team: TeamName::from("main"),
        image: ImageSpec {
            source: ImageSource::Url("docker:///busybox".to_string()),
            privileged: false,
        },
        dir: ".".to_string(),
        env: BTreeMap::new(),
        inputs: Vec::new(),
        outputs: BTreeMap::new(),
    }
}

pub fn owner(plan_id: &str) -> ContainerOwner {
    ContainerOwner {
        build_id: BuildId::new(),
        plan_id: PlanId::from(plan_id),
        team: TeamName::from("main"),
    }
}

/// A task plan whose run path is its name, so worker scripts key on it.
pub fn task_plan(name: &str) -> TaskPlan {
    TaskPlan {
        name: name.to_string(),
        privileged: false,
        tags: Vec::new(),
        config: TaskConfig {
            platform: "linux".to_string(),
            image_resource: None,
            rootfs_uri: Some("docker:///busybox".to_string()),
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: BTreeMap::new(),
            run: TaskRunConfig {
                path: name.to_string(),
                ..Default::default()
            },
        },
        image_artifact_name: None,
        input_mapping: BTreeMap::new(),
        output_mapping: BTreeMap::new(),
        resource_types: Vec::new(),
    }
}

fn task_step(
    plan: TaskPlan,
    build: &BuildInfo,
    settings: SelectionSettings,
    delegates: &RecordingDelegateFactory,
) -> Step {
    let plan_id = PlanId::from(plan.name.as_str());
    let delegate = delegates.task_delegate(build, &plan_id);
    Step::Task(TaskStep::new(plan_id, plan, build.clone(), settings, delegate))
}

/// Builds step trees against one fake worker, with a shared run state.
///
/// Leaf plan ids are derived from names: a task's id is its name, a get is
/// `get-<resource>`, a put `put-<resource>`, a set_pipeline `set-<name>`.
pub struct World {
    pub worker: Arc<FakeWorker>,
    pub pool: Arc<FakePool>,
    pub delegates: Arc<RecordingDelegateFactory>,
    pub saver: Arc<FakePipelineSaver>,
    pub build: BuildInfo,
    pub settings: SelectionSettings,
    state: RunState,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        let worker = Arc::new(FakeWorker::new("w1"));
        let pool = Arc::new(FakePool::with_worker(worker.clone()));
        let state = RunState::new(pool.clone());
        Self {
            worker,
            pool,
            delegates: Arc::new(RecordingDelegateFactory::default()),
            saver: Arc::new(FakePipelineSaver::default()),
            build: BuildInfo::one_off("main", "test-build"),
            settings: SelectionSettings {
                wait_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            state,
        }
    }

    /// Run builds as `team` instead of `main`.
    pub fn with_team(mut self, team: &str) -> Self {
        self.build.team = TeamName::from(team);
        self
    }

    pub fn state(&self) -> RunState {
        self.state.clone()
    }

    pub fn delegate(&self, plan_id: &str) -> Arc<RecordingDelegate> {
        self.delegates.delegate(&PlanId::from(plan_id))
    }

    pub fn task_plan(&self, name: &str) -> TaskPlan {
        task_plan(name)
    }

    pub fn task_from(&self, plan: TaskPlan) -> Step {
        task_step(plan, &self.build, self.settings, &self.delegates)
    }

    pub fn task(&self, name: &str) -> Step {
        self.task_from(self.task_plan(name))
    }

    pub fn get_plan(&self, resource: &str) -> GetPlan {
        GetPlan {
            name: resource.to_string(),
            resource: resource.to_string(),
            type_: "git".to_string(),
            source: json!({"uri": format!("https://example.com/{}.git", resource)}),
            params: Value::Null,
            version: None,
            version_from: None,
            tags: Vec::new(),
            resource_types: Vec::new(),
        }
    }

    pub fn get_from(&self, plan_id: &str, plan: GetPlan) -> Step {
        let plan_id = PlanId::from(plan_id);
        let delegate = self.delegates.get_delegate(&self.build, &plan_id);
        Step::Get(GetStep::new(plan_id, plan, self.build.clone(), self.settings, delegate))
    }

    pub fn get(&self, resource: &str) -> Step {
        self.get_from(&format!("get-{}", resource), self.get_plan(resource))
    }

    pub fn put_plan(&self, resource: &str) -> PutPlan {
        PutPlan {
            name: resource.to_string(),
            resource: resource.to_string(),
            type_: "git".to_string(),
            source: json!({"uri": format!("https://example.com/{}.git", resource)}),
            params: Value::Null,
            inputs: PutInputs::All,
            tags: Vec::new(),
            resource_types: Vec::new(),
        }
    }

    pub fn put_from(&self, plan_id: &str, plan: PutPlan) -> Step {
        let plan_id = PlanId::from(plan_id);
        let delegate = self.delegates.put_delegate(&self.build, &plan_id);
        Step::Put(PutStep::new(plan_id, plan, self.build.clone(), self.settings, delegate))
    }

    pub fn put(&self, resource: &str) -> Step {
        self.put_from(&format!("put-{}", resource), self.put_plan(resource))
    }

    pub fn set_pipeline_plan(&self, name: &str, file: &str) -> SetPipelinePlan {
        SetPipelinePlan {
            name: name.to_string(),
            file: file.to_string(),
            team: None,
            vars: Value::Null,
        }
    }

    pub fn set_pipeline_from(&self, plan_id: &str, plan: SetPipelinePlan) -> Step {
        let plan_id = PlanId::from(plan_id);
        let delegate = self.delegates.set_pipeline_delegate(&self.build, &plan_id);
        Step::SetPipeline(SetPipelineStep::new(
            plan_id,
            plan,
            self.build.clone(),
            self.saver.clone(),
            delegate,
        ))
    }

    pub fn set_pipeline(&self, name: &str, file: &str) -> Step {
        self.set_pipeline_from(&format!("set-{}", name), self.set_pipeline_plan(name, file))
    }

    pub fn artifact_input(&self, name: &str, handle: &str) -> Step {
        Step::ArtifactInput(ArtifactInputStep::new(
            PlanId::from(format!("input-{}", name)),
            ArtifactInputPlan {
                name: name.to_string(),
                handle: handle.to_string(),
            },
        ))
    }

    pub fn artifact_output(&self, name: &str) -> Step {
        Step::ArtifactOutput(ArtifactOutputStep::new(
            PlanId::from(format!("output-{}", name)),
            ArtifactOutputPlan {
                name: name.to_string(),
            },
        ))
    }

    pub fn do_(&self, steps: Vec<Step>) -> Step {
        Step::Do(DoStep::new(steps))
    }

    pub fn aggregate(&self, steps: Vec<Step>) -> Step {
        Step::Aggregate(AggregateStep::new(steps))
    }

    pub fn in_parallel(&self, steps: Vec<Step>, limit: usize, fail_fast: bool) -> Step {
        Step::InParallel(InParallelStep::new(steps, limit, fail_fast))
    }

    pub fn across(
        &self,
        var: &str,
        values: Vec<Value>,
        step_for: impl Fn(&Value) -> Step,
        max_in_flight: usize,
        fail_fast: bool,
    ) -> Step {
        let iterations = values
            .into_iter()
            .map(|value| {
                let step = step_for(&value);
                (value, step)
            })
            .collect();
        Step::Across(AcrossStep::new(var, iterations, max_in_flight, fail_fast))
    }

    pub fn on_success(&self, step: Step, hook: Step) -> Step {
        Step::OnSuccess(OnSuccessStep::new(step, hook))
    }

    pub fn on_failure(&self, step: Step, hook: Step) -> Step {
        Step::OnFailure(OnFailureStep::new(step, hook))
    }

    pub fn on_abort(&self, step: Step, hook: Step) -> Step {
        Step::OnAbort(OnAbortStep::new(step, hook))
    }

    pub fn on_error(&self, step: Step, hook: Step) -> Step {
        Step::OnError(OnErrorStep::new(step, hook))
    }

    pub fn ensure(&self, step: Step, hook: Step) -> Step {
        Step::Ensure(EnsureStep::new(step, hook))
    }

    pub fn try_(&self, step: Step) -> Step {
        Step::Try(TryStep::new(step))
    }

    /// Retry the task `name`, building a fresh task step per attempt.
    pub fn retry(&self, name: &str, attempts: u32) -> Step {
        let plan = self.task_plan(name);
        let build = self.build.clone();
        let settings = self.settings;
        let delegates = self.delegates.clone();
        let factory: StepFactory =
            Box::new(move |_attempt| task_step(plan.clone(), &build, settings, &delegates));
        Step::Retry(RetryStep::new(factory, attempts))
    }

    pub fn timeout(&self, step: Step, duration: Duration) -> Step {
        Step::Timeout(TimeoutStep::new(step, duration))
    }
}
