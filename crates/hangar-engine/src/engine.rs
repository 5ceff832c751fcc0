//! The build driver: runs compiled step trees and drains them on shutdown.

use async_trait::async_trait;
use dashmap::DashMap;
use hangar_config::EngineConfig;
use hangar_core::pipeline::PipelineSaver;
use hangar_core::plan::Plan;
use hangar_core::worker::WorkerPool;
use hangar_core::{BuildId, BuildInfo, CancelCause, Context};
use hangar_exec::{DelegateFactory, RunState, SelectionSettings, Step};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::{Instrument, info, info_span, warn};

use crate::builder::StepBuilder;
use crate::status::RunOutcome;

/// A build to run: its identity and its plan.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub build: BuildInfo,
    pub plan: Plan,
}

/// Something the engine can run to completion.
#[async_trait]
pub trait Runnable: Send + Sync {
    async fn run(&self, ctx: &Context) -> RunOutcome;
}

struct Inner {
    config: EngineConfig,
    pool: Arc<dyn WorkerPool>,
    delegates: Arc<dyn DelegateFactory>,
    pipelines: Arc<dyn PipelineSaver>,
    running: DashMap<BuildId, Context>,
    draining: AtomicBool,
    idle: Notify,
}

/// Runs builds against a shared worker pool.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        pool: Arc<dyn WorkerPool>,
        delegates: Arc<dyn DelegateFactory>,
        pipelines: Arc<dyn PipelineSaver>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                pool,
                delegates,
                pipelines,
                running: DashMap::new(),
                draining: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Compile a build's plan into its step tree.
    pub fn new_build(&self, spec: BuildSpec) -> Build {
        let config = &self.inner.config;
        let settings = SelectionSettings {
            strategy: config.placement_strategy,
            create_timeout: config.container_create_timeout,
            wait_timeout: config.worker_wait_timeout,
        };
        let builder = StepBuilder::new(
            spec.build.clone(),
            self.inner.delegates.clone(),
            self.inner.pipelines.clone(),
            settings,
        );
        let step = builder.build(&spec.plan);

        Build {
            info: spec.build,
            step,
            engine: self.inner.clone(),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Builds currently running.
    pub fn running_builds(&self) -> usize {
        self.inner.running.len()
    }

    /// Stop accepting builds, interrupt the running ones and wait for them to
    /// return, or for `ctx` to be cancelled.
    pub async fn drain(&self, ctx: &Context) {
        if !self.inner.draining.swap(true, Ordering::SeqCst) {
            info!(running = self.inner.running.len(), "Draining engine");
        }

        for entry in self.inner.running.iter() {
            entry.value().cancel(CancelCause::Shutdown);
        }

        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.inner.running.is_empty() {
                info!("Engine drained");
                return;
            }

            tokio::select! {
                _ = &mut idle => {}
                cause = ctx.cancelled() => {
                    warn!(
                        ?cause,
                        running = self.inner.running.len(),
                        "Stopped waiting for builds to drain"
                    );
                    return;
                }
            }
        }
    }

    /// Drain, waiting at most the configured grace period.
    pub async fn shutdown(&self) {
        let ctx = Context::background().with_timeout(self.inner.config.drain_grace);
        self.drain(&ctx).await;
    }
}

/// A build compiled and ready to run.
pub struct Build {
    info: BuildInfo,
    step: Step,
    engine: Arc<Inner>,
}

impl Build {
    pub fn info(&self) -> &BuildInfo {
        &self.info
    }
}

/// Unregisters a running build when dropped, including when the run future
/// is dropped before it completes.
struct RunningGuard<'a> {
    engine: &'a Inner,
    build_id: BuildId,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.engine.running.remove(&self.build_id);
        self.engine.pool.release_build(&self.build_id);
        self.engine.idle.notify_waiters();
    }
}

#[async_trait]
impl Runnable for Build {
    async fn run(&self, ctx: &Context) -> RunOutcome {
        let build_id = self.info.id;
        if self.engine.draining.load(Ordering::SeqCst) {
            info!(%build_id, "Engine is draining; not starting build");
            return RunOutcome::Interrupted;
        }

        let build_ctx = ctx.child();
        self.engine.running.insert(build_id, build_ctx.clone());
        let running = RunningGuard {
            engine: &self.engine,
            build_id,
        };
        // A drain that started between the check above and the insert
        // missed this build.
        if self.engine.draining.load(Ordering::SeqCst) {
            build_ctx.cancel(CancelCause::Shutdown);
        }

        let span = info_span!("build", %build_id, name = %self.info.name, team = %self.info.team);
        let state = RunState::new(self.engine.pool.clone());
        let result = async {
            info!("Starting build");
            self.step.run(&build_ctx, &state).await
        }
        .instrument(span.clone())
        .await;

        drop(running);

        let outcome = RunOutcome::from_result(&result);
        span.in_scope(|| match (&outcome, &result) {
            (RunOutcome::Interrupted, _) => info!("Build interrupted by drain"),
            (RunOutcome::Finished(status), Err(err)) => {
                info!(%status, error = %err, "Build finished")
            }
            (RunOutcome::Finished(status), Ok(_)) => info!(%status, "Build finished"),
        });
        outcome
    }
}
