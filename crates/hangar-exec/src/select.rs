//! Worker selection with bounded waiting.

use bytes::Bytes;
use hangar_core::worker::{
    ContainerOwner, ContainerSpec, LogSink, PlacementStrategy, WorkerClient, WorkerPool,
    WorkerSpec,
};
use hangar_core::{Context, ExecError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info};

/// How often the pool is asked again while no worker is eligible.
pub const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(1);

const WAITING_MESSAGE: &str = "All workers are busy at the moment, please stand-by.\n";

/// Placement parameters every leaf step selects workers with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionSettings {
    pub strategy: PlacementStrategy,
    /// Bound on waiting for an in-progress container creation.
    pub create_timeout: Duration,
    /// Bound on waiting for any worker to become eligible.
    pub wait_timeout: Duration,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            strategy: PlacementStrategy::default(),
            create_timeout: Duration::from_secs(5 * 60),
            wait_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Ask `pool` for a worker until one is eligible, `wait_timeout` passes, or
/// `ctx` is cancelled. Each pool call is bounded by `create_timeout`.
///
/// The first time no worker is eligible a notice is written to `waiting`.
#[allow(clippy::too_many_arguments)]
pub async fn select_worker(
    ctx: &Context,
    pool: &dyn WorkerPool,
    owner: &ContainerOwner,
    container_spec: &ContainerSpec,
    worker_spec: &WorkerSpec,
    strategy: PlacementStrategy,
    create_timeout: Duration,
    wait_timeout: Duration,
    waiting: Option<&dyn LogSink>,
) -> Result<Arc<dyn WorkerClient>> {
    let deadline = Instant::now() + wait_timeout;
    let mut announced = false;

    loop {
        let selected = ctx
            .run_until_cancelled(async {
                let attempt = pool.select_worker(
                    owner,
                    container_spec,
                    worker_spec,
                    strategy,
                    create_timeout,
                );
                match timeout(create_timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(ExecError::WorkerSelection(format!(
                        "timed out after {:?} waiting for container creation",
                        create_timeout
                    ))),
                }
            })
            .await?;

        if let Some(worker) = selected {
            debug!(plan_id = %owner.plan_id, worker = %worker.name(), %strategy, "Selected worker");
            return Ok(worker);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ExecError::NoEligibleWorker(describe(worker_spec)));
        }

        if !announced {
            info!(
                plan_id = %owner.plan_id,
                spec = %describe(worker_spec),
                "Waiting for an eligible worker"
            );
            if let Some(sink) = waiting {
                sink.write(Bytes::from_static(WAITING_MESSAGE.as_bytes()));
            }
            announced = true;
        }

        let pause = WORKER_POLL_INTERVAL.min(deadline - now);
        ctx.run_until_cancelled(async {
            sleep(pause).await;
            Ok(())
        })
        .await?;
    }
}

/// Human-readable summary of worker constraints, e.g.
/// `platform 'linux', tags 'gpu', team 'main'`.
pub fn describe(spec: &WorkerSpec) -> String {
    let mut parts = Vec::new();
    if let Some(platform) = &spec.platform {
        parts.push(format!("platform '{}'", platform));
    }
    if !spec.tags.is_empty() {
        parts.push(format!("tags '{}'", spec.tags.join(", ")));
    }
    if let Some(resource_type) = &spec.resource_type {
        parts.push(format!("resource type '{}'", resource_type));
    }
    if let Some(team) = &spec.team {
        parts.push(format!("team '{}'", team));
    }
    if parts.is_empty() {
        "any worker".to_string()
    } else {
        parts.join(", ")
    }
}
