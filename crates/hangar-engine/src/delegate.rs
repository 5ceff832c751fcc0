//! Delegates that turn step callbacks into [`BuildEvent`]s.

use async_trait::async_trait;
use bytes::Bytes;
use hangar_core::plan::{ImageResource, TaskConfig, VersionedResourceType};
use hangar_core::worker::{ExitStatus, ImageFetcher, ImageSpec, LogSink, VersionResult};
use hangar_core::{BuildInfo, Context, PlanId, Result, TeamName};
use hangar_exec::{
    BuildStepDelegate, DelegateFactory, GetDelegate, PutDelegate, SetPipelineDelegate,
    TaskDelegate,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Span, debug, info_span};

use crate::event::{BuildEvent, BuildEventKind, LogStream};

/// Sends one event per step callback. A closed receiver drops events.
#[derive(Clone)]
struct EventSender {
    build: BuildInfo,
    plan_id: PlanId,
    events: mpsc::UnboundedSender<BuildEvent>,
}

impl EventSender {
    fn send(&self, kind: BuildEventKind) {
        let event = BuildEvent::new(self.build.id, self.plan_id.clone(), kind);
        if self.events.send(event).is_err() {
            debug!(build_id = %self.build.id, plan_id = %self.plan_id, "Event receiver closed");
        }
    }
}

struct EventLogSink {
    sender: EventSender,
    stream: LogStream,
}

impl LogSink for EventLogSink {
    fn write(&self, chunk: Bytes) {
        self.sender.send(BuildEventKind::Log {
            stream: self.stream,
            payload: String::from_utf8_lossy(&chunk).into_owned(),
        });
    }
}

/// Delegate for a single leaf step, reporting over the build's event channel.
pub struct EventDelegate {
    sender: EventSender,
    images: Arc<dyn ImageFetcher>,
    stdout: Arc<dyn LogSink>,
    stderr: Arc<dyn LogSink>,
}

impl EventDelegate {
    pub fn new(
        build: BuildInfo,
        plan_id: PlanId,
        events: mpsc::UnboundedSender<BuildEvent>,
        images: Arc<dyn ImageFetcher>,
    ) -> Self {
        let sender = EventSender {
            build,
            plan_id,
            events,
        };
        Self {
            stdout: Arc::new(EventLogSink {
                sender: sender.clone(),
                stream: LogStream::Stdout,
            }),
            stderr: Arc::new(EventLogSink {
                sender: sender.clone(),
                stream: LogStream::Stderr,
            }),
            sender,
            images,
        }
    }
}

#[async_trait]
impl BuildStepDelegate for EventDelegate {
    fn initializing(&self) {
        self.sender.send(BuildEventKind::Initializing);
    }

    fn starting(&self) {
        self.sender.send(BuildEventKind::Starting);
    }

    fn finished(&self, exit_status: ExitStatus, worker: Option<&str>) {
        self.sender.send(BuildEventKind::Finished {
            exit_status,
            worker: worker.map(str::to_string),
        });
    }

    fn errored(&self, message: &str) {
        self.sender.send(BuildEventKind::Errored {
            message: message.to_string(),
        });
    }

    fn selected_worker(&self, name: &str) {
        self.sender.send(BuildEventKind::SelectedWorker {
            worker: name.to_string(),
        });
    }

    fn stdout(&self) -> Arc<dyn LogSink> {
        self.stdout.clone()
    }

    fn stderr(&self) -> Arc<dyn LogSink> {
        self.stderr.clone()
    }

    fn start_span(&self, step: &'static str, name: &str) -> Span {
        info_span!(
            "step",
            build_id = %self.sender.build.id,
            plan_id = %self.sender.plan_id,
            step,
            name
        )
    }

    async fn fetch_image(
        &self,
        ctx: &Context,
        image: &ImageResource,
        resource_types: &[VersionedResourceType],
        privileged: bool,
    ) -> Result<ImageSpec> {
        self.images
            .fetch_image(ctx, image, resource_types, privileged)
            .await
    }
}

impl TaskDelegate for EventDelegate {
    fn set_task_config(&self, config: &TaskConfig) {
        self.sender.send(BuildEventKind::TaskConfig {
            config: Box::new(config.clone()),
        });
    }
}

impl GetDelegate for EventDelegate {
    fn update_version(&self, resource: &str, result: &VersionResult) {
        self.sender.send(BuildEventKind::VersionUpdated {
            resource: resource.to_string(),
            result: result.clone(),
        });
    }
}

impl PutDelegate for EventDelegate {
    fn save_output(&self, resource: &str, result: &VersionResult) {
        self.sender.send(BuildEventKind::OutputSaved {
            resource: resource.to_string(),
            result: result.clone(),
        });
    }
}

impl SetPipelineDelegate for EventDelegate {
    fn set_pipeline_changed(&self, team: &TeamName, name: &str, changed: bool) {
        self.sender.send(BuildEventKind::PipelineChanged {
            team: team.clone(),
            name: name.to_string(),
            changed,
        });
    }
}

/// Creates [`EventDelegate`]s that all report into one channel.
pub struct EventDelegateFactory {
    events: mpsc::UnboundedSender<BuildEvent>,
    images: Arc<dyn ImageFetcher>,
}

impl EventDelegateFactory {
    pub fn new(events: mpsc::UnboundedSender<BuildEvent>, images: Arc<dyn ImageFetcher>) -> Self {
        Self { events, images }
    }

    /// A factory and the receiving end of its event channel.
    pub fn channel(images: Arc<dyn ImageFetcher>) -> (Self, mpsc::UnboundedReceiver<BuildEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, images), rx)
    }

    fn delegate(&self, build: &BuildInfo, plan_id: &PlanId) -> Arc<EventDelegate> {
        Arc::new(EventDelegate::new(
            build.clone(),
            plan_id.clone(),
            self.events.clone(),
            self.images.clone(),
        ))
    }
}

impl DelegateFactory for EventDelegateFactory {
    fn task_delegate(&self, build: &BuildInfo, plan_id: &PlanId) -> Arc<dyn TaskDelegate> {
        self.delegate(build, plan_id)
    }

    fn get_delegate(&self, build: &BuildInfo, plan_id: &PlanId) -> Arc<dyn GetDelegate> {
        self.delegate(build, plan_id)
    }

    fn put_delegate(&self, build: &BuildInfo, plan_id: &PlanId) -> Arc<dyn PutDelegate> {
        self.delegate(build, plan_id)
    }

    fn set_pipeline_delegate(
        &self,
        build: &BuildInfo,
        plan_id: &PlanId,
    ) -> Arc<dyn SetPipelineDelegate> {
        self.delegate(build, plan_id)
    }
}
