//! Helpers shared by the leaf steps that talk to workers.

use hangar_core::plan::{ImageResource, VersionedResourceType};
use hangar_core::worker::{ContainerOwner, ImageSource, ImageSpec, ProcessIo};
use hangar_core::{BuildInfo, Context, PlanId, Result};
use tracing::debug;

use crate::delegate::BuildStepDelegate;

pub(super) fn container_owner(build: &BuildInfo, plan_id: &PlanId) -> ContainerOwner {
    ContainerOwner {
        build_id: build.id,
        plan_id: plan_id.clone(),
        team: build.team.clone(),
    }
}

pub(super) fn process_io<D>(delegate: &D) -> ProcessIo
where
    D: BuildStepDelegate + ?Sized,
{
    ProcessIo {
        stdout: delegate.stdout(),
        stderr: delegate.stderr(),
    }
}

/// Image to run a resource's container in, and the base resource type the
/// worker must support (if any).
///
/// A custom resource type has its image fetched through the delegate; a base
/// type uses the image the worker ships for it.
pub(super) async fn resource_image<D>(
    delegate: &D,
    ctx: &Context,
    type_: &str,
    resource_types: &[VersionedResourceType],
) -> Result<(ImageSpec, Option<String>)>
where
    D: BuildStepDelegate + ?Sized,
{
    let Some(custom) = resource_types.iter().find(|rt| rt.name == type_) else {
        return Ok((
            ImageSpec {
                source: ImageSource::ResourceType(type_.to_string()),
                privileged: false,
            },
            Some(type_.to_string()),
        ));
    };

    debug!(
        resource_type = %custom.name,
        base = %custom.type_,
        "Fetching custom resource type image"
    );
    let image = ImageResource {
        type_: custom.type_.clone(),
        source: custom.source.clone(),
        params: None,
        version: custom.version.clone(),
    };
    // a type's image is never fetched through the type itself
    let others: Vec<VersionedResourceType> = resource_types
        .iter()
        .filter(|rt| rt.name != custom.name)
        .cloned()
        .collect();

    let spec = ctx
        .run_until_cancelled(delegate.fetch_image(ctx, &image, &others, custom.privileged))
        .await?;
    Ok((spec, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDelegate;
    use serde_json::json;

    #[tokio::test]
    async fn test_base_type_uses_worker_image() {
        let delegate = RecordingDelegate::default();
        let (image, resource_type) = resource_image(&delegate, &Context::background(), "git", &[])
            .await
            .unwrap();

        assert_eq!(image.source, ImageSource::ResourceType("git".to_string()));
        assert_eq!(resource_type.as_deref(), Some("git"));
        assert!(delegate.events().is_empty());
    }

    #[tokio::test]
    async fn test_custom_type_is_fetched() {
        let delegate = RecordingDelegate::default();
        let custom = VersionedResourceType {
            name: "slack".to_string(),
            type_: "registry-image".to_string(),
            source: json!({"repository": "slack-resource"}),
            privileged: true,
            version: None,
        };

        let (image, resource_type) =
            resource_image(&delegate, &Context::background(), "slack", &[custom])
                .await
                .unwrap();

        assert_eq!(image.source, ImageSource::Url("fetched:registry-image".to_string()));
        assert!(image.privileged);
        assert!(resource_type.is_none());
        assert_eq!(delegate.events(), vec!["fetch_image:registry-image"]);
    }
}
