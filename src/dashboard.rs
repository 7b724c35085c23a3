use crate::cluster::{ClusterError, PodLister};
use crate::image_reference::DEFAULT_TAG;
use crate::state::{AppState, ContainerSummary};
use crate::tag_filter::newer_tags;
use chrono::Utc;
use serde::Serialize;
use tera::Tera;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TEMPLATE_NAME: &str = "dashboard.html";
const CONTAINER: &str = "Container";
const INIT_CONTAINER: &str = "Init container";

#[derive(Debug, Serialize)]
pub struct DashboardView {
    pub pods: Vec<PodView>,
    pub error: Option<String>,
    pub generated_at: String,
}

#[derive(Debug, Serialize)]
pub struct PodView {
    pub name: String,
    pub containers: Vec<ContainerView>,
}

#[derive(Debug, Default, Serialize)]
pub struct ContainerView {
    pub kind: &'static str,
    pub name: String,
    pub image: String,
    pub digest: String,
    pub current_tag: String,
    pub newer_tags: Vec<String>,
    pub remote_digest: Option<String>,
    pub remote_digest_error: Option<String>,
    /// Set when the lookup was abandoned, replaces the tag line.
    pub error: Option<String>,
}

impl DashboardView {
    pub fn failed(error: impl ToString) -> Self {
        Self {
            pods: Vec::new(),
            error: Some(error.to_string()),
            generated_at: Utc::now().to_rfc3339(),
        }
    }
}

/// The template name ends in `.html` so Tera autoescapes every value.
pub fn create_templates() -> anyhow::Result<Tera> {
    let mut tera = Tera::default();
    tera.add_raw_template(
        TEMPLATE_NAME,
        include_str!("../templates/dashboard.html.tera"),
    )?;
    Ok(tera)
}

pub fn render(templates: &Tera, view: &DashboardView) -> tera::Result<String> {
    let context = tera::Context::from_serialize(view)?;
    templates.render(TEMPLATE_NAME, &context)
}

/// Looks up every container of every pod, one after the other.
pub async fn build_view<P: PodLister>(
    state: &AppState<P>,
    cancel: &CancellationToken,
) -> Result<DashboardView, ClusterError> {
    let pods = cancel
        .run_until_cancelled(state.pods.list_pods())
        .await
        .ok_or(ClusterError::Cancelled)??;

    let mut pod_views = Vec::with_capacity(pods.len());
    for pod in &pods {
        let mut containers = Vec::new();
        for (kind, group) in [
            (CONTAINER, &pod.containers),
            (INIT_CONTAINER, &pod.init_containers),
        ] {
            for (name, container) in group {
                containers.push(inspect_container(state, kind, name, container, cancel).await);
            }
        }
        pod_views.push(PodView {
            name: pod.name.clone(),
            containers,
        });
    }

    let (handles, tag_lists, digests) = state.registry.cache().sizes();
    debug!(
        "Lookup cache holds {} registry handles, {} tag lists and {} digests",
        handles, tag_lists, digests
    );

    Ok(DashboardView {
        pods: pod_views,
        error: None,
        generated_at: Utc::now().to_rfc3339(),
    })
}

async fn inspect_container<P>(
    state: &AppState<P>,
    kind: &'static str,
    name: &str,
    container: &ContainerSummary,
    cancel: &CancellationToken,
) -> ContainerView {
    let mut view = ContainerView {
        kind,
        name: name.to_string(),
        image: container.image.clone(),
        digest: container.digest.clone(),
        ..Default::default()
    };

    let image_reference = match state.parser.parse(&container.image) {
        Ok(image_reference) => image_reference,
        Err(e) => {
            warn!("Skipping container {} with image {}: {}", name, container.image, e);
            view.error = Some(format!("Image reference error: {}", e));
            return view;
        }
    };
    info!(
        "Found container {} with image {} and current digest {}",
        name, image_reference, container.digest
    );
    view.current_tag = image_reference.tag.clone();

    match state.registry.tags(&image_reference, cancel).await {
        Ok(tags) => view.newer_tags = newer_tags(&tags, &image_reference.tag),
        Err(e) => {
            warn!("Failed to fetch tags for {}: {}", image_reference, e);
            view.error = Some(format!("Tags error: {}", e));
            return view;
        }
    }

    // a moving tag can only be checked by its digest
    if image_reference.tag == DEFAULT_TAG {
        match state.registry.digest(&image_reference, cancel).await {
            Ok(digest) => view.remote_digest = Some(digest),
            Err(e) => {
                warn!("Failed to fetch digest for {}: {}", image_reference, e);
                view.remote_digest_error = Some(e.to_string());
            }
        }
    }

    view
}
