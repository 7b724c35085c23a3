use crate::state::{ContainerSummary, PodSummary};
use k8s_openapi::api::core::v1::{Container, ContainerStatus, Pod};
use kube::api::ListParams;
use kube::{Api, Client};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("failed to list pods: {0}")]
    List(#[from] kube::Error),
    #[error("pod listing was cancelled")]
    Cancelled,
}

/// Source of the pods shown on the dashboard.
pub trait PodLister: Clone + Send + Sync + 'static {
    fn list_pods(&self) -> impl Future<Output = Result<Vec<PodSummary>, ClusterError>> + Send;
}

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

#[derive(Clone)]
pub struct KubePodLister {
    client: Client,
}

impl KubePodLister {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl PodLister for KubePodLister {
    async fn list_pods(&self) -> Result<Vec<PodSummary>, ClusterError> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let pod_list = pods.list(&ListParams::default()).await?;
        info!("Found {} pods across all namespaces", pod_list.items.len());
        Ok(pod_list.items.iter().map(summarize_pod).collect())
    }
}

fn summarize_pod(pod: &Pod) -> PodSummary {
    let name = pod.metadata.name.clone().unwrap_or_default();
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();

    let mut containers =
        summarize_containers(spec.map(|s| s.containers.as_slice()).unwrap_or_default());
    let mut init_containers =
        summarize_containers(spec.and_then(|s| s.init_containers.as_deref()).unwrap_or_default());

    apply_statuses(
        &name,
        &mut containers,
        status
            .and_then(|s| s.container_statuses.as_deref())
            .unwrap_or_default(),
    );
    apply_statuses(
        &name,
        &mut init_containers,
        status
            .and_then(|s| s.init_container_statuses.as_deref())
            .unwrap_or_default(),
    );

    PodSummary {
        name,
        containers,
        init_containers,
    }
}

fn summarize_containers(containers: &[Container]) -> BTreeMap<String, ContainerSummary> {
    containers
        .iter()
        .map(|container| {
            (
                container.name.clone(),
                ContainerSummary {
                    image: container.image.clone().unwrap_or_default(),
                    digest: String::new(),
                },
            )
        })
        .collect()
}

fn apply_statuses(
    pod_name: &str,
    containers: &mut BTreeMap<String, ContainerSummary>,
    statuses: &[ContainerStatus],
) {
    for status in statuses {
        match containers.get_mut(&status.name) {
            Some(container) => container.digest = running_digest(&status.image_id),
            None => warn!(
                "Pod {} reports status for unknown container {}",
                pod_name, status.name
            ),
        }
    }
}

/// Strips the runtime prefix from an image ID such as
/// `docker-pullable://nginx@sha256:<hex>`, keeping everything after the second `:`.
fn running_digest(image_id: &str) -> String {
    if let Some(rest) = image_id.splitn(3, ':').nth(2) {
        return rest.to_string();
    }
    debug!("Image ID {} has no runtime prefix", image_id);
    match image_id.split_once('@') {
        Some((_, digest)) => digest.to_string(),
        None => image_id.to_string(),
    }
}
