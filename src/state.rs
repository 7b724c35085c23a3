use crate::dashboard;
use crate::image_reference::ImageReferenceParser;
use crate::oci_registry::RegistryClient;
use std::collections::BTreeMap;
use std::sync::Arc;
use tera::Tera;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState<P> {
    pub(crate) pods: P,
    pub(crate) registry: Arc<RegistryClient>,
    pub(crate) parser: Arc<ImageReferenceParser>,
    pub(crate) templates: Arc<Tera>,
    /// Parent of every request's cancellation token, cancelled on shutdown.
    pub(crate) shutdown: CancellationToken,
}

impl<P> AppState<P> {
    pub fn new(
        pods: P,
        registry: RegistryClient,
        parser: ImageReferenceParser,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            pods,
            registry: Arc::new(registry),
            parser: Arc::new(parser),
            templates: Arc::new(dashboard::create_templates()?),
            shutdown,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodSummary {
    pub(crate) name: String,
    pub(crate) containers: BTreeMap<String, ContainerSummary>,
    pub(crate) init_containers: BTreeMap<String, ContainerSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub(crate) image: String,
    /// Digest of the image the container runtime is actually running.
    pub(crate) digest: String,
}
