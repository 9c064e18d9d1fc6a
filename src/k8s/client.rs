// Client creation with custom user-agent support for kube 2.x
use crate::error::Result;
use hyper::http::{HeaderName, HeaderValue};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, warn};

/// Create a new k8s client to interact with k8s cluster api
///
/// An empty `kubeconfig_path` falls back to in-cluster config or the
/// default kubeconfig.
///
/// # Errors
///
/// Will return `Err` if no usable cluster configuration can be loaded
pub async fn new(kubeconfig_path: &str, custom_user_agent: Option<&str>) -> Result<Client> {
    let mut config = if kubeconfig_path.is_empty() {
        Config::infer().await?
    } else {
        debug!("Loading kubeconfig from {}", kubeconfig_path);
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
    };

    add_user_agent_header(&mut config, custom_user_agent);

    let client = Client::try_from(config)?;

    Ok(client)
}

/// Identify our API calls. Invalid header values keep the default user-agent.
pub fn add_user_agent_header(config: &mut Config, user_agent: Option<&str>) {
    let Some(user_agent) = user_agent else {
        return;
    };
    match HeaderValue::from_str(user_agent) {
        Ok(header_value) => config
            .headers
            .push((HeaderName::from_static("user-agent"), header_value)),
        Err(e) => warn!("⚠️ Ignoring invalid user-agent {:?}: {}", user_agent, e),
    }
}
