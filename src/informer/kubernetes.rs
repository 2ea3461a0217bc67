use crate::errors::ControllerError;
use crate::informer::{EventStream, WatchEvent};
use futures::{future, StreamExt};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::info;

/// Where and what to watch.
#[derive(Debug, Clone, Default)]
pub struct WatchScope {
    /// `None` watches every namespace.
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

/// Builds a client from an explicit kubeconfig (and optional context), or
/// from the in-cluster / default configuration when no path is given.
pub async fn connect(
    kubeconfig_path: Option<&str>,
    context: Option<&str>,
) -> Result<Client, ControllerError> {
    let Some(kubeconfig_path) = kubeconfig_path else {
        return Ok(Client::try_default().await?);
    };

    info!("[Kubernetes] Using kubeconfig from path: {}", kubeconfig_path);
    let kubeconfig = kube::config::Kubeconfig::read_from(kubeconfig_path)
        .map_err(|e| ControllerError::Kubeconfig(e.to_string()))?;

    if let Some(context) = context {
        info!("[Kubernetes] Using context: {}", context);
    }
    let options = kube::config::KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| ControllerError::Kubeconfig(e.to_string()))?;

    Ok(Client::try_from(config)?)
}

pub fn scoped_api<K>(client: Client, scope: &WatchScope) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match scope.namespace.as_deref() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Lists and then watches `api`, folding the watcher's initial page events
/// into a single `WatchEvent::Listed`. Errors are yielded to the caller and
/// the watcher resumes after its default backoff.
pub fn watch_stream<K>(api: Api<K>, scope: &WatchScope) -> EventStream<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let mut config = watcher::Config::default();
    if let Some(labels) = scope.label_selector.as_deref() {
        config = config.labels(labels);
    }
    if let Some(fields) = scope.field_selector.as_deref() {
        config = config.fields(fields);
    }

    watcher(api, config)
        .default_backoff()
        .scan(Vec::new(), |page, event| {
            future::ready(Some(fold_initial_page(page, event)))
        })
        .filter_map(future::ready)
        .boxed()
}

fn fold_initial_page<K>(
    page: &mut Vec<K>,
    event: Result<watcher::Event<K>, watcher::Error>,
) -> Option<Result<WatchEvent<K>, ControllerError>> {
    match event {
        Ok(watcher::Event::Init) => {
            page.clear();
            None
        }
        Ok(watcher::Event::InitApply(obj)) => {
            page.push(obj);
            None
        }
        Ok(watcher::Event::InitDone) => Some(Ok(WatchEvent::Listed(std::mem::take(page)))),
        Ok(watcher::Event::Apply(obj)) => Some(Ok(WatchEvent::Applied(obj))),
        Ok(watcher::Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
        Err(e) => Some(Err(ControllerError::Watch(e))),
    }
}
