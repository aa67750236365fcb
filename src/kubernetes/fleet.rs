//! The dynamic List/Watch fleet.
//!
//! One underlying List+Watch loop runs per (group, version, resource).
//! Namespace filtering is client-side: reconciliation updates a shared
//! filter in place, so adding or removing a namespace from an existing
//! watch never re-lists the resource.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, ApiResource, DynamicObject, ListParams, WatchEvent, WatchParams};
use kube::core::GroupVersionKind;
use kube::Client;
use tokio_util::sync::CancellationToken;

use super::config::{WatchConfig, WatchSpec};
use crate::event::EventKind;
use crate::pipeline::{PipelineHandle, RawResourceEvent};

const LIST_PAGE_SIZE: u32 = 500;
const BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Allowed namespaces for one watched resource. Updated in place on reload.
#[derive(Debug, Default)]
pub struct NamespaceFilter {
    allow_all: bool,
    namespaces: HashSet<String>,
}

impl NamespaceFilter {
    fn from_specs<'a>(specs: impl Iterator<Item = &'a WatchSpec>) -> Self {
        let mut filter = NamespaceFilter::default();
        for spec in specs {
            if spec.namespace.is_empty() {
                filter.allow_all = true;
            } else {
                filter.namespaces.insert(spec.namespace.clone());
            }
        }
        filter
    }

    /// Cluster-scoped objects carry no namespace and always pass.
    pub fn allows(&self, namespace: Option<&str>) -> bool {
        match namespace {
            None => true,
            Some(ns) => self.allow_all || self.namespaces.contains(ns),
        }
    }
}

struct WatcherEntry {
    cancel: CancellationToken,
    filter: Arc<RwLock<NamespaceFilter>>,
}

/// The running set of watchers, reconciled against the declared config.
pub struct WatcherFleet {
    client: Client,
    handle: PipelineHandle,
    watchers: tokio::sync::Mutex<HashMap<String, WatcherEntry>>,
    ready: AtomicBool,
}

impl WatcherFleet {
    pub fn new(client: Client, handle: PipelineHandle) -> Arc<Self> {
        Arc::new(Self {
            client,
            handle,
            watchers: tokio::sync::Mutex::new(HashMap::new()),
            ready: AtomicBool::new(false),
        })
    }

    /// Ready once the initial reconciliation has issued all watches.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Brings the running watcher set in line with `config`: new (G,V,R)s
    /// are started, removed ones cancelled, and namespace filters of
    /// surviving ones updated in place.
    pub async fn reconcile(&self, config: &WatchConfig) {
        let mut desired: HashMap<String, Vec<&WatchSpec>> = HashMap::new();
        for spec in &config.resources {
            desired.entry(spec.gvr()).or_default().push(spec);
        }

        let mut watchers = self.watchers.lock().await;

        let stale: Vec<String> = watchers
            .keys()
            .filter(|gvr| !desired.contains_key(*gvr))
            .cloned()
            .collect();
        for gvr in stale {
            if let Some(entry) = watchers.remove(&gvr) {
                info!(message = "stopping watcher", %gvr);
                entry.cancel.cancel();
            }
        }

        for (gvr, specs) in desired {
            let filter = NamespaceFilter::from_specs(specs.iter().copied());
            match watchers.get(&gvr) {
                Some(entry) => {
                    *entry.filter.write().expect("filter lock poisoned") = filter;
                }
                None => {
                    let spec = specs[0];
                    info!(message = "starting watcher", %gvr, kind = %spec.kind);
                    let filter = Arc::new(RwLock::new(filter));
                    let cancel = CancellationToken::new();
                    tokio::spawn(watch_loop(
                        self.client.clone(),
                        spec.clone(),
                        Arc::clone(&filter),
                        self.handle.clone(),
                        cancel.clone(),
                    ));
                    watchers.insert(gvr, WatcherEntry { cancel, filter });
                }
            }
        }

        self.ready.store(true, Ordering::Relaxed);
    }

    /// Cancels every running watcher.
    pub async fn stop(&self) {
        let mut watchers = self.watchers.lock().await;
        for (gvr, entry) in watchers.drain() {
            debug!(message = "cancelling watcher", %gvr);
            entry.cancel.cancel();
        }
    }

    pub async fn watcher_count(&self) -> usize {
        self.watchers.lock().await.len()
    }
}

/// Seed with a paginated List, then Watch from the returned resourceVersion.
/// Any failure restarts the whole cycle with capped exponential backoff.
async fn watch_loop(
    client: Client,
    spec: WatchSpec,
    filter: Arc<RwLock<NamespaceFilter>>,
    handle: PipelineHandle,
    cancel: CancellationToken,
) {
    let gvk = GroupVersionKind::gvk(&spec.group, &spec.version, &spec.kind);
    let ar = ApiResource::from_gvk_with_plural(&gvk, &spec.resource);
    let api: Api<DynamicObject> = Api::all_with(client, &ar);
    let gvr = spec.gvr();

    let mut backoff = BACKOFF_INITIAL;
    loop {
        if cancel.is_cancelled() {
            break;
        }

        match run_watch_cycle(&api, &spec, &filter, &handle, &cancel).await {
            Ok(CycleEnd::Cancelled) => break,
            Ok(CycleEnd::StreamClosed) => {
                debug!(message = "watch stream closed, restarting", %gvr);
            }
            Err(error) => {
                // Missing CRDs land here as well; keep retrying quietly.
                warn!(message = "watch cycle failed, backing off", %gvr, %error, backoff_ms = backoff.as_millis() as u64);
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
    debug!(message = "watcher exited", %gvr);
}

enum CycleEnd {
    Cancelled,
    StreamClosed,
}

async fn run_watch_cycle(
    api: &Api<DynamicObject>,
    spec: &WatchSpec,
    filter: &Arc<RwLock<NamespaceFilter>>,
    handle: &PipelineHandle,
    cancel: &CancellationToken,
) -> Result<CycleEnd, kube::Error> {
    // Paginated list seeds the stream as Create events.
    let mut resource_version = String::from("0");
    let mut continue_token: Option<String> = None;
    loop {
        if cancel.is_cancelled() {
            return Ok(CycleEnd::Cancelled);
        }
        let mut params = ListParams::default().limit(LIST_PAGE_SIZE);
        params.continue_token = continue_token.clone();
        let page = api.list(&params).await?;
        for object in &page.items {
            dispatch(spec, filter, handle, EventKind::Create, object);
        }
        if let Some(rv) = &page.metadata.resource_version {
            resource_version = rv.clone();
        }
        continue_token = page.metadata.continue_.clone().filter(|t| !t.is_empty());
        if continue_token.is_none() {
            break;
        }
    }

    let mut stream = api
        .watch(&WatchParams::default(), &resource_version)
        .await?
        .boxed();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(CycleEnd::Cancelled),
            next = stream.try_next() => next?,
        };
        let Some(event) = next else {
            return Ok(CycleEnd::StreamClosed);
        };
        match event {
            WatchEvent::Added(object) => dispatch(spec, filter, handle, EventKind::Create, &object),
            WatchEvent::Modified(object) => {
                dispatch(spec, filter, handle, EventKind::Update, &object)
            }
            WatchEvent::Deleted(object) => dispatch(spec, filter, handle, EventKind::Delete, &object),
            WatchEvent::Bookmark(_) => {}
            WatchEvent::Error(status) => {
                warn!(message = "watch error status", gvr = %spec.gvr(), code = status.code);
                return Err(kube::Error::Api(status));
            }
        }
    }
}

fn dispatch(
    spec: &WatchSpec,
    filter: &Arc<RwLock<NamespaceFilter>>,
    handle: &PipelineHandle,
    kind: EventKind,
    object: &DynamicObject,
) {
    {
        let filter = filter.read().expect("filter lock poisoned");
        if !filter.allows(object.metadata.namespace.as_deref()) {
            return;
        }
    }
    let value = match serde_json::to_value(object) {
        Ok(value) => value,
        Err(error) => {
            error!(message = "failed to serialize watched object", %error);
            return;
        }
    };
    handle.push(RawResourceEvent {
        kind,
        api_group: spec.group.clone(),
        api_version: spec.version.clone(),
        resource_kind: spec.kind.clone(),
        object: value,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(namespace: &str) -> WatchSpec {
        WatchSpec {
            group: String::new(),
            version: "v1".into(),
            kind: "Pod".into(),
            resource: "pods".into(),
            namespace: namespace.into(),
        }
    }

    #[test]
    fn empty_namespace_means_all() {
        let specs = [spec("")];
        let filter = NamespaceFilter::from_specs(specs.iter());
        assert!(filter.allows(Some("default")));
        assert!(filter.allows(Some("kube-system")));
    }

    #[test]
    fn named_namespaces_filter() {
        let specs = [spec("prod"), spec("staging")];
        let filter = NamespaceFilter::from_specs(specs.iter());
        assert!(filter.allows(Some("prod")));
        assert!(filter.allows(Some("staging")));
        assert!(!filter.allows(Some("dev")));
    }

    #[test]
    fn cluster_scoped_always_passes() {
        let specs = [spec("prod")];
        let filter = NamespaceFilter::from_specs(specs.iter());
        assert!(filter.allows(None));
    }
}
