//! kube-tagger kubehub – cluster session, volume lookup and claim watcher wiring

#![forbid(unsafe_code)]

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{
        reflector,
        reflector::Store,
        watcher,
        watcher::Event,
        WatchStreamExt,
    },
    Client,
};
use metrics::counter;
use tagger_core::{ConfigError, Notification, NotificationKind, ResolveError, VolumeLookup, WatchedObject};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

type SendError = mpsc::error::SendError<Notification>;

fn kube_config_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> ConfigError {
    ConfigError::KubeConfig(Box::new(e))
}

/// Build a client from an explicit kubeconfig path, or infer one. Inference
/// reads the local kubeconfig (`$KUBECONFIG` or `~/.kube/config`) first and
/// falls back to the in-cluster service account when none is found.
pub async fn connect(kube_config: Option<&Path>) -> Result<Client, ConfigError> {
    let config = match kube_config {
        Some(path) => {
            debug!(path = %path.display(), "using kubeconfig provided on the command line");
            let kc = Kubeconfig::read_from(path).map_err(kube_config_error)?;
            kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .map_err(kube_config_error)?
        }
        None => {
            debug!("no kubeconfig given; inferring from local kubeconfig, then in-cluster environment");
            kube::Config::infer().await.map_err(kube_config_error)?
        }
    };
    Client::try_from(config).map_err(kube_config_error)
}

/// Project a claim into the transport-independent view the handler works on.
pub fn project(pvc: &PersistentVolumeClaim) -> WatchedObject {
    WatchedObject {
        name: pvc.metadata.name.clone().unwrap_or_default(),
        namespace: pvc.metadata.namespace.clone(),
        annotations: pvc.metadata.annotations.clone().unwrap_or_default(),
        volume_name: pvc.spec.as_ref().and_then(|s| s.volume_name.clone()),
    }
}

/// URI of the in-tree EBS source, if the volume has one.
pub fn ebs_uri(pv: &PersistentVolume) -> Option<&str> {
    pv.spec
        .as_ref()?
        .aws_elastic_block_store
        .as_ref()
        .map(|src| src.volume_id.as_str())
}

/// [`VolumeLookup`] backed by the cluster's PersistentVolume API.
#[derive(Clone)]
pub struct PvLookup {
    api: Api<PersistentVolume>,
}

impl PvLookup {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait::async_trait]
impl VolumeLookup for PvLookup {
    async fn backend_uri(&self, volume_name: &str) -> Result<String, ResolveError> {
        let pv = self.api.get(volume_name).await.map_err(|e| ResolveError::Lookup {
            volume: volume_name.to_string(),
            source: Box::new(e),
        })?;
        ebs_uri(&pv)
            .map(str::to_string)
            .ok_or_else(|| ResolveError::NotEbsVolume { volume: volume_name.to_string() })
    }
}

fn notification(pvc: &PersistentVolumeClaim, kind: NotificationKind) -> Notification {
    Notification { kind, object: project(pvc) }
}

async fn forward_event(ev: Event<PersistentVolumeClaim>, tx: &mpsc::Sender<Notification>) -> Result<(), SendError> {
    match ev {
        Event::Applied(pvc) => tx.send(notification(&pvc, NotificationKind::Applied)).await?,
        Event::Deleted(pvc) => {
            debug!(pvc = ?pvc.metadata.name, ns = ?pvc.metadata.namespace, "claim deleted; volume tags are left as-is");
        }
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            for pvc in &list {
                tx.send(notification(pvc, NotificationKind::Applied)).await?;
            }
        }
    }
    Ok(())
}

/// Redeliver every claim currently known to the store. Returns how many were sent.
pub async fn resync_all(store: &Store<PersistentVolumeClaim>, tx: &mpsc::Sender<Notification>) -> Result<usize, SendError> {
    let state = store.state();
    for pvc in &state {
        tx.send(notification(pvc, NotificationKind::Resync)).await?;
    }
    counter!("tagger_resync_total", 1u64);
    debug!(count = state.len(), "resync delivered");
    Ok(state.len())
}

/// List+watch claims across all namespaces and feed notifications into `tx`,
/// redelivering the full known set every `resync`. Returns when the stream
/// ends or the receiving side is dropped.
pub async fn start_watcher(client: Client, resync: Duration, tx: mpsc::Sender<Notification>) {
    let api: Api<PersistentVolumeClaim> = Api::all(client);
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher::Config::default()).default_backoff());
    futures::pin_mut!(stream);

    let mut ticker = tokio::time::interval_at(Instant::now() + resync, resync);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(resync_secs = resync.as_secs(), "claim watcher started");

    loop {
        tokio::select! {
            ev = stream.next() => match ev {
                Some(Ok(ev)) => {
                    if forward_event(ev, &tx).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    counter!("tagger_watch_errors_total", 1u64);
                    warn!(error = %e, "claim watch error; retrying with backoff");
                }
                None => {
                    warn!("watcher stream ended");
                    return;
                }
            },
            _ = ticker.tick() => {
                if resync_all(&reader, &tx).await.is_err() {
                    break;
                }
            }
        }
    }
    info!("notification receiver closed; watcher stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pvc(name: &str, ns: &str, annotations: serde_json::Value, volume: Option<&str>) -> PersistentVolumeClaim {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": { "name": name, "namespace": ns, "uid": format!("uid-{name}"), "annotations": annotations },
            "spec": { "volumeName": volume }
        }))
        .unwrap()
    }

    #[test]
    fn project_copies_identity_annotations_and_binding() {
        let o = project(&pvc(
            "data",
            "db",
            json!({ "volume.beta.kubernetes.io/storage-provisioner": "kubernetes.io/aws-ebs" }),
            Some("pv-1"),
        ));
        assert_eq!(o.name, "data");
        assert_eq!(o.namespace.as_deref(), Some("db"));
        assert_eq!(o.volume_name.as_deref(), Some("pv-1"));
        assert!(o.is_ebs_provisioned());
    }

    #[test]
    fn project_tolerates_missing_fields() {
        let o = project(&PersistentVolumeClaim::default());
        assert_eq!(o, WatchedObject::default());
    }

    #[test]
    fn ebs_uri_reads_in_tree_source_only() {
        let ebs: PersistentVolume = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "PersistentVolume",
            "metadata": { "name": "test-vol" },
            "spec": { "awsElasticBlockStore": { "volumeID": "aws://eu-central-1c/vol-06c8c738cdfc1703c" } }
        }))
        .unwrap();
        assert_eq!(ebs_uri(&ebs), Some("aws://eu-central-1c/vol-06c8c738cdfc1703c"));

        let nfs: PersistentVolume = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "PersistentVolume",
            "metadata": { "name": "nfs-vol" },
            "spec": { "nfs": { "server": "10.0.0.1", "path": "/export" } }
        }))
        .unwrap();
        assert_eq!(ebs_uri(&nfs), None);
        assert_eq!(ebs_uri(&PersistentVolume::default()), None);
    }

    #[tokio::test]
    async fn connect_reports_unreadable_kubeconfig() {
        let path = std::env::temp_dir().join("kube-tagger-no-such-kubeconfig.yaml");
        let err = connect(Some(&path)).await.unwrap_err();
        assert!(matches!(err, ConfigError::KubeConfig(_)), "err={err}");
    }

    #[tokio::test]
    async fn restarted_list_is_forwarded_as_applied_and_deletes_are_ignored() {
        let (tx, mut rx) = mpsc::channel(8);
        let list = vec![pvc("a", "ns", json!({}), None), pvc("b", "ns", json!({}), None)];
        forward_event(Event::Restarted(list), &tx).await.unwrap();
        forward_event(Event::Deleted(pvc("a", "ns", json!({}), None)), &tx).await.unwrap();
        forward_event(Event::Applied(pvc("c", "ns", json!({}), None)), &tx).await.unwrap();
        drop(tx);

        let mut got = Vec::new();
        while let Some(n) = rx.recv().await {
            assert_eq!(n.kind, NotificationKind::Applied);
            got.push(n.object.name);
        }
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn resync_redelivers_every_known_claim() {
        let (reader, mut writer) = reflector::store::<PersistentVolumeClaim>();
        writer.apply_watcher_event(&Event::Restarted(vec![
            pvc("a", "ns1", json!({}), Some("pv-a")),
            pvc("b", "ns2", json!({}), Some("pv-b")),
        ]));

        let (tx, mut rx) = mpsc::channel(8);
        assert_eq!(resync_all(&reader, &tx).await.unwrap(), 2);
        // unchanged objects are redelivered on every tick
        assert_eq!(resync_all(&reader, &tx).await.unwrap(), 2);
        drop(tx);

        let mut names = Vec::new();
        while let Some(n) = rx.recv().await {
            assert_eq!(n.kind, NotificationKind::Resync);
            names.push(n.object.key());
        }
        names.sort();
        assert_eq!(names, vec!["ns1/a", "ns1/a", "ns2/b", "ns2/b"]);
    }

    #[tokio::test]
    async fn resync_stops_when_receiver_is_gone() {
        let (reader, mut writer) = reflector::store::<PersistentVolumeClaim>();
        writer.apply_watcher_event(&Event::Restarted(vec![pvc("a", "ns", json!({}), None)]));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(resync_all(&reader, &tx).await.is_err());
    }
}
