//! kube-tagger apply: per-notification pipeline from a watched claim to a
//! tagging call on its backend volume.
//!
//! Every step failure is local to the notification being handled. Nothing here
//! returns an error to the caller; recovery comes from the next resync
//! redelivering the same claim.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;

use metrics::counter;
use tagger_core::{
    extract_tags, filter_blacklisted, merge_tags, EbsVolumeUri, Notification, NotificationKind, ResolveError,
    TagApplier, TagSet, VolumeId, VolumeLookup, WatchedObject,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What happened to a single notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Not provisioned by the supported backend.
    Skipped,
    /// The backend volume id could not be resolved.
    Unresolved,
    /// Every tag was blacklisted or none were configured.
    NothingToApply { volume_id: VolumeId },
    Applied { volume_id: VolumeId, tags: TagSet },
    /// The backend rejected the call; left for the next resync.
    ApplyFailed { volume_id: VolumeId },
}

/// Why [`EventHandler::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    /// Every sender was dropped, i.e. the watcher went away.
    ChannelClosed,
}

pub struct EventHandler {
    lookup: Arc<dyn VolumeLookup>,
    applier: Arc<dyn TagApplier>,
    defaults: TagSet,
}

fn kind_label(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::Applied => "applied",
        NotificationKind::Resync => "resync",
    }
}

impl EventHandler {
    pub fn new(lookup: Arc<dyn VolumeLookup>, applier: Arc<dyn TagApplier>, defaults: TagSet) -> Self {
        Self { lookup, applier, defaults }
    }

    /// Volume id of the claim's bound volume.
    pub async fn resolve(&self, obj: &WatchedObject) -> Result<VolumeId, ResolveError> {
        let volume = obj
            .volume_name
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or(ResolveError::MissingVolumeName)?;
        let uri = self.lookup.backend_uri(volume).await?;
        Ok(EbsVolumeUri::parse(&uri)?.volume_id)
    }

    /// Tags to dispatch for `obj`: defaults, overridden by the claim's own
    /// annotation, minus blacklisted keys.
    pub fn desired_tags(&self, obj: &WatchedObject) -> TagSet {
        let custom = extract_tags(obj);
        let merged = merge_tags(&self.defaults, custom.as_ref());
        let (filtered, dropped) = filter_blacklisted(merged);
        if !dropped.is_empty() {
            counter!("tagger_tags_blacklisted_total", dropped.len() as u64);
        }
        filtered
    }

    pub async fn handle(&self, n: &Notification) -> Outcome {
        counter!("tagger_events_total", 1u64, "kind" => kind_label(n.kind));
        self.handle_object(&n.object).await
    }

    pub async fn handle_object(&self, obj: &WatchedObject) -> Outcome {
        let pvc = obj.key();
        debug!(pvc = %pvc, "received event for claim");

        if !obj.is_ebs_provisioned() {
            counter!("tagger_events_skipped_total", 1u64);
            debug!(pvc = %pvc, "claim is not an ebs volume, stop handling");
            return Outcome::Skipped;
        }

        let volume_id = match self.resolve(obj).await {
            Ok(id) => id,
            Err(e) => {
                counter!("tagger_resolve_failures_total", 1u64);
                error!(pvc = %pvc, error = %e, "failed to resolve ebs volume for claim");
                return Outcome::Unresolved;
            }
        };
        debug!(pvc = %pvc, volume_id = %volume_id, "resolved volume id");

        let tags = self.desired_tags(obj);
        if tags.is_empty() {
            debug!(pvc = %pvc, volume_id = %volume_id, "no tags to apply");
            return Outcome::NothingToApply { volume_id };
        }

        counter!("tagger_apply_total", 1u64, "backend" => self.applier.backend());
        match self.applier.create_tags(&volume_id, &tags).await {
            Ok(()) => {
                info!(pvc = %pvc, volume_id = %volume_id, count = tags.len(), "tags applied");
                Outcome::Applied { volume_id, tags }
            }
            Err(e) => {
                counter!("tagger_apply_failures_total", 1u64, "backend" => self.applier.backend());
                error!(pvc = %pvc, volume_id = %volume_id, error = %e, "failed to add tags to volume");
                Outcome::ApplyFailed { volume_id }
            }
        }
    }

    /// Consume notifications one at a time, in channel order, until the
    /// channel closes or `shutdown` resolves. A notification already being
    /// handled is finished before shutdown is observed. Returns how many
    /// notifications were handled and why the loop stopped.
    pub async fn run<F>(&self, mut rx: mpsc::Receiver<Notification>, shutdown: F) -> (u64, StopReason)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut handled = 0u64;
        let reason = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested; stopping event loop");
                    break StopReason::Shutdown;
                }
                maybe = rx.recv() => match maybe {
                    Some(n) => {
                        self.handle(&n).await;
                        handled += 1;
                    }
                    None => {
                        warn!("notification channel closed; exiting event loop");
                        break StopReason::ChannelClosed;
                    }
                }
            }
        };
        (handled, reason)
    }
}
