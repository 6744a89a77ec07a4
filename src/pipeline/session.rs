//! Reconciliation sessions: one independent watcher per observation
//! surface (subtree mutations, viewport visibility, caption regions). Each
//! session debounces its event bursts, re-runs the selector over the
//! changed regions and drives the regular batch → dispatch → reassemble
//! path. Sessions never call each other; the shared in-flight set is the
//! only synchronization point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dom::{NodeId, TreeAdapter};
use crate::pipeline::remote::AnnotateService;
use crate::pipeline::Annotator;

const LOG_TARGET: &str = "rubimark::session";

/// Fragments submitted but not yet reassembled, shared across every session
/// and the initial pass. Check-and-insert is atomic, so two sessions can
/// never both dispatch the same fragment.
#[derive(Default)]
pub struct InFlightSet {
    nodes: DashSet<NodeId>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the caller now owns the fragment.
    pub fn try_acquire(&self, id: NodeId) -> bool {
        self.nodes.insert(id)
    }

    /// Release on completion or failure so a later pass may retry.
    pub fn release(&self, id: NodeId) {
        self.nodes.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchSource {
    Mutation,
    Viewport,
    Caption,
}

impl WatchSource {
    pub fn name(&self) -> &'static str {
        match self {
            WatchSource::Mutation => "mutation",
            WatchSource::Viewport => "viewport",
            WatchSource::Caption => "caption",
        }
    }

    /// Noisier surfaces get longer debounce windows.
    pub fn default_debounce(&self) -> Duration {
        match self {
            WatchSource::Viewport => Duration::from_millis(150),
            WatchSource::Mutation => Duration::from_millis(300),
            WatchSource::Caption => Duration::from_millis(700),
        }
    }
}

/// One observation: a region of the tree became newly relevant.
#[derive(Clone, Copy, Debug)]
pub struct ChangeEvent {
    pub region: NodeId,
}

pub struct SessionHandle {
    source: WatchSource,
    stopped: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn source(&self) -> WatchSource {
        self.source
    }

    /// Prevent any new work. An already-running pass (including in-flight
    /// network calls) completes and applies if its handles are still valid.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// The same stop flag the running task polls, for bulk teardown.
    pub(crate) fn shared_flag(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }
}

pub(crate) fn spawn<A, S>(
    annotator: Arc<Annotator<A, S>>,
    source: WatchSource,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<ChangeEvent>,
) -> SessionHandle
where
    A: TreeAdapter,
    S: AnnotateService + 'static,
{
    let stopped = Arc::new(AtomicBool::new(false));
    let flag = stopped.clone();

    let task = tokio::spawn(async move {
        loop {
            let Some(first) = rx.recv().await else { break };
            if flag.load(Ordering::Acquire) {
                break;
            }

            // Absorb the burst: the pass starts only after the surface has
            // been quiet for the debounce window.
            let mut regions = vec![first.region];
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(debounce) => break,
                    ev = rx.recv() => match ev {
                        Some(ev) => regions.push(ev.region),
                        None => break,
                    },
                }
            }
            if flag.load(Ordering::Acquire) {
                break;
            }

            regions.sort_unstable();
            regions.dedup();
            for region in regions {
                match annotator.annotate_region(region).await {
                    Ok(stats) => log::debug!(
                        target: LOG_TARGET,
                        "{} pass over node {}: {} replaced, {} stale, {} missing",
                        source.name(),
                        region,
                        stats.replaced,
                        stats.skipped_stale,
                        stats.skipped_missing
                    ),
                    // Background failures are logged, never surfaced.
                    Err(err) => log::warn!(
                        target: LOG_TARGET,
                        "{} pass over node {} failed: {}",
                        source.name(),
                        region,
                        err
                    ),
                }
            }
        }
        log::debug!(target: LOG_TARGET, "{} session stopped", source.name());
    });

    SessionHandle {
        source,
        stopped,
        task,
    }
}
