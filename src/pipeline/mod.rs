//! The annotation pipeline: selection → batching → dispatch → reassembly,
//! plus the reconciliation sessions that keep re-running it as the
//! document changes. Shared state (cache, rate bucket, in-flight set) is
//! explicit and injected, created with the [`Annotator`] and torn down
//! with it.

pub mod batch;
pub mod cache;
pub mod dispatch;
pub mod ratelimit;
pub mod remote;
pub mod session;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::dom::apply::{apply_annotated, ApplyStats};
use crate::dom::select::{eligible, ExclusionPolicy, Fragment};
use crate::dom::{NodeId, TreeAdapter};
use crate::error::PipelineError;
use crate::pipeline::batch::build_batches;
use crate::pipeline::cache::{cache_key, CacheBackend, CacheStore, DEFINITION_TTL, PAGE_TTL};
use crate::pipeline::dispatch::Dispatcher;
use crate::pipeline::ratelimit::{RateLimiter, RATE_CEILING_CHARS, RATE_WINDOW};
use crate::pipeline::remote::{AnnotateOptions, AnnotateService, DefinitionEntry};
use crate::pipeline::session::{ChangeEvent, InFlightSet, SessionHandle, WatchSource};

const LOG_TARGET: &str = "rubimark::pipeline";

pub struct PipelineSettings {
    pub policy: ExclusionPolicy,
    pub opts: AnnotateOptions,
    /// Soft flush trigger for batch building.
    pub char_ceiling: usize,
    /// Pause between consecutive batches of one pass, to avoid bursting
    /// the remote service.
    pub batch_delay: Duration,
    pub rate_window: Duration,
    pub rate_ceiling: usize,
    pub page_ttl: Duration,
    pub definition_ttl: Duration,
    /// Durable page-cache backend; in-memory when absent.
    pub cache_backend: Option<Box<dyn CacheBackend>>,
    pub session_debounce: SessionDebounce,
}

/// Per-source debounce overrides; an unset source keeps its built-in delay.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionDebounce {
    pub mutation: Option<Duration>,
    pub viewport: Option<Duration>,
    pub caption: Option<Duration>,
}

impl SessionDebounce {
    pub fn for_source(&self, source: WatchSource) -> Duration {
        let configured = match source {
            WatchSource::Mutation => self.mutation,
            WatchSource::Viewport => self.viewport,
            WatchSource::Caption => self.caption,
        };
        configured.unwrap_or_else(|| source.default_debounce())
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            policy: ExclusionPolicy::default(),
            opts: AnnotateOptions::default(),
            char_ceiling: 4_000,
            batch_delay: Duration::from_millis(500),
            rate_window: RATE_WINDOW,
            rate_ceiling: RATE_CEILING_CHARS,
            page_ttl: PAGE_TTL,
            definition_ttl: DEFINITION_TTL,
            cache_backend: None,
            session_debounce: SessionDebounce::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassStats {
    pub fragments: usize,
    pub batches: usize,
    pub replaced: usize,
    pub skipped_missing: usize,
    pub skipped_stale: usize,
}

impl PassStats {
    fn absorb(&mut self, applied: ApplyStats) {
        self.replaced += applied.replaced;
        self.skipped_missing += applied.skipped_missing;
        self.skipped_stale += applied.skipped_stale;
    }
}

/// Process-scoped pipeline state: the tree, the remote service, the shared
/// cache/rate/in-flight singletons and the active options. All tree
/// mutation funnels through here (via the reassembler); sessions get only
/// an `Arc` of this.
pub struct Annotator<A: TreeAdapter, S: AnnotateService> {
    tree: Arc<Mutex<A>>,
    service: Arc<S>,
    page_cache: Arc<Mutex<CacheStore>>,
    definition_cache: Arc<Mutex<CacheStore>>,
    limiter: Arc<Mutex<RateLimiter>>,
    in_flight: Arc<InFlightSet>,
    policy: ExclusionPolicy,
    opts: AnnotateOptions,
    char_ceiling: usize,
    batch_delay: Duration,
    session_debounce: SessionDebounce,
    session_flags: Mutex<Vec<Arc<AtomicBool>>>,
}

impl<A, S> Annotator<A, S>
where
    A: TreeAdapter,
    S: AnnotateService + 'static,
{
    pub fn new(tree: A, service: S, settings: PipelineSettings) -> Self {
        let backend = settings
            .cache_backend
            .unwrap_or_else(|| Box::new(cache::MemoryBackend::default()));
        Self {
            tree: Arc::new(Mutex::new(tree)),
            service: Arc::new(service),
            page_cache: Arc::new(Mutex::new(CacheStore::new(backend, settings.page_ttl))),
            definition_cache: Arc::new(Mutex::new(CacheStore::in_memory(
                settings.definition_ttl,
            ))),
            limiter: Arc::new(Mutex::new(RateLimiter::new(
                settings.rate_window,
                settings.rate_ceiling,
            ))),
            in_flight: Arc::new(InFlightSet::new()),
            policy: settings.policy,
            opts: settings.opts,
            char_ceiling: settings.char_ceiling,
            batch_delay: settings.batch_delay,
            session_debounce: settings.session_debounce,
            session_flags: Mutex::new(Vec::new()),
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn options(&self) -> &AnnotateOptions {
        &self.opts
    }

    pub fn in_flight(&self) -> &InFlightSet {
        &self.in_flight
    }

    pub fn with_tree<R>(&self, f: impl FnOnce(&A) -> R) -> R {
        let tree = self.tree.lock().expect("tree lock");
        f(&tree)
    }

    fn dispatcher(&self) -> Dispatcher<S> {
        Dispatcher::new(
            self.service.clone(),
            self.page_cache.clone(),
            self.limiter.clone(),
        )
    }

    /// Initial full pass over the whole tree. Batches run sequentially
    /// with a fixed delay between them; a failed batch does not stop the
    /// ones after it, and the first failure is surfaced once at the end.
    pub async fn run_full_pass(&self) -> Result<PassStats, PipelineError> {
        let root = self.with_tree(|t| t.root());
        let result = self.annotate_region(root).await;
        match &result {
            Ok(stats) => log::info!(
                target: LOG_TARGET,
                "full pass: {} fragments in {} batches, {} replaced",
                stats.fragments,
                stats.batches,
                stats.replaced
            ),
            Err(err) => log::warn!(target: LOG_TARGET, "full pass failed: {err}"),
        }
        result
    }

    /// Annotate every eligible fragment under `region` that no other
    /// session currently owns.
    pub async fn annotate_region(&self, region: NodeId) -> Result<PassStats, PipelineError> {
        let candidates: Vec<Fragment> = {
            let tree = self.tree.lock().expect("tree lock");
            eligible(&*tree, &self.policy, region).collect()
        };

        // Atomic check-and-insert per fragment; losers belong to another
        // session and are left alone.
        let fragments: Vec<Fragment> = candidates
            .into_iter()
            .filter(|f| self.in_flight.try_acquire(f.handle.id))
            .collect();
        let acquired: Vec<NodeId> = fragments.iter().map(|f| f.handle.id).collect();

        let mut stats = PassStats {
            fragments: fragments.len(),
            ..Default::default()
        };
        let batches = build_batches(fragments.into_iter(), self.char_ceiling);
        stats.batches = batches.len();

        let dispatcher = self.dispatcher();
        let mut first_error: Option<PipelineError> = None;
        for (i, batch) in batches.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.batch_delay).await;
            }
            match dispatcher.dispatch(batch, &self.opts).await {
                Ok(payload) => {
                    let mut tree = self.tree.lock().expect("tree lock");
                    stats.absorb(apply_annotated(&mut *tree, batch, &payload));
                }
                Err(err) => {
                    log::warn!(
                        target: LOG_TARGET,
                        "batch {}/{} failed: {err}",
                        i + 1,
                        batches.len()
                    );
                    first_error.get_or_insert(err);
                }
            }
        }

        for id in acquired {
            self.in_flight.release(id);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }

    /// Start a reconciliation session for one observation surface, using
    /// the configured debounce for that source. The returned sender is the
    /// surface: push a [`ChangeEvent`] whenever a region becomes newly
    /// relevant.
    pub fn spawn_session(
        self: &Arc<Self>,
        source: WatchSource,
    ) -> (SessionHandle, mpsc::UnboundedSender<ChangeEvent>) {
        self.spawn_session_with_debounce(source, self.session_debounce.for_source(source))
    }

    pub fn spawn_session_with_debounce(
        self: &Arc<Self>,
        source: WatchSource,
        debounce: Duration,
    ) -> (SessionHandle, mpsc::UnboundedSender<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = session::spawn(self.clone(), source, debounce, rx);
        self.session_flags
            .lock()
            .expect("session registry lock")
            .push(handle.shared_flag());
        (handle, tx)
    }

    /// Tear down annotation: stop every session and restore every replaced
    /// position to its retained original text.
    pub fn clear(&self) {
        for flag in self
            .session_flags
            .lock()
            .expect("session registry lock")
            .drain(..)
        {
            flag.store(true, Ordering::Release);
        }
        self.tree.lock().expect("tree lock").clear_annotations();
    }

    /// Dictionary lookup for a single term, cached for five minutes.
    pub async fn lookup_definition(
        &self,
        term: &str,
    ) -> Result<Vec<DefinitionEntry>, PipelineError> {
        let key = cache_key(term.trim(), ":def");
        {
            let mut cache = self.definition_cache.lock().expect("definition cache lock");
            if let Some(json) = cache.get(&key) {
                if let Ok(entries) = serde_json::from_str::<Vec<DefinitionEntry>>(&json) {
                    return Ok(entries);
                }
            }
        }
        let entries = self.service.define(term).await?;
        if entries.is_empty() {
            return Err(PipelineError::MalformedResponse(
                "definition response carried no entries".into(),
            ));
        }
        if let Ok(json) = serde_json::to_string(&entries) {
            self.definition_cache
                .lock()
                .expect("definition cache lock")
                .set(&key, json);
        }
        Ok(entries)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Mock remote service for pipeline tests: wraps every marker segment
    //! in ruby markup with a `よみ` reading and counts calls.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::PipelineError;
    use crate::markers::{frag_token, ANY_MARKER_RE};
    use crate::pipeline::remote::{
        AnnotateOptions, AnnotateService, DefinitionEntry, DefinitionSense,
    };

    #[derive(Default)]
    pub(crate) struct MockService {
        calls: AtomicUsize,
        define_calls: AtomicUsize,
        payloads: Mutex<Vec<String>>,
        fail: bool,
        drop_first: bool,
        dup_first: bool,
    }

    impl MockService {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        pub(crate) fn dropping_first_marker(mut self) -> Self {
            self.drop_first = true;
            self
        }

        pub(crate) fn duplicating_first_marker(mut self) -> Self {
            self.dup_first = true;
            self
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn define_calls(&self) -> usize {
            self.define_calls.load(Ordering::SeqCst)
        }

        /// The most recent payload received by `annotate`.
        pub(crate) fn last_payload(&self) -> Option<String> {
            self.payloads.lock().expect("payload log lock").last().cloned()
        }
    }

    #[async_trait]
    impl AnnotateService for MockService {
        async fn annotate(
            &self,
            payload: &str,
            _opts: &AnnotateOptions,
        ) -> Result<String, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.payloads
                .lock()
                .expect("payload log lock")
                .push(payload.to_string());
            if self.fail {
                return Err(PipelineError::Transport("mock transport failure".into()));
            }

            let marks: Vec<(u64, usize, usize)> = ANY_MARKER_RE
                .captures_iter(payload)
                .map(|caps| {
                    let whole = caps.get(0).unwrap();
                    (caps[1].parse().unwrap(), whole.start(), whole.end())
                })
                .collect();

            let mut out = String::new();
            for (i, &(id, _, end)) in marks.iter().enumerate() {
                let seg_end = marks
                    .get(i + 1)
                    .map(|&(_, next_start, _)| next_start)
                    .unwrap_or(payload.len());
                let text = payload[end..seg_end].trim();
                if i == 0 && self.drop_first {
                    continue;
                }
                let annotated = format!("<ruby>{text}<rt>{text}よみ</rt></ruby>");
                out.push_str(&frag_token(id));
                out.push_str(&annotated);
                if i == 0 && self.dup_first {
                    out.push_str(&frag_token(id));
                    out.push_str(&annotated);
                }
            }
            Ok(out)
        }

        async fn define(&self, term: &str) -> Result<Vec<DefinitionEntry>, PipelineError> {
            self.define_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PipelineError::Transport("mock transport failure".into()));
            }
            Ok(vec![DefinitionEntry {
                term: term.to_string(),
                reading: format!("{term}よみ"),
                senses: vec![DefinitionSense {
                    gloss: "mock gloss".to_string(),
                    pos: "noun".to_string(),
                }],
            }])
        }
    }
}
