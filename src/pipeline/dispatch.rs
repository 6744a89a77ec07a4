//! Dispatch: resolve a batch against the cache, send only the misses
//! through the rate limiter to the remote service, and merge hits and
//! fresh results back into one marker-ordered payload. The outbound
//! sub-request is atomic: it either annotates every miss it covers or
//! fails as a whole.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::PipelineError;
use crate::markers;
use crate::pipeline::batch::Batch;
use crate::pipeline::cache::{cache_key, CacheStore};
use crate::pipeline::ratelimit::RateLimiter;
use crate::pipeline::remote::{AnnotateOptions, AnnotateService};
use crate::textutil::{char_count, split_surrounding_whitespace};

const LOG_TARGET: &str = "rubimark::dispatch";

enum Resolution {
    /// Nothing to annotate (empty after trim); text passes through.
    Passthrough,
    Hit(String),
    Miss,
}

pub struct Dispatcher<S: AnnotateService> {
    service: Arc<S>,
    cache: Arc<Mutex<CacheStore>>,
    limiter: Arc<Mutex<RateLimiter>>,
}

impl<S: AnnotateService> Dispatcher<S> {
    pub fn new(
        service: Arc<S>,
        cache: Arc<Mutex<CacheStore>>,
        limiter: Arc<Mutex<RateLimiter>>,
    ) -> Self {
        Self {
            service,
            cache,
            limiter,
        }
    }

    /// Annotate one batch, returning a payload with the input's marker
    /// structure: each surviving marker followed by that fragment's
    /// annotated HTML (fragment whitespace re-applied). A marker the
    /// service dropped is omitted so reassembly skips that fragment.
    pub async fn dispatch(
        &self,
        batch: &Batch,
        opts: &AnnotateOptions,
    ) -> Result<String, PipelineError> {
        let suffix = opts.cache_suffix();

        let mut resolutions: Vec<Resolution> = Vec::with_capacity(batch.len());
        {
            let mut cache = self.cache.lock().expect("cache lock");
            for (_, fragment) in batch.entries() {
                let (_, core, _) = split_surrounding_whitespace(&fragment.text);
                if core.is_empty() {
                    resolutions.push(Resolution::Passthrough);
                    continue;
                }
                match cache.get(&cache_key(core, &suffix)) {
                    Some(html) => resolutions.push(Resolution::Hit(html)),
                    None => resolutions.push(Resolution::Miss),
                }
            }
        }

        let miss_entries: Vec<(u64, &crate::dom::select::Fragment)> = batch
            .entries()
            .zip(resolutions.iter())
            .filter(|(_, r)| matches!(r, Resolution::Miss))
            .map(|(e, _)| e)
            .collect();

        let mut fresh: HashMap<u64, String> = HashMap::new();
        if miss_entries.is_empty() {
            log::debug!(target: LOG_TARGET, "batch fully cached, skipping network");
        } else {
            let miss_chars: usize = miss_entries
                .iter()
                .map(|(_, f)| char_count(split_surrounding_whitespace(&f.text).1))
                .sum();
            {
                let mut limiter = self.limiter.lock().expect("limiter lock");
                if !limiter.try_admit(miss_chars) {
                    return Err(PipelineError::RateLimited {
                        requested: miss_chars,
                        available: limiter.remaining(),
                    });
                }
            }

            let miss_ids: Vec<u64> = miss_entries.iter().map(|&(id, _)| id).collect();
            // The sub-payload carries trimmed cores, so the admission above
            // counted exactly the characters sent. Whitespace is re-applied
            // per fragment in the merge below.
            let sub_payload = markers::join_payload(
                miss_entries
                    .iter()
                    .map(|&(id, f)| (id, split_surrounding_whitespace(&f.text).1)),
            );
            let raw = self.service.annotate(&sub_payload, opts).await?;
            fresh = markers::parse_annotated_output(&raw, &miss_ids)
                .map_err(|e| PipelineError::MalformedResponse(e.to_string()))?;

            let mut cache = self.cache.lock().expect("cache lock");
            for &(id, fragment) in &miss_entries {
                let Some(html) = fresh.get(&id) else {
                    log::debug!(
                        target: LOG_TARGET,
                        "service dropped marker {}, fragment left unannotated",
                        markers::frag_token(id)
                    );
                    continue;
                };
                let (_, core, _) = split_surrounding_whitespace(&fragment.text);
                cache.set(&cache_key(core, &suffix), html.clone());
            }
        }

        let mut out = String::new();
        for ((id, fragment), resolution) in batch.entries().zip(resolutions.iter()) {
            let annotated = match resolution {
                Resolution::Passthrough => {
                    out.push_str(&markers::frag_token(id));
                    out.push_str(&fragment.text);
                    continue;
                }
                Resolution::Hit(html) => html,
                Resolution::Miss => match fresh.get(&id) {
                    Some(html) => html,
                    // Dropped by the service: omit the marker entirely.
                    None => continue,
                },
            };
            let (lead, _, trail) = split_surrounding_whitespace(&fragment.text);
            out.push_str(&markers::frag_token(id));
            out.push_str(lead);
            out.push_str(annotated);
            out.push_str(trail);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::select::Fragment;
    use crate::dom::NodeHandle;
    use crate::markers::frag_token;
    use crate::pipeline::batch::build_batches;
    use crate::pipeline::cache::CacheStore;
    use crate::pipeline::testing::MockService;
    use std::time::Duration;

    fn frag(text: &str) -> Fragment {
        Fragment {
            handle: NodeHandle { id: 0, revision: 0 },
            text: text.to_string(),
        }
    }

    fn fixture(service: MockService) -> (Dispatcher<MockService>, Arc<MockService>) {
        let service = Arc::new(service);
        let cache = Arc::new(Mutex::new(CacheStore::in_memory(Duration::from_secs(3600))));
        let limiter = Arc::new(Mutex::new(RateLimiter::default()));
        (
            Dispatcher::new(service.clone(), cache, limiter),
            service,
        )
    }

    #[tokio::test]
    async fn three_fragments_one_outbound_call_in_order() {
        let (dispatcher, service) = fixture(MockService::new());
        let batch = build_batches(
            vec![frag("猫"), frag("犬"), frag("鳥")].into_iter(),
            10_000,
        )
        .remove(0);

        let payload = dispatcher
            .dispatch(&batch, &AnnotateOptions::default())
            .await
            .unwrap();

        assert_eq!(service.calls(), 1);
        let ids = batch.marker_ids();
        let segs = markers::split_payload(&payload, ids);
        assert_eq!(segs[&ids[0]], "<ruby>猫<rt>猫よみ</rt></ruby>");
        assert_eq!(segs[&ids[1]], "<ruby>犬<rt>犬よみ</rt></ruby>");
        assert_eq!(segs[&ids[2]], "<ruby>鳥<rt>鳥よみ</rt></ruby>");
        // Marker order preserved.
        let p0 = payload.find(&frag_token(ids[0])).unwrap();
        let p2 = payload.find(&frag_token(ids[2])).unwrap();
        assert!(p0 < p2);
    }

    #[tokio::test]
    async fn cache_hit_skips_network_and_is_byte_identical() {
        let (dispatcher, service) = fixture(MockService::new());
        let opts = AnnotateOptions::default();

        let first_batch = build_batches(vec![frag("猫")].into_iter(), 10_000).remove(0);
        let first = dispatcher.dispatch(&first_batch, &opts).await.unwrap();
        assert_eq!(service.calls(), 1);

        // Same text, new fragment/markers: second run is served from cache.
        let second_batch = build_batches(vec![frag("猫")].into_iter(), 10_000).remove(0);
        let second = dispatcher.dispatch(&second_batch, &opts).await.unwrap();
        assert_eq!(service.calls(), 1);

        let a = markers::split_payload(&first, first_batch.marker_ids());
        let b = markers::split_payload(&second, second_batch.marker_ids());
        assert_eq!(
            a[&first_batch.marker_ids()[0]],
            b[&second_batch.marker_ids()[0]]
        );
    }

    #[tokio::test]
    async fn display_level_change_reuses_cache_but_script_change_does_not() {
        let (dispatcher, service) = fixture(MockService::new());
        let batch = build_batches(vec![frag("猫")].into_iter(), 10_000).remove(0);
        let mut opts = AnnotateOptions::default();
        dispatcher.dispatch(&batch, &opts).await.unwrap();
        assert_eq!(service.calls(), 1);

        opts.display_min_level = 4;
        let batch2 = build_batches(vec![frag("猫")].into_iter(), 10_000).remove(0);
        dispatcher.dispatch(&batch2, &opts).await.unwrap();
        assert_eq!(service.calls(), 1);

        opts.script = crate::pipeline::remote::ReadingScript::Romaji;
        let batch3 = build_batches(vec![frag("猫")].into_iter(), 10_000).remove(0);
        dispatcher.dispatch(&batch3, &opts).await.unwrap();
        assert_eq!(service.calls(), 2);
    }

    #[tokio::test]
    async fn whitespace_is_reapplied_around_annotations() {
        let (dispatcher, _) = fixture(MockService::new());
        let batch = build_batches(vec![frag("  猫\n")].into_iter(), 10_000).remove(0);
        let payload = dispatcher
            .dispatch(&batch, &AnnotateOptions::default())
            .await
            .unwrap();
        let segs = markers::split_payload(&payload, batch.marker_ids());
        assert_eq!(
            segs[&batch.marker_ids()[0]],
            "  <ruby>猫<rt>猫よみ</rt></ruby>\n"
        );
    }

    #[tokio::test]
    async fn sub_request_carries_only_admitted_characters() {
        let service = Arc::new(MockService::new());
        let cache = Arc::new(Mutex::new(CacheStore::in_memory(Duration::from_secs(3600))));
        // Budget of exactly the trimmed core; the surrounding whitespace
        // must not be sent, or it would have outgrown the admission.
        let limiter = Arc::new(Mutex::new(RateLimiter::new(Duration::from_secs(10), 1)));
        let dispatcher = Dispatcher::new(service.clone(), cache, limiter);

        let batch = build_batches(vec![frag("  猫\n")].into_iter(), 10_000).remove(0);
        let payload = dispatcher
            .dispatch(&batch, &AnnotateOptions::default())
            .await
            .unwrap();

        let ids = batch.marker_ids();
        assert_eq!(
            service.last_payload().as_deref(),
            Some(format!("{}猫", frag_token(ids[0])).as_str())
        );
        // Whitespace still round-trips into the merged output.
        let segs = markers::split_payload(&payload, ids);
        assert_eq!(segs[&ids[0]], "  <ruby>猫<rt>猫よみ</rt></ruby>\n");
    }

    #[tokio::test]
    async fn rate_limited_batch_fails_whole_without_network() {
        let service = Arc::new(MockService::new());
        let cache = Arc::new(Mutex::new(CacheStore::in_memory(Duration::from_secs(3600))));
        let limiter = Arc::new(Mutex::new(RateLimiter::new(Duration::from_secs(10), 2)));
        let dispatcher = Dispatcher::new(service.clone(), cache, limiter);

        let batch = build_batches(vec![frag("猫犬鳥")].into_iter(), 10_000).remove(0);
        let err = dispatcher
            .dispatch(&batch, &AnnotateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RateLimited { requested: 3, .. }));
        assert!(err.is_retryable());
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test]
    async fn cache_hits_do_not_consume_rate_budget() {
        let service = Arc::new(MockService::new());
        let cache = Arc::new(Mutex::new(CacheStore::in_memory(Duration::from_secs(3600))));
        // Budget fits exactly one fragment's trimmed chars.
        let limiter = Arc::new(Mutex::new(RateLimiter::new(Duration::from_secs(10), 1)));
        let dispatcher = Dispatcher::new(service.clone(), cache, limiter);
        let opts = AnnotateOptions::default();

        let b1 = build_batches(vec![frag(" 猫 ")].into_iter(), 10_000).remove(0);
        dispatcher.dispatch(&b1, &opts).await.unwrap();

        // Second run is a pure hit: admits nothing, so the exhausted budget
        // does not matter.
        let b2 = build_batches(vec![frag("猫")].into_iter(), 10_000).remove(0);
        dispatcher.dispatch(&b2, &opts).await.unwrap();
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test]
    async fn dropped_marker_is_omitted_from_merged_payload() {
        let service = MockService::new().dropping_first_marker();
        let (dispatcher, _) = fixture(service);
        let batch = build_batches(vec![frag("猫"), frag("犬")].into_iter(), 10_000).remove(0);
        let payload = dispatcher
            .dispatch(&batch, &AnnotateOptions::default())
            .await
            .unwrap();
        let ids = batch.marker_ids();
        assert!(!payload.contains(&frag_token(ids[0])));
        assert!(payload.contains(&frag_token(ids[1])));
    }

    #[tokio::test]
    async fn duplicate_marker_in_response_is_malformed() {
        let service = MockService::new().duplicating_first_marker();
        let (dispatcher, _) = fixture(service);
        let batch = build_batches(vec![frag("猫"), frag("犬")].into_iter(), 10_000).remove(0);
        let err = dispatcher
            .dispatch(&batch, &AnnotateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn transport_failure_surfaces_once_for_the_sub_request() {
        let service = MockService::new().failing();
        let (dispatcher, service) = fixture(service);
        let batch = build_batches(vec![frag("猫")].into_iter(), 10_000).remove(0);
        let err = dispatcher
            .dispatch(&batch, &AnnotateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Transport(_)));
        assert_eq!(service.calls(), 1);
    }
}
