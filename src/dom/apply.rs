//! Reassembly: split the dispatcher's marker-tagged payload and patch each
//! fragment's position in the tree. A fragment whose marker vanished from
//! the payload, or whose handle went stale underneath us, is skipped
//! silently; the rest of the batch still applies.

use crate::dom::sanitize::sanitize_markup;
use crate::dom::TreeAdapter;
use crate::markers;
use crate::pipeline::batch::Batch;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub replaced: usize,
    pub skipped_missing: usize,
    pub skipped_stale: usize,
}

pub fn apply_annotated<A: TreeAdapter>(tree: &mut A, batch: &Batch, payload: &str) -> ApplyStats {
    let segments = markers::split_payload(payload, batch.marker_ids());
    let mut stats = ApplyStats::default();

    for (frag_id, fragment) in batch.entries() {
        let Some(segment) = segments.get(&frag_id) else {
            stats.skipped_missing += 1;
            continue;
        };
        let markup = sanitize_markup(segment);
        if tree.replace_text(fragment.handle, &markup) {
            stats.replaced += 1;
        } else {
            stats.skipped_stale += 1;
        }
    }
    stats
}
