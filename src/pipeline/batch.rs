use crate::dom::select::Fragment;
use crate::markers;
use crate::textutil::char_count;

/// Ordered fragments plus their marker ids, packaged as one dispatch unit.
/// Marker count always equals fragment count.
#[derive(Clone, Debug)]
pub struct Batch {
    marker_ids: Vec<u64>,
    fragments: Vec<Fragment>,
}

impl Batch {
    pub fn marker_ids(&self) -> &[u64] {
        &self.marker_ids
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn entries(&self) -> impl Iterator<Item = (u64, &Fragment)> {
        self.marker_ids.iter().copied().zip(self.fragments.iter())
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Concatenated `marker + fragmentText` wire payload in fragment order.
    pub fn payload(&self) -> String {
        markers::join_payload(self.entries().map(|(id, f)| (id, f.text.as_str())))
    }

    pub fn char_total(&self) -> usize {
        self.fragments.iter().map(|f| char_count(&f.text)).sum()
    }
}

/// Accumulate fragments until the character ceiling is reached, then flush.
/// The ceiling is a soft flush trigger: a batch never splits a fragment,
/// and a single over-ceiling fragment still becomes its own batch.
pub fn build_batches(fragments: impl Iterator<Item = Fragment>, char_ceiling: usize) -> Vec<Batch> {
    let mut batches: Vec<Batch> = Vec::new();
    let mut current = Batch {
        marker_ids: Vec::new(),
        fragments: Vec::new(),
    };
    let mut current_chars = 0usize;

    for fragment in fragments {
        current_chars += char_count(&fragment.text);
        current.marker_ids.push(markers::next_frag_id());
        current.fragments.push(fragment);
        if current_chars >= char_ceiling {
            batches.push(std::mem::replace(
                &mut current,
                Batch {
                    marker_ids: Vec::new(),
                    fragments: Vec::new(),
                },
            ));
            current_chars = 0;
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
