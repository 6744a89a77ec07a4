use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;

pub const FRAG_ID_WIDTH: usize = 6;

/// Process-wide id source. Fixed-width formatting keeps every marker the
/// same length, so no marker is a prefix of another even when adjacent in
/// the payload.
static NEXT_FRAG_ID: AtomicU64 = AtomicU64::new(1);

const FRAG_ID_MODULUS: u64 = 1_000_000;

pub static ANY_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<<RM_FRAG:(\d{6})>>").expect("marker regex"));

pub fn frag_token(frag_id: u64) -> String {
    format!("<<RM_FRAG:{:0FRAG_ID_WIDTH$}>>", frag_id % FRAG_ID_MODULUS)
}

pub fn next_frag_id() -> u64 {
    NEXT_FRAG_ID.fetch_add(1, Ordering::Relaxed) % FRAG_ID_MODULUS
}

/// Concatenate `marker + text` pairs in order into one wire payload.
pub fn join_payload<'a>(parts: impl IntoIterator<Item = (u64, &'a str)>) -> String {
    let mut out = String::new();
    for (frag_id, text) in parts {
        out.push_str(&frag_token(frag_id));
        out.push_str(text);
    }
    out
}

/// Every marker occurrence in `text`, in order: (frag id, byte offset of the
/// marker start, byte offset just past the marker).
fn scan_markers(text: &str) -> Vec<(u64, usize, usize)> {
    ANY_MARKER_RE
        .captures_iter(text)
        .map(|caps| {
            let whole = caps.get(0).expect("whole match");
            let id: u64 = caps[1].parse().expect("fixed-width digits");
            (id, whole.start(), whole.end())
        })
        .collect()
}

/// Tolerant split used on the dispatcher's merged payload: each expected
/// marker's segment runs to the next marker of any kind (or end of input).
/// A missing marker simply leaves its id absent; the caller skips that
/// fragment. Segments are returned verbatim, whitespace included.
pub fn split_payload(text: &str, expected_ids: &[u64]) -> HashMap<u64, String> {
    let wanted: HashSet<u64> = expected_ids.iter().copied().collect();
    let marks = scan_markers(text);
    let mut segments: HashMap<u64, String> = HashMap::new();
    for (i, &(id, _, seg_start)) in marks.iter().enumerate() {
        if !wanted.contains(&id) || segments.contains_key(&id) {
            continue;
        }
        let seg_end = marks
            .get(i + 1)
            .map(|&(_, next_start, _)| next_start)
            .unwrap_or(text.len());
        segments.insert(id, text[seg_start..seg_end].to_string());
    }
    segments
}

/// Strict parse used on the raw remote response. The service may shuffle or
/// drop whitespace around markers (segments come back trimmed), and it may
/// drop a marker entirely (that id is absent), but a duplicated expected
/// marker is an error; there is no safe way to pick between two candidate
/// annotations for one fragment.
pub fn parse_annotated_output(text: &str, expected_ids: &[u64]) -> Result<HashMap<u64, String>> {
    let wanted: HashSet<u64> = expected_ids.iter().copied().collect();
    let marks = scan_markers(text);

    let mut seen: HashSet<u64> = HashSet::new();
    for &(id, _, _) in &marks {
        if wanted.contains(&id) && !seen.insert(id) {
            return Err(anyhow!("marker {} appears more than once", frag_token(id)));
        }
    }

    let mut segments: HashMap<u64, String> = HashMap::new();
    for (i, &(id, _, seg_start)) in marks.iter().enumerate() {
        if !wanted.contains(&id) {
            continue;
        }
        let seg_end = marks
            .get(i + 1)
            .map(|&(_, next_start, _)| next_start)
            .unwrap_or(text.len());
        segments.insert(id, text[seg_start..seg_end].trim().to_string());
    }
    Ok(segments)
}
