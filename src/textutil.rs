use once_cell::sync::Lazy;
use regex::Regex;

// Hiragana, katakana (+ phonetic extensions), CJK ideographs (+ ext A),
// iteration marks, halfwidth katakana.
static JAPANESE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[々-〇぀-ゟ゠-ヿㇰ-ㇿ㐀-䶿一-鿿ｦ-ﾝ]").expect("japanese script regex")
});

pub fn contains_japanese(text: &str) -> bool {
    JAPANESE_RE.is_match(text)
}

/// A text run is worth annotating only if it carries at least one
/// Japanese-script character and is not pure whitespace.
pub fn is_eligible_text(text: &str) -> bool {
    !text.trim().is_empty() && contains_japanese(text)
}

/// Split into (leading whitespace, trimmed core, trailing whitespace).
/// The core is what gets digested and sent; the surrounding whitespace is
/// re-applied when merging annotated output back.
pub fn split_surrounding_whitespace(text: &str) -> (&str, &str, &str) {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return (text, "", "");
    }
    let start = text.find(trimmed).unwrap_or(0);
    let end = start + trimmed.len();
    (&text[..start], trimmed, &text[end..])
}

pub fn char_count(text: &str) -> usize {
    text.chars().count()
}
