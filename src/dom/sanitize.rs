//! Strict allowlist sanitizer for service-produced markup. Only the
//! reading-annotation container (`ruby`), its reading child (`rt`), the
//! search-highlight marker (`mark`) and the level-indicator `span` survive,
//! and only with `class` plus the recognized data attributes. Anything else
//! is unwrapped: the tag goes away, its text content stays.

use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;

use crate::dom::MarkupNode;

const ALLOWED_TAGS: [&str; 4] = ["ruby", "rt", "mark", "span"];

const ALLOWED_ATTRS: [&str; 7] = [
    "class",
    "data-word",
    "data-reading",
    "data-dict-form",
    "data-dict-reading",
    "data-level",
    "data-pos",
];

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("tag strip regex"));

fn tag_allowed(tag: &str) -> bool {
    ALLOWED_TAGS.iter().any(|t| *t == tag)
}

fn attr_allowed(name: &str) -> bool {
    ALLOWED_ATTRS.iter().any(|a| *a == name)
}

struct Frame {
    keep: bool,
    tag: String,
    attrs: Vec<(String, String)>,
    children: Vec<MarkupNode>,
}

/// Parse one markup fragment and reduce it to allowlisted nodes.
///
/// Disallowed elements are unwrapped (children promoted in place);
/// comments, CDATA, processing instructions and the like are dropped. A
/// parse failure downgrades the unparsed remainder to tag-stripped text, so
/// sanitization never fails outright.
pub fn sanitize_markup(html: &str) -> Vec<MarkupNode> {
    let mut reader = Reader::from_str(html);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut roots: Vec<MarkupNode> = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();

    fn emit(roots: &mut Vec<MarkupNode>, stack: &mut [Frame], node: MarkupNode) {
        match stack.last_mut() {
            Some(frame) => frame.children.push(node),
            None => roots.push(node),
        }
    }

    fn open_frame(start: &BytesStart<'_>) -> Frame {
        let tag = String::from_utf8_lossy(start.name().as_ref()).to_ascii_lowercase();
        let keep = tag_allowed(&tag);
        let mut attrs = Vec::new();
        if keep {
            for attr in start.attributes().flatten() {
                let name = String::from_utf8_lossy(attr.key.as_ref()).to_ascii_lowercase();
                if !attr_allowed(&name) {
                    continue;
                }
                let value = attr
                    .unescape_value()
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
                attrs.push((name, value));
            }
        }
        Frame {
            keep,
            tag,
            attrs,
            children: Vec::new(),
        }
    }

    fn close_frame(roots: &mut Vec<MarkupNode>, stack: &mut Vec<Frame>, frame: Frame) {
        if frame.keep {
            emit(
                roots,
                stack,
                MarkupNode::Element {
                    tag: frame.tag,
                    attrs: frame.attrs,
                    children: frame.children,
                },
            );
        } else {
            for child in frame.children {
                emit(roots, stack, child);
            }
        }
    }

    loop {
        match reader.read_event() {
            Ok(Event::Eof) => break,
            Ok(Event::Start(start)) => stack.push(open_frame(&start)),
            Ok(Event::End(_)) => {
                if let Some(frame) = stack.pop() {
                    close_frame(&mut roots, &mut stack, frame);
                }
            }
            Ok(Event::Empty(start)) => {
                let frame = open_frame(&start);
                close_frame(&mut roots, &mut stack, frame);
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(t.as_ref()).into_owned());
                if !text.is_empty() {
                    emit(&mut roots, &mut stack, MarkupNode::Text(text));
                }
            }
            // Non-element, non-text nodes (comments, CDATA, PIs, ...) drop.
            Ok(_) => {}
            Err(_) => {
                let rest = &html[reader.buffer_position() as usize..];
                let text = TAG_RE.replace_all(rest, "").into_owned();
                if !text.is_empty() {
                    emit(&mut roots, &mut stack, MarkupNode::Text(text));
                }
                break;
            }
        }
    }

    // Unclosed frames at EOF unwind as if closed in order.
    while let Some(frame) = stack.pop() {
        close_frame(&mut roots, &mut stack, frame);
    }
    roots
}
