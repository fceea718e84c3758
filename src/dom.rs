//! DOM normalization: tolerant HTML parsing, stable node addressing, and
//! structural-noise annotation.
//!
//! Parsing never rewrites content. Every text-bearing run in the document
//! becomes a [`Block`] with a `/tag[index]/…` dom_path that is stable across
//! reruns on identical bytes. Noise (running headers, page markers, footnote
//! zones, metadata zones) is **annotated**, not removed; the derived plain
//! markup then decides per tag: page heads and page markers are dropped,
//! footnotes are diverted into per-chunk trailing sections, everything else
//! is kept verbatim (whitespace collapsed only).
//!
//! Detection rules:
//!
//! | Tag | Rule |
//! |-----|------|
//! | `pagehead` | same text or structural signature on ≥ 60% of prose pages, or a `PageHead` class |
//! | `page_marker` | `(ص: N)` constructs or `PageNumber` class; captures the page index |
//! | `footnote` | `footnote` class/role, or smaller typography right after an `<hr>` |
//! | `metadata` | first-page blocks before the first strong heading signal, or title-page tokens |

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::error::PipelineError;
use crate::manifest::SourceFile;
use crate::models::NoiseTag;
use crate::textnorm;

/// Tags treated as block containers; everything else is inline.
const BLOCK_TAGS: &[&str] = &[
    "html", "body", "div", "p", "h1", "h2", "h3", "h4", "h5", "h6", "ul", "ol", "li", "table",
    "tbody", "tr", "td", "th", "center", "blockquote", "section", "article", "header", "footer",
    "pre",
];

/// One text-bearing run of the normalized DOM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub dom_path: String,
    /// Whitespace-collapsed text. Content is otherwise untouched.
    pub text: String,
    pub html_excerpt: String,
    pub tag: String,
    /// Ancestor tag chain, nearest first, capped at 3.
    pub ancestors: Vec<String>,
    /// Sorted class tokens of the container and contributing inline elements.
    pub classes: Vec<String>,
    pub centered: bool,
    pub bold: bool,
    pub font_larger: bool,
    pub font_smaller: bool,
    pub preceded_by_hr: bool,
    pub followed_by_hr: bool,
    /// Preceded by two or more consecutive `<br>`s (an empty-line gap).
    pub gap_before: bool,
    pub prev_kind: String,
    pub next_kind: String,
    /// Hex digest of the structural fingerprint tuple.
    pub signature: String,
    /// Repetition key for pagehead detection: the structural signature plus
    /// a folded text prefix, so same-styled but differently-titled headings
    /// never collide.
    pub repetition_key: String,
    #[serde(default)]
    pub page_index: Option<u32>,
    #[serde(default)]
    pub noise: Option<NoiseTag>,
    /// Byte offset of this block's line in the file's derived markup. For
    /// blocks dropped from the markup this is the insertion point.
    pub derived_offset: usize,
    /// Whether the block's text is part of the derived markup.
    pub in_markup: bool,
}

/// Footnote content diverted out of the derived markup, with the offset it
/// occupied so the splitter can attach it to the right chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FootnoteSpan {
    pub offset: usize,
    pub text: String,
}

/// One source file after normalization and derivation.
#[derive(Debug, Clone)]
pub struct NormalizedFile {
    pub file: String,
    pub file_index: usize,
    pub blocks: Vec<Block>,
    /// Derived plain markup: kept block texts, one per line.
    pub markup: String,
    pub footnotes: Vec<FootnoteSpan>,
}

/// A running-header signature detected across the book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageheadEntry {
    pub text: String,
    pub signature: String,
    pub page_ratio: f64,
}

/// Book-level structural profile (`book_profile.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookProfile {
    pub page_count: usize,
    pub pages_with_prose: usize,
    pub page_marker_count: usize,
    pub footnote_block_count: usize,
    pub metadata_zone_hits: usize,
    pub pagehead: Vec<PageheadEntry>,
    /// Files containing embedded table-of-contents hints.
    pub embedded_toc_hints: Vec<String>,
    /// repetition_key → fraction of prose pages it appears on. Feeds the
    /// scorer's repetition feature.
    #[serde(skip)]
    pub signature_page_ratio: BTreeMap<String, f64>,
}

impl BookProfile {
    pub fn signature_ratio(&self, repetition_key: &str) -> f64 {
        self.signature_page_ratio
            .get(repetition_key)
            .copied()
            .unwrap_or(0.0)
    }
}

fn page_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\(\s*ص\s*[:：]\s*([0-9٠-٩]+)\s*\)|(?i)(?:صفحة|Page)\s*[:\-]?\s*([0-9٠-٩]+)")
            .unwrap()
    })
}

fn arabic_indic_to_u32(s: &str) -> Option<u32> {
    let western: String = s
        .chars()
        .map(|c| match c {
            '\u{0660}'..='\u{0669}' => char::from_u32('0' as u32 + (c as u32 - 0x0660)).unwrap(),
            other => other,
        })
        .collect();
    western.parse().ok()
}

/// Normalize every file of the book and compute the book profile.
///
/// Two passes: a structural pass per file, then book-wide annotation
/// (pagehead repetition, font-size medians, metadata zones) and markup
/// derivation.
pub fn normalize_book(sources: &[SourceFile]) -> Result<(Vec<NormalizedFile>, BookProfile)> {
    let mut parsed: Vec<(String, usize, Vec<RawBlock>)> = Vec::with_capacity(sources.len());
    for (file_index, source) in sources.iter().enumerate() {
        let name = source.record.path.clone();
        let raw_blocks = parse_file(&name, &source.text)?;
        parsed.push((name, file_index, raw_blocks));
    }

    // Font-size median across the whole book.
    let mut sizes: Vec<i32> = parsed
        .iter()
        .flat_map(|(_, _, blocks)| blocks.iter().filter_map(|b| b.font_size))
        .collect();
    sizes.sort_unstable();
    let median_size = if sizes.is_empty() {
        None
    } else {
        Some(sizes[sizes.len() / 2])
    };

    let mut files = Vec::with_capacity(parsed.len());
    for (name, file_index, raw_blocks) in parsed {
        files.push(finish_file(name, file_index, raw_blocks, median_size));
    }

    let profile = annotate_book(&mut files);

    for file in &mut files {
        derive_markup(file);
    }

    Ok((files, profile))
}

// ---------------------------------------------------------------------------
// Structural pass
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RawBlock {
    dom_path: String,
    text: String,
    html_excerpt: String,
    tag: String,
    ancestors: Vec<String>,
    classes: BTreeSet<String>,
    centered: bool,
    bold: bool,
    font_size: Option<i32>,
    after_hr: bool,
    gap_before: bool,
}

struct FileWalker {
    blocks: Vec<RawBlock>,
    /// An `<hr>` was seen; the next emitted block is "preceded by hr".
    pending_hr: bool,
    /// Two or more `<br>`s were seen; the next emitted block follows a gap.
    pending_gap: bool,
}

#[derive(Default)]
struct SegmentAccum {
    text: String,
    classes: BTreeSet<String>,
    bold: bool,
    font_size: Option<i32>,
}

fn parse_file(name: &str, html: &str) -> Result<Vec<RawBlock>> {
    let document = scraper::Html::parse_document(html);
    let mut walker = FileWalker {
        blocks: Vec::new(),
        pending_hr: false,
        pending_gap: false,
    };

    walk_container(document.tree.root(), "", &[], false, &mut walker);

    if walker.blocks.is_empty() && !html.trim().is_empty() {
        return Err(PipelineError::Parse {
            file: name.to_string(),
            reason: "document yielded no text blocks".into(),
        }
        .into());
    }
    Ok(walker.blocks)
}

fn is_block_tag(tag: &str) -> bool {
    BLOCK_TAGS.contains(&tag)
}

fn element_centers(el: &scraper::node::Element) -> bool {
    if el.name() == "center" {
        return true;
    }
    if el
        .attr("align")
        .map(|a| a.eq_ignore_ascii_case("center"))
        .unwrap_or(false)
    {
        return true;
    }
    el.attr("style")
        .map(|s| s.to_lowercase().replace(' ', "").contains("text-align:center"))
        .unwrap_or(false)
}

fn parse_font_size(el: &scraper::node::Element) -> Option<i32> {
    el.attr("size")
        .and_then(|s| s.trim().trim_start_matches('+').parse::<i32>().ok())
}

/// Walk one block container. Inline runs between block children become
/// segments; each segment is emitted as a [`RawBlock`] in document order, so
/// blocks interleave correctly with recursion into block children.
fn walk_container(
    node: ego_tree::NodeRef<'_, scraper::node::Node>,
    path: &str,
    ancestors: &[String],
    centered: bool,
    walker: &mut FileWalker,
) {
    let container_el = match node.value() {
        scraper::node::Node::Element(el) => Some(el),
        _ => None,
    };
    let container_tag = container_el
        .map(|el| el.name().to_lowercase())
        .unwrap_or_else(|| "document".to_string());
    let container_classes: BTreeSet<String> = container_el
        .map(|el| {
            el.classes()
                .map(|c| c.to_lowercase())
                .collect::<BTreeSet<_>>()
        })
        .unwrap_or_default();
    let container_excerpt = scraper::ElementRef::wrap(node)
        .map(|el| el.html())
        .unwrap_or_default();

    let mut tag_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut current = SegmentAccum::default();
    let mut br_run = 0usize;
    let mut seg_counter = 0usize;
    let mut seg_positions: Vec<usize> = Vec::new();
    let mut had_block_child = false;

    for child in node.children() {
        match child.value() {
            scraper::node::Node::Element(el) => {
                let tag = el.name().to_lowercase();
                if tag == "hr" {
                    flush_segment(
                        walker,
                        &mut current,
                        &mut seg_counter,
                        &mut seg_positions,
                        path,
                        &container_tag,
                        &container_classes,
                        &container_excerpt,
                        ancestors,
                        centered,
                    );
                    walker.pending_hr = true;
                    br_run = 0;
                    continue;
                }
                if tag == "br" {
                    br_run += 1;
                    flush_segment(
                        walker,
                        &mut current,
                        &mut seg_counter,
                        &mut seg_positions,
                        path,
                        &container_tag,
                        &container_classes,
                        &container_excerpt,
                        ancestors,
                        centered,
                    );
                    if br_run >= 2 {
                        walker.pending_gap = true;
                    }
                    continue;
                }
                br_run = 0;

                if is_block_tag(&tag) {
                    flush_segment(
                        walker,
                        &mut current,
                        &mut seg_counter,
                        &mut seg_positions,
                        path,
                        &container_tag,
                        &container_classes,
                        &container_excerpt,
                        ancestors,
                        centered,
                    );
                    had_block_child = true;

                    let count = tag_counts.entry(tag.clone()).or_insert(0);
                    *count += 1;
                    let child_path = format!("{path}/{tag}[{count}]");
                    let mut child_ancestors: Vec<String> = vec![tag.clone()];
                    child_ancestors.extend(ancestors.iter().take(2).cloned());
                    let child_centered = centered || element_centers(&el);
                    walk_container(child, &child_path, &child_ancestors, child_centered, walker);
                } else {
                    collect_inline(child, &mut current);
                }
            }
            scraper::node::Node::Text(t) => {
                if !t.trim().is_empty() {
                    br_run = 0;
                }
                current.text.push_str(&t);
            }
            _ => {}
        }
    }
    flush_segment(
        walker,
        &mut current,
        &mut seg_counter,
        &mut seg_positions,
        path,
        &container_tag,
        &container_classes,
        &container_excerpt,
        ancestors,
        centered,
    );

    // A pure leaf container (one segment, no block children) is addressed by
    // its own element path instead of a /text[1] suffix.
    if seg_positions.len() == 1 && !had_block_child && !path.is_empty() {
        walker.blocks[seg_positions[0]].dom_path = path.to_string();
    }
}

#[allow(clippy::too_many_arguments)]
fn flush_segment(
    walker: &mut FileWalker,
    current: &mut SegmentAccum,
    seg_counter: &mut usize,
    seg_positions: &mut Vec<usize>,
    path: &str,
    container_tag: &str,
    container_classes: &BTreeSet<String>,
    container_excerpt: &str,
    ancestors: &[String],
    centered: bool,
) {
    let accum = std::mem::take(current);
    let text = textnorm::normalize(&accum.text);
    if text.is_empty() {
        return;
    }
    *seg_counter += 1;
    let dom_path = format!("{path}/text[{seg_counter}]");
    let mut classes = container_classes.clone();
    classes.extend(accum.classes);

    let after_hr = std::mem::take(&mut walker.pending_hr);
    let gap_before = std::mem::take(&mut walker.pending_gap);

    seg_positions.push(walker.blocks.len());
    walker.blocks.push(RawBlock {
        dom_path,
        text,
        html_excerpt: truncate_chars(container_excerpt, 240),
        tag: container_tag.to_string(),
        ancestors: ancestors.to_vec(),
        classes,
        centered,
        bold: accum.bold,
        font_size: accum.font_size,
        after_hr,
        gap_before,
    });
}

/// Accumulate an inline element's text, classes, and emphasis into the
/// current segment.
fn collect_inline(
    node: ego_tree::NodeRef<'_, scraper::node::Node>,
    accum: &mut SegmentAccum,
) {
    if let scraper::node::Node::Element(el) = node.value() {
        let tag = el.name().to_lowercase();
        if tag == "b" || tag == "strong" {
            accum.bold = true;
        }
        if tag == "font" {
            if let Some(size) = parse_font_size(&el) {
                accum.font_size = Some(accum.font_size.map_or(size, |s| s.max(size)));
            }
        }
        for class in el.classes() {
            accum.classes.insert(class.to_lowercase());
        }
        if let Some(role) = el.attr("role") {
            accum.classes.insert(role.to_lowercase());
        }
    }
    for child in node.children() {
        match child.value() {
            scraper::node::Node::Text(t) => accum.text.push_str(&t),
            scraper::node::Node::Element(_) => collect_inline(child, accum),
            _ => {}
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.char_indices()
        .nth(max)
        .map(|(i, _)| s[..i].to_string())
        .unwrap_or_else(|| s.to_string())
}

// ---------------------------------------------------------------------------
// Book-level annotation
// ---------------------------------------------------------------------------

fn finish_file(
    file: String,
    file_index: usize,
    raw: Vec<RawBlock>,
    median_size: Option<i32>,
) -> NormalizedFile {
    let last = raw.len().saturating_sub(1);
    let mut blocks = Vec::with_capacity(raw.len());

    for (i, rb) in raw.iter().enumerate() {
        let prev_kind = if rb.after_hr {
            "hr"
        } else if rb.gap_before {
            "gap"
        } else if i == 0 {
            "start"
        } else {
            "text"
        };
        let next_kind = if i == last {
            "end"
        } else if raw[i + 1].after_hr {
            "hr"
        } else if raw[i + 1].gap_before {
            "gap"
        } else {
            "text"
        };

        let font_larger = matches!((rb.font_size, median_size), (Some(s), Some(m)) if s > m);
        let font_smaller = matches!((rb.font_size, median_size), (Some(s), Some(m)) if s < m);

        let signature = block_signature(
            &rb.ancestors,
            &rb.classes,
            rb.centered,
            rb.bold,
            font_larger,
            prev_kind,
            next_kind,
        );
        let text_prefix: String = textnorm::fold_key(&rb.text).chars().take(40).collect();
        let repetition_key = format!("{signature}|{text_prefix}");

        blocks.push(Block {
            dom_path: rb.dom_path.clone(),
            text: rb.text.clone(),
            html_excerpt: rb.html_excerpt.clone(),
            tag: rb.tag.clone(),
            ancestors: rb.ancestors.clone(),
            classes: rb.classes.iter().cloned().collect(),
            centered: rb.centered,
            bold: rb.bold,
            font_larger,
            font_smaller,
            preceded_by_hr: rb.after_hr,
            followed_by_hr: i < last && raw[i + 1].after_hr,
            gap_before: rb.gap_before,
            prev_kind: prev_kind.to_string(),
            next_kind: next_kind.to_string(),
            signature,
            repetition_key,
            page_index: None,
            noise: None,
            derived_offset: 0,
            in_markup: false,
        });
    }

    NormalizedFile {
        file,
        file_index,
        blocks,
        markup: String::new(),
        footnotes: Vec::new(),
    }
}

/// The structural fingerprint: two blocks with the same signature are
/// structurally equivalent for pagehead detection.
pub fn block_signature(
    ancestors: &[String],
    classes: &BTreeSet<String>,
    centered: bool,
    bold: bool,
    font_larger: bool,
    prev_kind: &str,
    next_kind: &str,
) -> String {
    let tuple = format!(
        "{}|{}|{}{}{}|{}|{}",
        ancestors.join(">"),
        classes.iter().cloned().collect::<Vec<_>>().join(","),
        centered as u8,
        bold as u8,
        font_larger as u8,
        prev_kind,
        next_kind,
    );
    let mut hasher = Sha256::new();
    hasher.update(tuple.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..16].to_string()
}

fn annotate_book(files: &mut [NormalizedFile]) -> BookProfile {
    let mut profile = BookProfile::default();

    // Page markers first; they define the page partition everything else uses.
    for file in files.iter_mut() {
        let mut current_page: Option<u32> = None;
        for block in &mut file.blocks {
            let is_marker_class = block.classes.iter().any(|c| c.contains("pagenumber"));
            let marker_cap = page_marker_re().captures(&block.text);
            if is_marker_class || marker_cap.is_some() {
                if let Some(cap) = marker_cap {
                    let digits = cap.get(1).or_else(|| cap.get(2)).map(|m| m.as_str());
                    if let Some(d) = digits {
                        current_page = arabic_indic_to_u32(d).or(current_page);
                    }
                }
                block.noise = Some(NoiseTag::PageMarker);
                block.page_index = current_page;
                profile.page_marker_count += 1;
                continue;
            }
            block.page_index = current_page;
        }
    }

    // Page partition: (file_index, page) — pre-marker regions use page 0.
    let page_key = |file_index: usize, page: Option<u32>| (file_index, page.unwrap_or(0));
    let mut prose_pages: BTreeSet<(usize, u32)> = BTreeSet::new();
    let mut all_pages: BTreeSet<(usize, u32)> = BTreeSet::new();
    for file in files.iter() {
        for block in &file.blocks {
            let key = page_key(file.file_index, block.page_index);
            all_pages.insert(key);
            if block.noise.is_none() && !block.text.is_empty() {
                prose_pages.insert(key);
            }
        }
    }
    profile.page_count = all_pages.len();
    profile.pages_with_prose = prose_pages.len();

    // Footnote zones.
    for file in files.iter_mut() {
        for block in &mut file.blocks {
            if block.noise.is_some() {
                continue;
            }
            let by_class = block.classes.iter().any(|c| c.contains("footnote"));
            let by_typography = block.preceded_by_hr && block.font_smaller;
            if by_class || by_typography || block.text.starts_with("حاشية") {
                block.noise = Some(NoiseTag::Footnote);
                profile.footnote_block_count += 1;
            }
        }
    }

    // Metadata zones: title-page tokens in the first two files, and the
    // first-file region before the first strong heading signal.
    for file in files.iter_mut().take(2) {
        for block in &mut file.blocks {
            if block.noise.is_none() && textnorm::contains_metadata_token(&block.text) {
                block.noise = Some(NoiseTag::Metadata);
                profile.metadata_zone_hits += 1;
            }
        }
    }
    if let Some(first) = files.first_mut() {
        let strong_at = first.blocks.iter().position(|b| {
            b.noise.is_none()
                && textnorm::begins_with_heading_token(&b.text)
                && (b.centered || b.bold || b.classes.iter().any(|c| c.contains("title")))
        });
        if let Some(idx) = strong_at {
            let first_page = first.blocks.first().and_then(|b| b.page_index);
            for block in &mut first.blocks[..idx] {
                if block.noise.is_none() && block.page_index == first_page {
                    block.noise = Some(NoiseTag::Metadata);
                    profile.metadata_zone_hits += 1;
                }
            }
        }
    }

    // TOC hints.
    for file in files.iter() {
        if file
            .blocks
            .iter()
            .any(|b| textnorm::contains_toc_token(&b.text))
        {
            profile.embedded_toc_hints.push(file.file.clone());
        }
    }

    // Pagehead repetition: exact text and structural signature, over pages
    // containing prose.
    let prose_page_total = profile.pages_with_prose.max(1);
    let mut text_pages: BTreeMap<String, BTreeSet<(usize, u32)>> = BTreeMap::new();
    let mut sig_pages: BTreeMap<String, BTreeSet<(usize, u32)>> = BTreeMap::new();
    for file in files.iter() {
        for block in &file.blocks {
            if block.noise.is_some() || block.text.is_empty() || block.text.chars().count() > 120 {
                continue;
            }
            let key = page_key(file.file_index, block.page_index);
            text_pages
                .entry(textnorm::fold_key(&block.text))
                .or_default()
                .insert(key);
            sig_pages
                .entry(block.repetition_key.clone())
                .or_default()
                .insert(key);
        }
    }
    for (sig, pages) in &sig_pages {
        profile
            .signature_page_ratio
            .insert(sig.clone(), pages.len() as f64 / prose_page_total as f64);
    }

    let repeated_texts: BTreeMap<String, f64> = text_pages
        .iter()
        .filter_map(|(text, pages)| {
            let ratio = pages.len() as f64 / prose_page_total as f64;
            (pages.len() > 1 && ratio >= 0.6).then(|| (text.clone(), ratio))
        })
        .collect();
    let repeated_sigs: BTreeMap<String, f64> = sig_pages
        .iter()
        .filter_map(|(sig, pages)| {
            let ratio = pages.len() as f64 / prose_page_total as f64;
            (pages.len() > 1 && ratio >= 0.6).then(|| (sig.clone(), ratio))
        })
        .collect();

    let mut seen_entries: BTreeSet<String> = BTreeSet::new();
    for file in files.iter_mut() {
        for block in &mut file.blocks {
            if block.noise.is_some() || block.text.is_empty() {
                continue;
            }
            let folded = textnorm::fold_key(&block.text);
            let by_class = block.classes.iter().any(|c| c.contains("pagehead"));
            let text_ratio = repeated_texts.get(&folded).copied();
            let sig_ratio = repeated_sigs.get(&block.repetition_key).copied();
            if by_class || text_ratio.is_some() || sig_ratio.is_some() {
                block.noise = Some(NoiseTag::Pagehead);
                if seen_entries.insert(folded) {
                    profile.pagehead.push(PageheadEntry {
                        text: block.text.clone(),
                        signature: block.signature.clone(),
                        page_ratio: text_ratio.or(sig_ratio).unwrap_or(1.0),
                    });
                }
            }
        }
    }

    profile
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Build the derived plain markup for one file: kept block texts, one per
/// line. Page heads and page markers are dropped; footnotes are diverted.
fn derive_markup(file: &mut NormalizedFile) {
    let mut markup = String::new();
    let mut footnotes = Vec::new();
    for block in &mut file.blocks {
        block.derived_offset = markup.len();
        match block.noise {
            Some(NoiseTag::Pagehead) | Some(NoiseTag::PageMarker) => {
                block.in_markup = false;
            }
            Some(NoiseTag::Footnote) => {
                block.in_markup = false;
                footnotes.push(FootnoteSpan {
                    offset: markup.len(),
                    text: block.text.clone(),
                });
            }
            _ => {
                if block.text.is_empty() {
                    block.in_markup = false;
                } else {
                    block.in_markup = true;
                    markup.push_str(&block.text);
                    markup.push('\n');
                }
            }
        }
    }
    file.markup = markup;
    file.footnotes = footnotes;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileRecord;

    fn source(name: &str, index: usize, html: &str) -> SourceFile {
        SourceFile {
            path: std::path::PathBuf::from(name),
            record: FileRecord {
                path: name.to_string(),
                size: html.len() as u64,
                sha256: "0".repeat(64),
                encoding: "utf-8".into(),
                order_index: index,
            },
            text: html.to_string(),
            nfc_fingerprint: "0".repeat(64),
        }
    }

    #[test]
    fn dom_paths_are_stable_across_reruns() {
        let html = "<html><body><div><p>باب الأول</p><p>نص</p></div></body></html>";
        let a = parse_file("f.html", html).unwrap();
        let b = parse_file("f.html", html).unwrap();
        let paths_a: Vec<_> = a.iter().map(|x| x.dom_path.clone()).collect();
        let paths_b: Vec<_> = b.iter().map(|x| x.dom_path.clone()).collect();
        assert_eq!(paths_a, paths_b);
        assert!(paths_a[0].ends_with("/p[1]"), "got {:?}", paths_a);
        assert!(paths_a[1].ends_with("/p[2]"));
    }

    #[test]
    fn multiple_inline_runs_get_distinct_paths() {
        let html = "<html><body><div>سطر أول<br>سطر ثان<br>سطر ثالث</div></body></html>";
        let blocks = parse_file("f.html", html).unwrap();
        assert_eq!(blocks.len(), 3);
        let paths: BTreeSet<_> = blocks.iter().map(|b| b.dom_path.clone()).collect();
        assert_eq!(paths.len(), 3, "paths must be unique: {:?}", paths);
    }

    #[test]
    fn centered_and_bold_flags_propagate() {
        let html = "<html><body><center><p><b>باب الإدغام</b></p></center></body></html>";
        let blocks = parse_file("f.html", html).unwrap();
        let block = blocks.iter().find(|b| b.text.contains("باب")).unwrap();
        assert!(block.centered);
        assert!(block.bold);
    }

    #[test]
    fn hr_adjacency_marks_next_block() {
        let html = "<html><body><p>قبل</p><hr><p>بعد</p></body></html>";
        let (files, _) = normalize_book(&[source("f.html", 0, html)]).unwrap();
        let after = files[0].blocks.iter().find(|b| b.text == "بعد").unwrap();
        assert!(after.preceded_by_hr);
        let before = files[0].blocks.iter().find(|b| b.text == "قبل").unwrap();
        assert!(before.followed_by_hr);
    }

    #[test]
    fn double_br_marks_gap() {
        let html = "<html><body><div>فقرة أولى<br><br>فقرة ثانية</div></body></html>";
        let blocks = parse_file("f.html", html).unwrap();
        let second = blocks.iter().find(|b| b.text == "فقرة ثانية").unwrap();
        assert!(second.gap_before);
    }

    #[test]
    fn page_markers_are_tagged_and_indexed() {
        let html = "<html><body><p>نص أول</p><p>(ص: 12)</p><p>نص ثان</p></body></html>";
        let (files, profile) = normalize_book(&[source("f.html", 0, html)]).unwrap();
        let marker = files[0]
            .blocks
            .iter()
            .find(|b| b.noise == Some(NoiseTag::PageMarker))
            .unwrap();
        assert_eq!(marker.page_index, Some(12));
        assert_eq!(profile.page_marker_count, 1);
        let second = files[0].blocks.iter().find(|b| b.text == "نص ثان").unwrap();
        assert_eq!(second.page_index, Some(12));
    }

    #[test]
    fn footnote_class_is_tagged_and_diverted() {
        let html = "<html><body><p>المتن</p><p class=\"footnote\">حاشية توضيحية</p></body></html>";
        let (files, profile) = normalize_book(&[source("f.html", 0, html)]).unwrap();
        assert_eq!(profile.footnote_block_count, 1);
        assert!(!files[0].markup.contains("حاشية توضيحية"));
        assert_eq!(files[0].footnotes.len(), 1);
    }

    #[test]
    fn repeated_header_is_pagehead_and_dropped_from_markup() {
        // Same span text at the top of every page of three files.
        let page = |n: u32| {
            format!(
                "<html><body><p>تفسير ابن كثير</p><p>نص الصفحة {n} وفيه كلام كثير مختلف</p></body></html>"
            )
        };
        let sources = vec![
            source("001.html", 0, &page(1)),
            source("002.html", 1, &page(2)),
            source("003.html", 2, &page(3)),
        ];
        let (files, profile) = normalize_book(&sources).unwrap();
        assert!(
            profile.pagehead.iter().any(|e| e.text.contains("تفسير")),
            "pagehead entries: {:?}",
            profile.pagehead
        );
        for file in &files {
            assert!(!file.markup.contains("تفسير ابن كثير"));
        }
    }

    #[test]
    fn metadata_tokens_tag_front_matter() {
        let html = "<html><body><p>المؤلف: فلان</p><p>الناشر: دار</p></body></html>";
        let (files, profile) = normalize_book(&[source("f.html", 0, html)]).unwrap();
        assert!(profile.metadata_zone_hits >= 2);
        // Metadata stays in derived markup; it is annotated, not dropped.
        assert!(files[0].markup.contains("المؤلف"));
    }

    #[test]
    fn derived_offsets_match_markup() {
        let html = "<html><body><p>سطر أول</p><p>سطر ثان</p></body></html>";
        let (files, _) = normalize_book(&[source("f.html", 0, html)]).unwrap();
        let file = &files[0];
        for block in file.blocks.iter().filter(|b| b.in_markup) {
            let slice = &file.markup[block.derived_offset..block.derived_offset + block.text.len()];
            assert_eq!(slice, block.text);
        }
    }

    #[test]
    fn comment_only_file_yields_parse_error() {
        assert!(parse_file("f.html", "<!-- only a comment -->").is_err());
    }

    #[test]
    fn arabic_indic_digits_parse() {
        assert_eq!(arabic_indic_to_u32("١٢٣"), Some(123));
        assert_eq!(arabic_indic_to_u32("45"), Some(45));
    }
}
