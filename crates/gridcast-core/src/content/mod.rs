//! Content addressing for the shared media tree.
//!
//! A *content set* maps POSIX-normalized relative paths to `(size, digest)`
//! pairs; two trees with equal content sets are considered converged. The
//! listing exchanged by the bulk transport is the line format
//! `rel_path|size|digest\n`.

pub mod hasher;

pub use hasher::ContentHasher;

use std::collections::BTreeMap;

use crate::constants::DIGEST_HEX_LEN;

// =============================================================================
// Content Entries
// =============================================================================

/// Size and strong digest of one file in the shared tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    pub size: u64,
    /// 32-char lowercase hex digest of the full file contents.
    pub digest: String,
}

/// The content set of a shared root, keyed by relative path.
///
/// A `BTreeMap` keeps iteration sorted by `rel_path`, which makes sync
/// passes deterministic within a run.
pub type ContentSet = BTreeMap<String, ContentEntry>;

// =============================================================================
// Listing Format
// =============================================================================

/// Render a content set as `rel_path|size|digest` lines.
pub fn encode_listing(set: &ContentSet) -> String {
    let mut out = String::new();
    for (path, entry) in set {
        out.push_str(path);
        out.push('|');
        out.push_str(&entry.size.to_string());
        out.push('|');
        out.push_str(&entry.digest);
        out.push('\n');
    }
    out
}

/// Parse a listing back into a content set.
///
/// Malformed lines are skipped, matching the tolerant receive side of the
/// wire protocol: a bad line must not poison the rest of the listing.
pub fn decode_listing(text: &str) -> ContentSet {
    let mut set = ContentSet::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let Some(first) = line.find('|') else { continue };
        let Some(last) = line.rfind('|') else { continue };
        if first == last {
            continue;
        }
        let path = &line[..first];
        let Ok(size) = line[first + 1..last].parse::<u64>() else {
            continue;
        };
        let digest = &line[last + 1..];
        if path.is_empty() || digest.len() != DIGEST_HEX_LEN {
            continue;
        }
        set.insert(
            path.to_string(),
            ContentEntry {
                size,
                digest: digest.to_string(),
            },
        );
    }
    set
}

/// Normalize a relative path to the wire form: forward slashes only.
pub fn normalize_rel_path(path: &str) -> String {
    path.replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(size: u64, digest: &str) -> ContentEntry {
        ContentEntry {
            size,
            digest: digest.to_string(),
        }
    }

    const D1: &str = "0123456789abcdef0123456789abcdef";
    const D2: &str = "fedcba9876543210fedcba9876543210";

    #[test]
    fn listing_roundtrip() {
        let mut set = ContentSet::new();
        set.insert("videos/foo.mp4".into(), entry(10, D1));
        set.insert("configs/a.mappings.json".into(), entry(3, D2));

        let text = encode_listing(&set);
        assert_eq!(decode_listing(&text), set);
    }

    #[test]
    fn listing_is_sorted_by_path() {
        let mut set = ContentSet::new();
        set.insert("b".into(), entry(1, D1));
        set.insert("a".into(), entry(2, D2));

        let text = encode_listing(&set);
        let first = text.lines().next().unwrap();
        assert!(first.starts_with("a|"));
    }

    #[test]
    fn decode_skips_malformed_lines() {
        let text = format!(
            "good|5|{D1}\nno-pipes-here\nonlyone|7\nbadsize|x|{D2}\nshortdigest|1|abc\n"
        );
        let set = decode_listing(&text);
        assert_eq!(set.len(), 1);
        assert!(set.contains_key("good"));
    }

    #[test]
    fn decode_allows_pipes_in_nothing_but_separators() {
        // Paths with '|' are not produced by the encoder; a line with three
        // pipes parses against the outermost pair and is dropped on the
        // unparsable size.
        let text = format!("we|ird|5|{D1}\n");
        let set = decode_listing(&text);
        assert!(set.is_empty());
    }

    #[test]
    fn normalize_converts_backslashes() {
        assert_eq!(normalize_rel_path("a\\b\\c.mp4"), "a/b/c.mp4");
        assert_eq!(normalize_rel_path("a/b.mp4"), "a/b.mp4");
    }
}
