//! M3U playlist filter.
//!
//! Keeps only the entries whose `tvg-id`, `tvg-name` or title match the
//! configured channel pattern and rewrites them to the canonical channel
//! identity.  Every other attribute, and any extra `#...` metadata lines
//! between the `#EXTINF` line and the stream URL, are carried over as-is.

use std::sync::LazyLock;

use regex::Regex;

use super::{ContentFilter, FilterError};

const PLAYLIST_HEADER: &str = "#EXTM3U";
const INFO_PREFIX: &str = "#EXTINF";
const TVG_ID: &str = "tvg-id";
const TVG_NAME: &str = "tvg-name";

static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([\w-]+)="([^"]*)""#).expect("attribute regex is valid"));

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PlaylistFilter {
    pattern: Regex,
    tvg_id: String,
    tvg_name: String,
}

impl PlaylistFilter {
    pub fn new(pattern: Regex, tvg_id: impl Into<String>, tvg_name: impl Into<String>) -> Self {
        Self {
            pattern,
            tvg_id: tvg_id.into(),
            tvg_name: tvg_name.into(),
        }
    }

    /// Filter a playlist document.
    ///
    /// The output always starts with `#EXTM3U` and ends with exactly one
    /// newline, even when nothing matched.
    pub fn filter(&self, raw: &str) -> String {
        let mut output: Vec<String> = vec![PLAYLIST_HEADER.to_string()];
        let mut current: Option<Entry<'_>> = None;

        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(PLAYLIST_HEADER) {
                continue;
            }
            if line.starts_with(INFO_PREFIX) {
                current = Some(Entry::parse(line));
                continue;
            }
            if line.starts_with('#') {
                if let Some(entry) = current.as_mut() {
                    entry.extra.push(line);
                }
                continue;
            }

            // Anything else is the stream URL closing the current entry.
            if let Some(entry) = current.take() {
                if entry.matches(&self.pattern) {
                    output.push(self.render_info(&entry));
                    output.extend(entry.extra.iter().map(|meta| meta.to_string()));
                    output.push(line.to_string());
                    output.push(String::new());
                }
            }
        }

        let mut text = output.join("\n").trim().to_string();
        text.push('\n');
        text
    }

    /// Render the `#EXTINF` line of a kept entry with the canonical identity.
    fn render_info(&self, entry: &Entry<'_>) -> String {
        let mut line = String::from("#EXTINF:-1");
        for (key, value) in self.canonical_attrs(&entry.attrs) {
            line.push(' ');
            line.push_str(key);
            line.push_str("=\"");
            line.push_str(value);
            line.push('"');
        }
        line.push(',');
        line.push_str(&self.tvg_name);
        line.trim().to_string()
    }

    /// Overwrite `tvg-id` / `tvg-name` in place, inserting them at the front
    /// (id first, name right after it) when the entry lacks them.
    fn canonical_attrs<'a>(&'a self, attrs: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
        let mut seen_id = false;
        let mut seen_name = false;
        let mut updated: Vec<(&str, &str)> = Vec::with_capacity(attrs.len() + 2);

        for &(key, value) in attrs {
            match key {
                TVG_ID => {
                    updated.push((key, self.tvg_id.as_str()));
                    seen_id = true;
                }
                TVG_NAME => {
                    updated.push((key, self.tvg_name.as_str()));
                    seen_name = true;
                }
                _ => updated.push((key, value)),
            }
        }

        if !seen_id {
            updated.insert(0, (TVG_ID, self.tvg_id.as_str()));
        }
        if !seen_name {
            let at = usize::from(updated.first().is_some_and(|(key, _)| *key == TVG_ID));
            updated.insert(at, (TVG_NAME, self.tvg_name.as_str()));
        }
        updated
    }
}

impl ContentFilter for PlaylistFilter {
    fn apply(&self, raw: &[u8]) -> Result<Vec<u8>, FilterError> {
        Ok(self.filter(&String::from_utf8_lossy(raw)).into_bytes())
    }
}

// ---------------------------------------------------------------------------
// Entry parsing
// ---------------------------------------------------------------------------

/// One `#EXTINF` line plus the metadata lines that follow it.
#[derive(Debug)]
struct Entry<'a> {
    attrs: Vec<(&'a str, &'a str)>,
    title: &'a str,
    extra: Vec<&'a str>,
}

impl<'a> Entry<'a> {
    fn parse(line: &'a str) -> Self {
        let (meta, title) = split_title(line);
        let attrs = ATTR_RE
            .captures_iter(meta)
            .filter_map(|caps| Some((caps.get(1)?.as_str(), caps.get(2)?.as_str())))
            .collect();
        Self {
            attrs,
            title,
            extra: Vec::new(),
        }
    }

    /// Last occurrence wins when an attribute is repeated.
    fn attr(&self, key: &str) -> Option<&'a str> {
        self.attrs
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    fn matches(&self, pattern: &Regex) -> bool {
        [self.attr(TVG_ID), self.attr(TVG_NAME), Some(self.title)]
            .into_iter()
            .flatten()
            .any(|text| !text.is_empty() && pattern.is_match(text))
    }
}

/// Split an `#EXTINF` line at the first comma outside a quoted attribute
/// value.  Returns `(attributes, title)`; the title is empty when there is
/// no such comma.
fn split_title(line: &str) -> (&str, &str) {
    let mut quoted = false;
    for (idx, ch) in line.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            ',' if !quoted => return (&line[..idx], line[idx + 1..].trim()),
            _ => {}
        }
    }
    (line, "")
}
