//! Inline position tags.
//!
//! Extracted text carries its layout as markers of the form
//! `@@<page>\t<x0>\t<y0>\t<x1>\t<y1>##`, appended to the line they describe.
//! Pages are 1-based; coordinates are document points with y growing
//! downwards and pages stacked into one continuous vertical space.
//!
//! A marker that does not fit this grammar is ordinary text.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

pub const TAG_OPEN: &str = "@@";
pub const TAG_CLOSE: &str = "##";

const NUM: &str = r"(-?[0-9.]+)";

static TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"@@(-?[0-9]+)[ \t]+{NUM}[ \t]+{NUM}[ \t]+{NUM}[ \t]+{NUM}##"
    ))
    .expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionTag {
    pub page: i32,
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl PositionTag {
    pub fn new(page: i32, x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self {
            page,
            x0,
            y0,
            x1,
            y1,
        }
    }

    pub fn bbox(&self) -> [f64; 4] {
        [self.x0, self.y0, self.x1, self.y1]
    }

    /// Zero-based page index, `None` for pages below 1.
    pub fn page_index(&self) -> Option<usize> {
        if self.page >= 1 {
            Some(self.page as usize - 1)
        } else {
            None
        }
    }

    fn from_captures(caps: &regex::Captures<'_>) -> Option<Self> {
        let page = caps.get(1)?.as_str().parse().ok()?;
        let mut coords = [0f64; 4];
        for (slot, group) in coords.iter_mut().zip(2..=5) {
            *slot = caps.get(group)?.as_str().parse().ok()?;
        }
        Some(Self::new(page, coords[0], coords[1], coords[2], coords[3]))
    }
}

impl fmt::Display for PositionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{TAG_OPEN}{}\t{:.1}\t{:.1}\t{:.1}\t{:.1}{TAG_CLOSE}",
            self.page, self.x0, self.y0, self.x1, self.y1
        )
    }
}

impl FromStr for PositionTag {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match scan(trimmed).as_slice() {
            [(range, tag)] if range.start == 0 && range.end == trimmed.len() => Ok(*tag),
            _ => Err(PolicyError::InvalidTag(s.to_string())),
        }
    }
}

/// Text with its position tags lifted out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaggedText {
    pub plain: String,
    pub tags: Vec<PositionTag>,
}

impl TaggedText {
    pub fn parse(text: &str) -> Self {
        let mut plain = String::with_capacity(text.len());
        let mut tags = Vec::new();
        let mut cursor = 0usize;
        for (range, tag) in scan(text) {
            plain.push_str(&text[cursor..range.start]);
            cursor = range.end;
            tags.push(tag);
        }
        plain.push_str(&text[cursor..]);
        Self { plain, tags }
    }
}

/// Every well-formed tag in `text` with its byte range, in order.
pub fn scan(text: &str) -> Vec<(Range<usize>, PositionTag)> {
    TAG_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            PositionTag::from_captures(&caps).map(|tag| (whole.range(), tag))
        })
        .collect()
}

pub fn parse_tags(text: &str) -> Vec<PositionTag> {
    scan(text).into_iter().map(|(_, tag)| tag).collect()
}

pub fn strip_tags(text: &str) -> String {
    TaggedText::parse(text).plain
}

/// The tag at the very start of `text`, with the byte offset just past it.
pub fn leading_tag(text: &str) -> Option<(PositionTag, usize)> {
    scan(text)
        .into_iter()
        .next()
        .filter(|(range, _)| range.start == 0)
        .map(|(range, tag)| (tag, range.end))
}

/// Drops a tag at the start of `text` together with the whitespace after it.
pub fn strip_leading_tag(text: &str) -> &str {
    match leading_tag(text) {
        Some((_, end)) => text[end..].trim_start(),
        None => text,
    }
}

/// Raw source of the tag at the start of `text`, as written.
pub fn leading_tag_source(text: &str) -> Option<&str> {
    leading_tag(text).map(|(_, end)| &text[..end])
}
