//! Markdown document model.
//!
//! A document is an ordered list of sections. Text before the first `## `
//! heading is the `introduction` section; every level-2 heading opens a new
//! section keyed by the slug of its heading.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Key used for the text that precedes the first heading.
pub const INTRODUCTION_KEY: &str = "introduction";

/// An addressable unit of the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    /// Stable key, unique within the document
    pub key: String,
    /// Heading text without the `## ` marker; `None` for the introduction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
    /// Body text below the heading
    pub body: String,
}

impl Section {
    pub fn new(key: &str, heading: Option<&str>, body: &str) -> Self {
        Self {
            key: key.to_string(),
            heading: heading.map(str::to_string),
            body: body.to_string(),
        }
    }

    /// Render the section as markdown (heading line plus body).
    pub fn text(&self) -> String {
        match &self.heading {
            Some(heading) if self.body.is_empty() => format!("## {}", heading),
            Some(heading) => format!("## {}\n\n{}", heading, self.body),
            None => self.body.clone(),
        }
    }

    /// Rebuild a section from its rendered text, keeping the given key.
    pub fn from_text(key: &str, text: &str) -> Self {
        let text = text.trim();
        match text.strip_prefix("## ") {
            Some(rest) => {
                let (heading, body) = rest.split_once('\n').unwrap_or((rest, ""));
                Self::new(key, Some(heading.trim()), body.trim())
            }
            None => Self::new(key, None, text),
        }
    }

    pub fn content_hash(&self) -> String {
        content_hash(&self.text())
    }
}

/// An ordered sequence of sections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub sections: Vec<Section>,
}

impl Document {
    pub fn new(sections: Vec<Section>) -> Self {
        Self { sections }
    }

    /// Parse markdown into sections.
    pub fn parse(markdown: &str) -> Self {
        let normalized = markdown.replace("\r\n", "\n");
        let mut sections: Vec<Section> = Vec::new();
        let mut heading: Option<String> = None;
        let mut body: Vec<&str> = Vec::new();

        for line in normalized.lines() {
            if let Some(title) = line.strip_prefix("## ") {
                push_section(&mut sections, heading.take(), &body);
                body.clear();
                heading = Some(title.trim().to_string());
            } else {
                body.push(line);
            }
        }
        push_section(&mut sections, heading, &body);

        Self { sections }
    }

    /// Parse transformer output, honouring an optional `<document>` envelope.
    pub fn from_transform_output(output: &str) -> Self {
        Self::parse(extract_document(output))
    }

    pub fn render(&self) -> String {
        self.sections
            .iter()
            .map(Section::text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(|s| s.text().trim().is_empty())
    }

    pub fn section(&self, key: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.key == key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.sections.iter().map(|s| s.key.clone()).collect()
    }

    pub fn content_hash(&self) -> String {
        content_hash(&self.render())
    }

    /// Sections of `self` that are new or differ from the same key in `previous`.
    /// Returns `(position, section)` pairs in document order.
    pub fn changed_sections<'a>(&'a self, previous: &Document) -> Vec<(usize, &'a Section)> {
        self.sections
            .iter()
            .enumerate()
            .filter(|(_, section)| {
                previous
                    .section(&section.key)
                    .is_none_or(|old| old.text() != section.text())
            })
            .collect()
    }
}

fn push_section(sections: &mut Vec<Section>, heading: Option<String>, body: &[&str]) {
    let body = body.join("\n").trim().to_string();
    let key = match &heading {
        Some(title) => unique_key(sections, &slugify(title)),
        None if body.is_empty() => return,
        None => unique_key(sections, INTRODUCTION_KEY),
    };
    sections.push(Section {
        key,
        heading,
        body,
    });
}

fn unique_key(sections: &[Section], base: &str) -> String {
    let base = if base.is_empty() { "section" } else { base };
    if !sections.iter().any(|s| s.key == base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !sections.iter().any(|s| &s.key == candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Convert a heading to a URL-safe slug.
pub fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Return the text inside the first `<document>...</document>` envelope.
///
/// Tags mentioned after the envelope are ignored. An unclosed envelope runs to
/// the end of the output; no envelope at all yields the whole output.
pub fn extract_document(output: &str) -> &str {
    const OPEN: &str = "<document>";
    const CLOSE: &str = "</document>";
    match output.find(OPEN) {
        Some(start) => {
            let inner = &output[start + OPEN.len()..];
            inner.find(CLOSE).map_or(inner, |end| &inner[..end]).trim()
        }
        None => output.trim(),
    }
}

/// Hex SHA-256 of content normalized for line endings and trailing whitespace.
pub fn content_hash(content: &str) -> String {
    let normalized = content
        .replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    let mut hasher = Sha256::new();
    hasher.update(normalized.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}
