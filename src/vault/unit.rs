//! Unit-of-work files: a `---` delimited `key: value` header followed by a
//! free-text markdown body.
//!
//! Parsing never fails. A file with no opening marker, or with an opening
//! marker that is never closed, has empty metadata and the whole text is its
//! body. Header lines the parser does not understand are kept verbatim, and
//! an unmodified file renders back to exactly the bytes it was parsed from.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::UnitError;

/// Header delimiter line.
pub const HEADER_MARKER: &str = "---";

/// Flattened header fields, last occurrence wins.
pub type Metadata = BTreeMap<String, String>;

/// Well-known metadata keys.
pub mod keys {
    pub const TYPE: &str = "type";
    pub const STATUS: &str = "status";
    pub const PRIORITY: &str = "priority";
    pub const PLATFORM: &str = "platform";
    pub const CREATED_AT: &str = "created_at";
    pub const ERROR: &str = "error";
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HeaderLine {
    Field {
        key: String,
        value: String,
        /// Original text including its line ending; `None` once edited.
        raw: Option<String>,
    },
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    open: String,
    lines: Vec<HeaderLine>,
    close: String,
    newline: &'static str,
}

impl Header {
    fn empty() -> Self {
        Self {
            open: format!("{HEADER_MARKER}\n"),
            lines: Vec::new(),
            close: format!("{HEADER_MARKER}\n"),
            newline: "\n",
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        let value = value.replace(['\r', '\n'], " ");
        let mut found = false;
        for line in &mut self.lines {
            if let HeaderLine::Field { key: k, value: v, raw } = line {
                if k != key {
                    continue;
                }
                if *v != value {
                    *v = value.clone();
                    *raw = None;
                }
                found = true;
            }
        }
        if !found {
            self.lines.push(HeaderLine::Field {
                key: key.to_string(),
                value,
                raw: None,
            });
        }
    }

    fn render_into(&self, out: &mut String) {
        out.push_str(&self.open);
        for line in &self.lines {
            match line {
                HeaderLine::Field {
                    raw: Some(raw), ..
                } => out.push_str(raw),
                HeaderLine::Field { key, value, raw: None } => {
                    out.push_str(key);
                    out.push_str(": ");
                    out.push_str(value);
                    out.push_str(self.newline);
                }
                HeaderLine::Other(raw) => out.push_str(raw),
            }
        }
        // A closing marker at EOF has no line ending of its own.
        out.push_str(&self.close);
    }
}

/// A parsed unit-of-work file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFile {
    header: Option<Header>,
    body: String,
}

impl UnitFile {
    /// A fresh unit stamped with `type`, `status: pending` and `created_at`.
    pub fn new<I, K, V>(kind: &str, fields: I, body: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut header = Header::empty();
        header.set(keys::TYPE, kind);
        header.set(keys::STATUS, "pending");
        header.set(keys::CREATED_AT, &Utc::now().to_rfc3339());
        for (key, value) in fields {
            let key = key.into();
            header.set(&key, &value.into());
        }
        Self {
            header: Some(header),
            body: body.into(),
        }
    }

    /// Parse file text. Total: never fails.
    pub fn parse(text: &str) -> Self {
        let mut lines = text.split_inclusive('\n');

        let Some(first) = lines.next() else {
            return Self::headerless(text);
        };
        if first.trim_end() != HEADER_MARKER {
            return Self::headerless(text);
        }
        let newline = if first.ends_with("\r\n") { "\r\n" } else { "\n" };

        let mut header_lines = Vec::new();
        let mut consumed = first.len();
        for line in lines {
            consumed += line.len();
            if line.trim_end() == HEADER_MARKER {
                return Self {
                    header: Some(Header {
                        open: first.to_string(),
                        lines: header_lines,
                        close: line.to_string(),
                        newline,
                    }),
                    body: text[consumed..].to_string(),
                };
            }
            header_lines.push(parse_header_line(line));
        }

        warn!("Unterminated metadata header, treating as empty metadata");
        Self::headerless(text)
    }

    fn headerless(text: &str) -> Self {
        Self {
            header: None,
            body: text.to_string(),
        }
    }

    /// Render back to file text.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 256);
        if let Some(header) = &self.header {
            header.render_into(&mut out);
            if !header.close.ends_with('\n') && !self.body.is_empty() {
                out.push_str(header.newline);
            }
        }
        out.push_str(&self.body);
        out
    }

    pub fn has_header(&self) -> bool {
        self.header.is_some()
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Value of a header field (last occurrence).
    pub fn get(&self, key: &str) -> Option<&str> {
        let header = self.header.as_ref()?;
        header.lines.iter().rev().find_map(|line| match line {
            HeaderLine::Field { key: k, value, .. } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Non-empty value of a header field.
    pub fn get_nonempty(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn metadata(&self) -> Metadata {
        let mut map = Metadata::new();
        if let Some(header) = &self.header {
            for line in &header.lines {
                if let HeaderLine::Field { key, value, .. } = line {
                    map.insert(key.clone(), value.clone());
                }
            }
        }
        map
    }

    /// Merge `patch` into the header. Keys not in the patch and the body are
    /// left untouched. Returns false (and changes nothing) for an empty patch.
    pub fn apply_patch<I, K, V>(&mut self, patch: I) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut patch = patch.into_iter().peekable();
        if patch.peek().is_none() {
            return false;
        }
        let header = self.header.get_or_insert_with(Header::empty);
        for (key, value) in patch {
            let key = key.into();
            header.set(key.trim(), &value.into());
        }
        true
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.apply_patch([(key, value.into())]);
    }

    /// Text under a markdown heading (`## Post Content`), up to the next
    /// heading of the same or higher level. Matching is case-insensitive.
    pub fn section(&self, heading: &str) -> Option<String> {
        let mut level = None;
        let mut collected = String::new();

        for line in self.body.lines() {
            let trimmed = line.trim_start();
            let hashes = trimmed.chars().take_while(|c| *c == '#').count();
            let is_heading = hashes > 0 && trimmed[hashes..].starts_with(' ');

            match level {
                None => {
                    if is_heading && trimmed[hashes..].trim().eq_ignore_ascii_case(heading) {
                        level = Some(hashes);
                    }
                }
                Some(open) => {
                    if is_heading && hashes <= open {
                        break;
                    }
                    collected.push_str(line);
                    collected.push('\n');
                }
            }
        }

        level.map(|_| collected.trim().to_string())
    }
}

fn parse_header_line(line: &str) -> HeaderLine {
    let content = line.trim_end_matches(['\n', '\r']);
    if let Some((key, value)) = content.split_once(':') {
        let key = key.trim();
        if !key.is_empty()
            && !content.starts_with(char::is_whitespace)
            && !key.starts_with('#')
            && !key.contains(char::is_whitespace)
        {
            return HeaderLine::Field {
                key: key.to_string(),
                value: unquote(value.trim()).to_string(),
                raw: Some(line.to_string()),
            };
        }
    }
    HeaderLine::Other(line.to_string())
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Read and parse a unit file. Invalid UTF-8 is replaced, never rejected.
pub async fn read_unit(path: &Path) -> Result<UnitFile, UnitError> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| UnitError::io(path, e))?;
    Ok(UnitFile::parse(&String::from_utf8_lossy(&bytes)))
}

/// Write a unit through a temp file in the same directory and rename it into
/// place, so readers never observe a partial file.
pub async fn write_unit_atomic(path: &Path, unit: &UnitFile) -> Result<(), UnitError> {
    write_atomic(path, unit.render().as_bytes()).await
}

pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), UnitError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{file_name}.{}.tmp", short_id()));

    fs::write(&tmp, contents)
        .await
        .map_err(|e| UnitError::io(&tmp, e))?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(UnitError::io(path, e));
    }
    Ok(())
}

/// Merge `patch` into the header of the file at `path`.
///
/// An empty patch is a no-op: the file is not even read, so its bytes are
/// guaranteed unchanged. A missing or malformed header is treated as empty
/// metadata and a new header is written above the untouched body.
pub async fn update_metadata<I, K, V>(path: &Path, patch: I) -> Result<(), UnitError>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let patch: Vec<(String, String)> = patch
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    if patch.is_empty() {
        return Ok(());
    }

    let mut unit = read_unit(path).await?;
    if !unit.has_header() {
        debug!(file = %path.display(), "No metadata header, creating one");
    }
    unit.apply_patch(patch);
    write_unit_atomic(path, &unit).await
}

/// Collision-resistant file name: `<KIND>_<YYYYMMDD_HHMMSS>_<8 hex>.md`.
pub fn unit_file_name(kind: &str) -> String {
    let kind: String = kind
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    let kind = if kind.is_empty() { "UNIT".to_string() } else { kind };
    format!(
        "{}_{}_{}.md",
        kind,
        Utc::now().format("%Y%m%d_%H%M%S"),
        short_id()
    )
}

pub(crate) fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "---\ntype: email\nfrom: alice@example.com\n# note\n  continued\nsubject: \"Invoice: March\"\n---\n\n# Email\n\nHello there.\n";

    #[test]
    fn parse_reads_fields_and_body() {
        let unit = UnitFile::parse(SAMPLE);
        assert_eq!(unit.get("type"), Some("email"));
        assert_eq!(unit.get("from"), Some("alice@example.com"));
        assert_eq!(unit.get("subject"), Some("Invoice: March"));
        assert_eq!(unit.body(), "\n# Email\n\nHello there.\n");
        assert_eq!(unit.metadata().len(), 3);
    }

    #[test]
    fn render_is_exact_inverse() {
        for text in [
            SAMPLE,
            "no header at all\n",
            "---\nunterminated: yes\nbody\n",
            "---\r\nkey: value\r\n---\r\nbody\r\n",
            "---\nkey: v\n---",
            "",
        ] {
            assert_eq!(UnitFile::parse(text).render(), text);
        }
    }

    #[test]
    fn missing_header_is_empty_metadata() {
        let unit = UnitFile::parse("# Just a note\n\nkey: not metadata\n");
        assert!(!unit.has_header());
        assert!(unit.metadata().is_empty());
    }

    #[test]
    fn unterminated_header_is_empty_metadata() {
        let unit = UnitFile::parse("---\ntype: email\nno closing marker\n");
        assert!(!unit.has_header());
        assert!(unit.metadata().is_empty());
    }

    #[test]
    fn patch_preserves_unknown_lines_and_body() {
        let mut unit = UnitFile::parse(SAMPLE);
        assert!(unit.apply_patch([("status", "done"), ("type", "email")]));

        let rendered = unit.render();
        assert!(rendered.contains("# note\n  continued\n"));
        assert!(rendered.contains("subject: \"Invoice: March\"\n"));
        assert!(rendered.contains("status: done\n"));
        assert!(rendered.ends_with("---\n\n# Email\n\nHello there.\n"));
    }

    #[test]
    fn patch_adds_header_to_headerless_file() {
        let mut unit = UnitFile::parse("plain body\n");
        unit.set("status", "failed");
        assert_eq!(unit.render(), "---\nstatus: failed\n---\nplain body\n");
    }

    #[test]
    fn empty_patch_is_noop() {
        let mut unit = UnitFile::parse(SAMPLE);
        let patch: Vec<(String, String)> = Vec::new();
        assert!(!unit.apply_patch(patch));
        assert_eq!(unit.render(), SAMPLE);
    }

    #[test]
    fn values_with_newlines_stay_on_one_line() {
        let mut unit = UnitFile::parse("---\n---\n");
        unit.set("error", "line one\nline two");
        assert_eq!(unit.get("error"), Some("line one line two"));
        assert_eq!(unit.render(), "---\nerror: line one line two\n---\n");
    }

    #[test]
    fn new_unit_is_stamped() {
        let unit = UnitFile::new("email", [("from", "bob@example.com")], "Body\n");
        assert_eq!(unit.get(keys::TYPE), Some("email"));
        assert_eq!(unit.get(keys::STATUS), Some("pending"));
        assert!(unit.get(keys::CREATED_AT).is_some());
        assert_eq!(unit.get("from"), Some("bob@example.com"));

        let reparsed = UnitFile::parse(&unit.render());
        assert_eq!(reparsed.metadata(), unit.metadata());
        assert_eq!(reparsed.body(), "Body\n");
    }

    #[test]
    fn section_extracts_until_next_heading() {
        let unit = UnitFile::parse(
            "---\nplatform: twitter\n---\n# Post\n\n## Post Content\n\nShipping today!\n#launch\n\n## Notes\nignored\n",
        );
        assert_eq!(
            unit.section("post content").as_deref(),
            Some("Shipping today!\n#launch")
        );
        assert_eq!(unit.section("Notes").as_deref(), Some("ignored"));
        assert_eq!(unit.section("Missing"), None);
    }

    #[test]
    fn file_names_are_distinct() {
        let a = unit_file_name("email");
        let b = unit_file_name("email");
        assert!(a.starts_with("EMAIL_"));
        assert!(a.ends_with(".md"));
        assert_ne!(a, b);
        assert!(unit_file_name("linkedin post").starts_with("LINKEDIN_POST_"));
    }

    #[tokio::test]
    async fn update_metadata_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("EMAIL_1.md");
        fs::write(&path, SAMPLE).await.unwrap();

        update_metadata(&path, [("priority", "high")]).await.unwrap();

        let unit = read_unit(&path).await.unwrap();
        assert_eq!(unit.get("priority"), Some("high"));
        assert_eq!(unit.get("from"), Some("alice@example.com"));

        // No temp files left behind.
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["EMAIL_1.md".to_string()]);
    }

    #[tokio::test]
    async fn empty_update_leaves_bytes_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("odd.md");
        let original = b"no marker here\r\n\xff trailing";
        fs::write(&path, original).await.unwrap();

        update_metadata(&path, Vec::<(String, String)>::new())
            .await
            .unwrap();

        assert_eq!(fs::read(&path).await.unwrap(), original);
    }

    #[tokio::test]
    async fn update_missing_file_reports_not_found() {
        let dir = TempDir::new().unwrap();
        let err = update_metadata(&dir.path().join("gone.md"), [("a", "b")])
            .await
            .unwrap_err();
        assert!(matches!(err, UnitError::NotFound(_)));
    }
}
