/// Line preprocessing: strip terminal color escapes before matching.
use regex::Regex;
use std::borrow::Cow;

/// Standard CSI form: `ESC [ params letter`.
pub const DEFAULT_ESCAPE_PATTERN: &str = r"\x1b\[[0-9;?]*[A-Za-z]";

/// Removes color-escape sequences from raw log lines.
///
/// An empty pattern disables stripping entirely and lines pass through
/// unchanged.
#[derive(Debug, Clone)]
pub struct LinePreprocessor {
    escape: Option<Regex>,
}

impl LinePreprocessor {
    pub fn new(escape_pattern: &str) -> Result<Self, regex::Error> {
        let escape = if escape_pattern.is_empty() {
            None
        } else {
            Some(Regex::new(escape_pattern)?)
        };
        Ok(Self { escape })
    }

    /// Remove every non-overlapping escape match from `raw`.
    pub fn clean<'a>(&self, raw: &'a str) -> Cow<'a, str> {
        match &self.escape {
            Some(re) => re.replace_all(raw, ""),
            None => Cow::Borrowed(raw),
        }
    }
}

impl Default for LinePreprocessor {
    fn default() -> Self {
        Self {
            escape: Some(Regex::new(DEFAULT_ESCAPE_PATTERN).unwrap()),
        }
    }
}
