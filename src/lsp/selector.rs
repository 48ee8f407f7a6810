//! Document selector: decides which documents belong to the session.

/// A single `(scheme, language)` matching rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentFilter {
    /// URI scheme, e.g. `file` or `untitled`.
    pub scheme: String,
    /// Language identifier, e.g. `jusu`.
    pub language: String,
}

impl DocumentFilter {
    /// Creates a filter.
    pub fn new(scheme: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            language: language.into(),
        }
    }

    /// Exact, case-sensitive match on both fields.
    pub fn matches(&self, scheme: &str, language_id: &str) -> bool {
        self.scheme == scheme && self.language == language_id
    }
}

/// A set of filters; a document matches if any filter does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSelector {
    filters: Vec<DocumentFilter>,
}

impl DocumentSelector {
    /// Creates a selector from filters.
    pub fn new(filters: impl IntoIterator<Item = DocumentFilter>) -> Self {
        Self {
            filters: filters.into_iter().collect(),
        }
    }

    /// Selector for on-disk documents of one language.
    pub fn for_language(language: impl Into<String>) -> Self {
        Self::new([DocumentFilter::new("file", language)])
    }

    /// Whether this session is responsible for the document.
    pub fn matches(&self, scheme: &str, language_id: &str) -> bool {
        self.filters.iter().any(|f| f.matches(scheme, language_id))
    }

    /// The configured filters.
    pub fn filters(&self) -> &[DocumentFilter] {
        &self.filters
    }
}

impl Default for DocumentSelector {
    fn default() -> Self {
        Self::for_language("jusu")
    }
}
