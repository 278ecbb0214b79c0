// src/router.rs
use crate::handler::HandlerFunction;

#[derive(Clone, Debug)]
pub struct HandlerEntry {
    prefix: String,
    function: HandlerFunction,
}

impl HandlerEntry {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn function(&self) -> &HandlerFunction {
        &self.function
    }

    pub fn is_proxy_handler(&self) -> bool {
        self.function.is_proxy()
    }
}

/// Prefix-indexed handler table.
///
/// Entries are kept ordered by descending prefix length; insertion is stable
/// so among equal-length prefixes the first registered wins.
#[derive(Clone, Debug, Default)]
pub struct HandlerRegistry {
    base_uri: String,
    entries: Vec<HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new(base_uri: impl Into<String>) -> Self {
        Self {
            base_uri: base_uri.into(),
            entries: Vec::new(),
        }
    }

    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    pub fn add(&mut self, prefix: &str, function: HandlerFunction) {
        let prefix = format!("{}{}", self.base_uri, prefix);
        let idx = self
            .entries
            .iter()
            .position(|e| e.prefix.len() < prefix.len())
            .unwrap_or(self.entries.len());
        self.entries.insert(idx, HandlerEntry { prefix, function });
    }

    /// Longest registered prefix of `uri`.
    pub fn handler_for(&self, uri: &str) -> Option<&HandlerEntry> {
        self.entries.iter().find(|e| uri.starts_with(&e.prefix))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HandlerEntry> {
        self.entries.iter()
    }
}
