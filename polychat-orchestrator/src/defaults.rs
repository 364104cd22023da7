//! Layered per-model defaults.

use regex::Regex;
use shared::models::{COMMON_DEFAULT_ID, DefaultEntry, DefaultOverrides};
use tracing::warn;

use crate::errors::{OrchestratorError, OrchestratorResult};

/// Compiled form of an entry pattern.
#[derive(Debug, Clone)]
enum Matcher {
    /// Empty pattern, matches every model.
    Always,
    Pattern(Regex),
    /// A stored pattern that does not compile. Never matches.
    Invalid,
}

impl Matcher {
    fn compile(entry: &DefaultEntry) -> Self {
        if entry.pattern.is_empty() {
            return Self::Always;
        }
        match Regex::new(&entry.pattern) {
            Ok(pattern) => Self::Pattern(pattern),
            Err(err) => {
                warn!(default = %entry.id, error = %err, "default has an invalid pattern and will never match");
                Self::Invalid
            }
        }
    }

    fn matches(&self, model_id: &str) -> bool {
        match self {
            Self::Always => true,
            Self::Pattern(pattern) => pattern.is_match(model_id),
            Self::Invalid => false,
        }
    }
}

/// User-managed default entries. The `common` entry always exists, has an
/// empty pattern and forms the base every model starts from. Patterns are
/// compiled once, when an entry is loaded or upserted.
#[derive(Debug, Clone)]
pub struct DefaultsRegistry {
    entries: Vec<DefaultEntry>,
    /// One per entry, same order.
    matchers: Vec<Matcher>,
}

impl Default for DefaultsRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl DefaultsRegistry {
    /// Builds the registry, inserting the `common` entry when absent and
    /// forcing its pattern to empty.
    #[must_use]
    pub fn new(entries: Vec<DefaultEntry>) -> Self {
        let mut entries = entries;
        match entries.iter_mut().find(|entry| entry.is_common()) {
            Some(common) => common.pattern.clear(),
            None => entries.insert(0, DefaultEntry::common()),
        }
        let matchers = entries.iter().map(Matcher::compile).collect();
        Self { entries, matchers }
    }

    /// Every entry, `common` included, in registry order.
    #[must_use]
    pub fn entries(&self) -> &[DefaultEntry] {
        &self.entries
    }

    /// The entry with `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&DefaultEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Inserts or replaces an entry by id.
    ///
    /// # Errors
    /// Fails when the pattern is not a valid regex, or when the update would
    /// give the `common` entry a non-empty pattern.
    pub fn upsert(&mut self, entry: DefaultEntry) -> OrchestratorResult<()> {
        if entry.is_common() && !entry.pattern.is_empty() {
            return Err(OrchestratorError::Config(format!(
                "the '{COMMON_DEFAULT_ID}' default must keep an empty pattern"
            )));
        }
        let matcher = if entry.pattern.is_empty() {
            Matcher::Always
        } else {
            Regex::new(&entry.pattern).map(Matcher::Pattern).map_err(|err| {
                OrchestratorError::Config(format!("invalid pattern for default '{}': {err}", entry.id))
            })?
        };

        match self.entries.iter().position(|existing| existing.id == entry.id) {
            Some(index) => {
                self.entries[index] = entry;
                self.matchers[index] = matcher;
            }
            None => {
                self.entries.push(entry);
                self.matchers.push(matcher);
            }
        }
        Ok(())
    }

    /// Removes an entry and returns it.
    ///
    /// # Errors
    /// The `common` entry cannot be removed; unknown ids yield `NotFound`.
    pub fn remove(&mut self, id: &str) -> OrchestratorResult<DefaultEntry> {
        if id == COMMON_DEFAULT_ID {
            return Err(OrchestratorError::Config(format!(
                "the '{COMMON_DEFAULT_ID}' default cannot be removed"
            )));
        }
        let index = self
            .entries
            .iter()
            .position(|entry| entry.id == id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("default '{id}'")))?;
        self.matchers.remove(index);
        Ok(self.entries.remove(index))
    }

    /// The matched default for `model_id`: `common` first, then every entry
    /// whose pattern matches, in registry order, layered field by field.
    #[must_use]
    pub fn resolve(&self, model_id: &str) -> DefaultOverrides {
        let mut merged = self
            .entries
            .iter()
            .find(|entry| entry.is_common())
            .map(|entry| entry.overrides.clone())
            .unwrap_or_default();

        for (entry, matcher) in self.entries.iter().zip(&self.matchers) {
            if !entry.is_common() && matcher.matches(model_id) {
                merged.layer(&entry.overrides);
            }
        }

        merged
    }
}
