use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fsio::{read_json, update_json};
use crate::StoreResult;

pub const DEFAULT_GLOBAL_RULES: &str = "Rules for every run:
1. Keep a professional and friendly tone.
2. Give concrete, actionable recommendations.
3. Link to the source whenever you cite one.
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct PromptDocument {
    global_rules: String,
    #[serde(default)]
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for PromptDocument {
    fn default() -> Self {
        Self {
            global_rules: DEFAULT_GLOBAL_RULES.to_string(),
            sections: BTreeMap::new(),
        }
    }
}

/// Operator-editable prompt text layered onto persona backstories.
///
/// Overrides are keyed by section (a pipeline slug) and key (a stage name).
#[derive(Debug)]
pub struct PromptOverrides {
    path: PathBuf,
    document: PromptDocument,
}

impl PromptOverrides {
    /// Open the store, writing the default global rules when the file is absent.
    ///
    /// # Errors
    /// Returns `StoreError` when the file cannot be read, parsed, or bootstrapped.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        if let Some(document) = read_json::<PromptDocument>(&path)? {
            return Ok(Self { path, document });
        }

        let (document, ()) = update_json(&path, |_: &mut PromptDocument| ())?;
        tracing::info!(path = %path.display(), "created default prompt overrides");
        Ok(Self { path, document })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn get_global_rules(&self) -> &str {
        &self.document.global_rules
    }

    /// Override text for `(section, key)`, empty when none is set.
    #[must_use]
    pub fn get_override(&self, section: &str, key: &str) -> &str {
        self.document
            .sections
            .get(section)
            .and_then(|keys| keys.get(key))
            .map_or("", String::as_str)
    }

    /// # Errors
    /// Returns `StoreError` when the change cannot be persisted; the store is then unchanged.
    pub fn set_global_rules(&mut self, text: impl Into<String>) -> StoreResult<()> {
        let text = text.into();
        self.mutate(|document| document.global_rules = text)
    }

    /// # Errors
    /// Returns `StoreError` when the change cannot be persisted; the store is then unchanged.
    pub fn set_override(
        &mut self,
        section: impl Into<String>,
        key: impl Into<String>,
        text: impl Into<String>,
    ) -> StoreResult<()> {
        let (section, key, text) = (section.into(), key.into(), text.into());
        self.mutate(|document| {
            document
                .sections
                .entry(section)
                .or_default()
                .insert(key, text);
        })
    }

    /// `base`, then the global rules, then the `(section, key)` override.
    ///
    /// Parts that are blank after trimming are skipped; the rest are joined
    /// with a blank line.
    #[must_use]
    pub fn get_enhanced_backstory(&self, section: &str, key: &str, base: &str) -> String {
        let mut enhanced = base.to_string();
        let global = self.get_global_rules();
        if !global.trim().is_empty() {
            enhanced.push_str("\n\n");
            enhanced.push_str(global);
        }
        let specific = self.get_override(section, key);
        if !specific.trim().is_empty() {
            enhanced.push_str("\n\n");
            enhanced.push_str(specific);
        }
        enhanced
    }

    #[must_use]
    pub fn sections(&self) -> Vec<&str> {
        self.document.sections.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn section_keys(&self, section: &str) -> Vec<&str> {
        self.document
            .sections
            .get(section)
            .map(|keys| keys.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    fn mutate<F>(&mut self, apply: F) -> StoreResult<()>
    where
        F: FnOnce(&mut PromptDocument),
    {
        let (document, ()) = update_json(&self.path, apply)?;
        self.document = document;
        Ok(())
    }
}
