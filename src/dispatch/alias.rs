//! Notification name normalisation.
//!
//! Older workers emit `event.*` names.  The alias table rewrites them to the
//! canonical `topic:event` form before anything else looks at the message,
//! so dedup and session filtering never need to know about legacy names.
//! Empty the table once no legacy worker is left in the field.

use std::collections::HashMap;

use crate::config::DispatchConfig;

use super::payload::{
    AUDIO_LEVEL, MODEL_PROGRESS, STATE_CHANGED, TRANSCRIPT_COMPLETE, TRANSCRIPT_ERROR,
};

/// `event.*` → canonical pairs understood by default.
pub const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("event.status_changed", STATE_CHANGED),
    ("event.audio_level", AUDIO_LEVEL),
    ("event.transcription_complete", TRANSCRIPT_COMPLETE),
    ("event.transcription_error", TRANSCRIPT_ERROR),
    ("event.model_progress", MODEL_PROGRESS),
];

#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    map: HashMap<String, String>,
}

impl AliasTable {
    /// No aliases: every name is already canonical.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn legacy() -> Self {
        let mut table = Self::empty();
        for (alias, canonical) in LEGACY_ALIASES {
            table.insert(*alias, *canonical);
        }
        table
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        let mut table = if config.legacy_aliases {
            Self::legacy()
        } else {
            Self::empty()
        };
        for (alias, canonical) in &config.aliases {
            table.insert(alias.clone(), canonical.clone());
        }
        table
    }

    pub fn insert(&mut self, alias: impl Into<String>, canonical: impl Into<String>) {
        self.map.insert(alias.into(), canonical.into());
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Canonical name for `method`; unknown names pass through unchanged.
    pub fn normalize<'a>(&'a self, method: &'a str) -> &'a str {
        self.map.get(method).map(String::as_str).unwrap_or(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_names_are_rewritten() {
        let table = AliasTable::legacy();
        assert_eq!(table.normalize("event.transcription_complete"), "transcript:complete");
        assert_eq!(table.normalize("event.status_changed"), "state:changed");
        assert_eq!(table.normalize("transcript:complete"), "transcript:complete");
    }

    #[test]
    fn empty_table_passes_everything_through() {
        let table = AliasTable::empty();
        assert!(table.is_empty());
        assert_eq!(table.normalize("event.audio_level"), "event.audio_level");
    }

    #[test]
    fn config_can_disable_legacy_and_add_custom() {
        let mut config = DispatchConfig {
            legacy_aliases: false,
            ..DispatchConfig::default()
        };
        config
            .aliases
            .insert("asr.done".into(), "transcript:complete".into());

        let table = AliasTable::from_config(&config);
        assert_eq!(table.normalize("asr.done"), "transcript:complete");
        assert_eq!(table.normalize("event.audio_level"), "event.audio_level");
    }
}
