use crate::errors::Result;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Human-readable descriptions of mower message codes.
///
/// Loaded from a tab-separated file of `code<TAB>description` lines. Lines
/// that do not start with an integer code are ignored.
#[derive(Debug, Clone, Default)]
pub struct MessageCatalog {
    descriptions: HashMap<i64, String>,
}

impl MessageCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Self {
        let descriptions = text
            .lines()
            .filter_map(|line| {
                let (code, description) = line.split_once('\t')?;
                let code = code.trim().parse::<i64>().ok()?;
                let description = description.trim();
                (!description.is_empty()).then(|| (code, description.to_string()))
            })
            .collect();
        Self { descriptions }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let catalog = Self::parse(&text);
        if catalog.is_empty() {
            warn!("No message descriptions found in {}", path.display());
        } else {
            info!(
                "Loaded {} message descriptions from {}",
                catalog.len(),
                path.display()
            );
        }
        Ok(catalog)
    }

    pub fn describe(&self, code: i64) -> Option<&str> {
        self.descriptions.get(&code).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.descriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptions.is_empty()
    }
}

/// Display glyph for a message severity. Unrecognized values get `❓`.
pub fn severity_symbol(severity: &str) -> &'static str {
    match severity.trim().to_ascii_uppercase().as_str() {
        "FATAL" => "💀",
        "ERROR" => "❌",
        "WARNING" => "⚠️",
        "INFO" => "ℹ️",
        "DEBUG" => "🐛",
        "SW" => "📦",
        _ => "❓",
    }
}
