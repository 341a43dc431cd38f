//! Prompt sequence files for `chronos run --sequence`.
//!
//! ```toml
//! [[prompts]]
//! name = "plan"
//! prompt = "Write a plan to PLAN.md"
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::core::session::PromptStep;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SequenceFile {
    prompts: Vec<SequenceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SequenceEntry {
    name: Option<String>,
    prompt: String,
}

/// Load and validate a sequence. Unnamed steps become `step-<n>`.
pub fn load_sequence(path: &Path) -> Result<Vec<PromptStep>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_sequence(&contents).with_context(|| format!("invalid sequence {}", path.display()))
}

fn parse_sequence(contents: &str) -> Result<Vec<PromptStep>> {
    let file: SequenceFile = toml::from_str(contents).context("parse sequence toml")?;
    if file.prompts.is_empty() {
        return Err(anyhow!("sequence must contain at least one [[prompts]] entry"));
    }

    let mut seen = HashSet::new();
    let mut steps = Vec::with_capacity(file.prompts.len());
    for (idx, entry) in file.prompts.into_iter().enumerate() {
        let name = entry
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("step-{}", idx + 1));
        if entry.prompt.trim().is_empty() {
            return Err(anyhow!("prompt {name} is empty"));
        }
        if !seen.insert(name.clone()) {
            return Err(anyhow!("duplicate prompt name {name}"));
        }
        steps.push(PromptStep {
            name,
            prompt: entry.prompt.trim().to_string(),
        });
    }
    Ok(steps)
}
