//! Continuation prompt rendered for each turn.

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};

use crate::core::classifier::CURSOR_PREFIX;
use crate::core::session::Session;

const CONTINUATION_TEMPLATE: &str = include_str!("prompts/continuation.md");

/// Template engine wrapper around minijinja.
pub struct PromptRenderer {
    env: Environment<'static>,
    completion_marker: String,
}

impl PromptRenderer {
    pub fn new(completion_marker: &str) -> Self {
        let mut env = Environment::new();
        env.add_template("continuation", CONTINUATION_TEMPLATE)
            .expect("continuation template should be valid");
        Self {
            env,
            completion_marker: completion_marker.to_string(),
        }
    }

    /// Render the prompt for the session's current step and cursor.
    pub fn render(&self, session: &Session) -> Result<String> {
        let step = session.current_step().ok_or_else(|| {
            anyhow!(
                "session {} has no step at index {}",
                session.session_id,
                session.step_index
            )
        })?;
        let template = self.env.get_template("continuation")?;
        let rendered = template
            .render(context! {
                step => step,
                step_position => session.step_index + 1,
                steps_total => session.steps.len(),
                cursor => session.cursor.as_deref(),
                turns_done => session.turn_count,
                last_summary => session.last_summary.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                cursor_prefix => CURSOR_PREFIX,
                completion_marker => self.completion_marker.as_str(),
            })
            .context("render continuation prompt")?;
        Ok(rendered.trim().to_string())
    }
}
