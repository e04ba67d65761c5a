//! Describe-prompt rendering.
//!
//! The configured prompt text is combined with per-item context through a
//! small embedded template, producing the final text substituted for
//! `{prompt}` in the describe command.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::manifest::{ItemRecord, MediaKind};

const DESCRIBE_TEMPLATE: &str = include_str!("prompts/describe.md");

/// Item context exposed to the template.
#[derive(Debug, Clone, Serialize)]
struct ItemContext {
    source: String,
    from_video: bool,
}

impl ItemContext {
    fn from_record(item: &ItemRecord) -> Self {
        Self {
            source: item.source_path.to_string_lossy().into_owned(),
            from_video: item.kind == MediaKind::Video,
        }
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptBuilder {
    env: Environment<'static>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("describe", DESCRIBE_TEMPLATE)
            .expect("describe template should be valid");
        Self { env }
    }

    /// Render the final describe prompt for one item.
    pub fn render(&self, prompt: &str, item: &ItemRecord) -> Result<String> {
        let template = self.env.get_template("describe")?;
        let rendered = template.render(context! {
            prompt => prompt.trim(),
            item => ItemContext::from_record(item),
        })?;
        Ok(rendered.trim().to_string())
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}
