//! Prompt construction for each iteration

use eyre::{Context, Result};
use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

const TEMPLATE_NAME: &str = "iteration";

const DEFAULT_TEMPLATE: &str = r#"You are working on the following task in the current directory.

## Task
{{task}}

Iteration {{iteration}} of {{max_iterations}}.
{{#if instructions}}

## Additional instructions
{{#each instructions}}
- {{this}}
{{/each}}
{{/if}}
{{#if diagnostics}}

## Verification failures from the previous iteration
Fix these before doing anything else:

{{diagnostics}}
{{/if}}
{{#if style_reminder}}

## Style reminder
{{style_reminder}}
{{/if}}

When the task is fully complete and the tests and lints pass, print {{completion_marker}} on its own line.
"#;

/// Values available to the prompt template
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext<'a> {
    pub task: &'a str,
    pub iteration: u32,
    pub max_iterations: u32,
    pub instructions: &'a [String],
    pub diagnostics: Option<&'a str>,
    pub style_reminder: Option<&'a str>,
    pub completion_marker: &'a str,
}

/// Renders iteration prompts from a handlebars template
#[derive(Debug)]
pub struct PromptBuilder {
    handlebars: Handlebars<'static>,
}

impl PromptBuilder {
    /// Builder using `template`, or the built-in one
    pub fn new(template: Option<&str>) -> Result<Self> {
        debug!(custom = template.is_some(), "PromptBuilder::new: called");
        let mut handlebars = Handlebars::new();
        // prompts are plain text, not HTML
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars
            .register_template_string(TEMPLATE_NAME, template.unwrap_or(DEFAULT_TEMPLATE))
            .context("Failed to parse prompt template")?;
        Ok(Self { handlebars })
    }

    pub fn render(&self, context: &PromptContext<'_>) -> Result<String> {
        debug!(
            iteration = context.iteration,
            instruction_count = context.instructions.len(),
            has_diagnostics = context.diagnostics.is_some(),
            "PromptBuilder::render: called"
        );
        self.handlebars
            .render(TEMPLATE_NAME, context)
            .context("Failed to render prompt template")
    }
}
