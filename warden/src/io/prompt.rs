//! Task payload rendering.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior, context};
use tracing::debug;

use crate::core::types::RepoRef;

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

/// Values available to the task template.
#[derive(Debug, Clone)]
pub struct TaskInputs<'a> {
    pub task: &'a str,
    pub repo: &'a RepoRef,
    pub target: &'a str,
    pub workspace: &'a str,
    pub max_iterations: u32,
}

/// Render the task payload from the built-in template, or from
/// `template_path` when one is configured.
///
/// Templates use minijinja syntax. The upper-case names `TASK_DESCRIPTION`,
/// `REPO` and `SPRITE_NAME` are also bound so older templates keep working.
pub fn render_task(inputs: &TaskInputs<'_>, template_path: Option<&Path>) -> Result<String> {
    let source = match template_path {
        Some(path) => {
            debug!(path = %path.display(), "loading task template");
            fs::read_to_string(path)
                .with_context(|| format!("read task template {}", path.display()))?
        }
        None => TASK_TEMPLATE.to_string(),
    };

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    let template = env
        .template_from_str(&source)
        .context("parse task template")?;

    let task = inputs.task.trim();
    let repo = inputs.repo.to_string();
    let rendered = template
        .render(context! {
            task => task,
            repo => repo,
            target => inputs.target,
            workspace => inputs.workspace,
            max_iterations => inputs.max_iterations,
            TASK_DESCRIPTION => task,
            REPO => repo,
            SPRITE_NAME => inputs.target,
        })
        .context("render task template")?;
    Ok(rendered)
}
