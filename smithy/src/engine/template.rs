use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use minijinja::Value;

use super::WorkspaceKind;
use crate::component::Step;
use crate::parser::expression_environment;

/// Step args and env with workspace tokens replaced by container paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedStep {
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Workspaces referenced anywhere in the step; only these get mounted.
    pub workspaces: BTreeSet<WorkspaceKind>,
}

struct Renderer {
    context: BTreeMap<&'static str, Value>,
}

impl Renderer {
    fn new() -> Self {
        let context = WorkspaceKind::ALL
            .into_iter()
            .map(|kind| (kind.token(), Value::from(kind.mount_path())))
            .collect();
        Self { context }
    }

    fn render(&self, source: &str, used: &mut BTreeSet<WorkspaceKind>) -> Result<String> {
        if !source.contains("{{") {
            return Ok(source.to_string());
        }
        let env = expression_environment()?;
        let template = env
            .template_from_str(source)
            .with_context(|| format!("could not parse expression '{source}'"))?;
        used.extend(
            template
                .undeclared_variables(false)
                .iter()
                .filter_map(|name| WorkspaceKind::from_token(name)),
        );
        template
            .render(&self.context)
            .with_context(|| format!("could not render expression '{source}'"))
    }
}

pub fn render_step(step: &Step) -> Result<RenderedStep> {
    let renderer = Renderer::new();
    let mut rendered = RenderedStep::default();

    for arg in &step.args {
        let value = renderer.render(arg, &mut rendered.workspaces)?;
        rendered.args.push(value);
    }
    for (key, value) in &step.env_vars {
        let value = renderer.render(value, &mut rendered.workspaces)?;
        rendered.env.insert(key.clone(), value);
    }
    Ok(rendered)
}
