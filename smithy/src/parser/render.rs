use std::collections::BTreeMap;

use anyhow::{Context, Result};
use minijinja::syntax::SyntaxConfig;
use minijinja::{context, AutoEscape, Environment, UndefinedBehavior, Value};

use crate::component::{Component, ParameterValue};

/// Tokens the engine fills in with container paths. Rendering keeps them verbatim.
pub const WORKSPACE_TOKENS: [&str; 3] = [
    "scratchWorkspace",
    "sourceCodeWorkspace",
    "targetMetadataWorkspace",
];

/// Only `{{ expr }}` is live. Block and comment markers start with a NUL byte,
/// so shell text like `${#VAR}` or `{%` passes through untouched.
pub(crate) fn expression_environment<'source>() -> Result<Environment<'source>> {
    let syntax = SyntaxConfig::builder()
        .block_delimiters("\u{0}{%", "%}\u{0}")
        .comment_delimiters("\u{0}{#", "#}\u{0}")
        .build()
        .context("invalid template syntax")?;

    let mut env = Environment::new();
    env.set_syntax(syntax);
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.set_keep_trailing_newline(true);
    Ok(env)
}

/// Text a parameter value renders as: strings verbatim, lists as `[a b]`,
/// unset values as the empty string.
fn parameter_text(value: Option<&ParameterValue>) -> String {
    match value {
        Some(ParameterValue::String(s)) => s.clone(),
        Some(ParameterValue::List(items)) => format!("[{}]", items.join(" ")),
        None => String::new(),
    }
}

struct ComponentRenderer {
    env: Environment<'static>,
    context: Value,
}

impl ComponentRenderer {
    fn new(component: &Component) -> Result<Self> {
        let mut env = expression_environment()?;
        for token in WORKSPACE_TOKENS {
            env.add_global(token, Value::from(format!("{{{{ {token} }}}}")));
        }
        let parameters: BTreeMap<&str, String> = component
            .parameters
            .iter()
            .map(|p| (p.name.as_str(), parameter_text(p.value.as_ref())))
            .collect();
        Ok(Self {
            env,
            context: context! { parameters => parameters },
        })
    }

    fn render(&self, field: &mut String) -> Result<()> {
        if field.contains("{{") {
            let rendered = self
                .env
                .render_str(field, &self.context)
                .with_context(|| format!("could not render '{field}'"))?;
            *field = rendered;
        }
        Ok(())
    }
}

/// Substitutes `{{ parameters.<name> }}` in every string field of the
/// component's description and steps. Parameter declarations are left alone.
pub fn render_component(component: &Component) -> Result<Component> {
    let render = || -> Result<Component> {
        let renderer = ComponentRenderer::new(component)?;
        let mut rendered = component.clone();

        renderer.render(&mut rendered.description)?;
        for step in &mut rendered.steps {
            renderer.render(&mut step.name)?;
            renderer.render(&mut step.image)?;
            if let Some(executable) = &mut step.executable {
                renderer.render(executable)?;
            }
            for arg in &mut step.args {
                renderer.render(arg)?;
            }
            for value in step.env_vars.values_mut() {
                renderer.render(value)?;
            }
        }
        Ok(rendered)
    };
    render().with_context(|| format!("failed to render component '{}'", component.name))
}
