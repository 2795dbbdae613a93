//! `{placeholder}` substitution for request templates.
//!
//! `{{` and `}}` produce literal braces. An unknown placeholder is an error so
//! that a typo in a scenario never silently sends the raw template.
use serde_json::Value;
use std::{borrow::Cow, collections::BTreeMap};

use super::ScenarioError;

/// Variables visible to a template: parameter set, `vu`, `iter`, extracted fields.
pub type Vars = BTreeMap<String, String>;

pub fn render(template: &str, vars: &Vars) -> Result<String, ScenarioError> {
    substitute(template, vars, verbatim)
}

/// Like [`render`], but every substituted value is percent-encoded so it stays
/// inside one path segment (`a/b?x=1` becomes `a%2Fb%3Fx%3D1`).
pub fn render_path(template: &str, vars: &Vars) -> Result<String, ScenarioError> {
    substitute(template, vars, urlencoding::encode)
}

fn verbatim(value: &str) -> Cow<'_, str> {
    Cow::Borrowed(value)
}

fn substitute(
    template: &str,
    vars: &Vars,
    escape: fn(&str) -> Cow<'_, str>,
) -> Result<String, ScenarioError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => {
                            return Err(ScenarioError::template(format!(
                                "unterminated placeholder in {template:?}"
                            )));
                        }
                    }
                }
                let value = vars.get(name.trim()).ok_or_else(|| {
                    ScenarioError::template(format!("unknown placeholder {{{name}}} in {template:?}"))
                })?;
                out.push_str(&escape(value));
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

/// Renders every string inside a JSON value, keys included.
pub fn render_json(value: &Value, vars: &Vars) -> Result<Value, ScenarioError> {
    let rendered = match value {
        Value::String(s) => Value::String(render(s, vars)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render_json(v, vars))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((render(k, vars)?, render_json(v, vars)?)))
                .collect::<Result<_, ScenarioError>>()?,
        ),
        other => other.clone(),
    };
    Ok(rendered)
}

/// Text form of a JSON scalar used as a template variable; strings lose their quotes.
pub fn json_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
