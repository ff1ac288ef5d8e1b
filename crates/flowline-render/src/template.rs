//! Template Renderer (F): lazy-compiled, cached Jinja-style rendering.
//!
//! Two render paths exist because §4.6 draws a hard line between them:
//! a *simple single-reference* template (`"{{ a.b.c }}"`) must return the
//! exact typed value at that path, never its stringification; anything
//! more complex renders through the template engine and comes back as a
//! string (with boolean coercion available to callers that need it for
//! routing conditions).

use minijinja::{Environment, UndefinedBehavior, Value as MValue};
use moka::sync::Cache;
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, LazyLock, Mutex};

use crate::error::{RenderError, RenderResult};

static SINGLE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\s*\}\}$").unwrap());

/// Coerce a rendered string back to a boolean for routing `when` clauses:
/// non-empty, non-"false" strings are truthy.
pub fn coerce_bool(rendered: &str) -> bool {
    !rendered.is_empty() && rendered != "false" && rendered != "False"
}

pub struct TemplateRenderer {
    env: Arc<Mutex<Environment<'static>>>,
    cache: Cache<String, ()>,
}

impl TemplateRenderer {
    pub fn new(max_entries: u64) -> Self {
        let env = Arc::new(Mutex::new(Self::new_env()));
        let evict_env = env.clone();
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .eviction_listener(move |name: Arc<String>, _v, _cause| {
                if let Ok(mut env) = evict_env.lock() {
                    env.remove_template(Box::leak(name.to_string().into_boxed_str()));
                }
            })
            .build();
        Self { env, cache }
    }

    fn new_env() -> Environment<'static> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env
    }

    /// Ensure `source` is compiled and resident in the environment,
    /// keyed by its own text (source text IS the cache key, per §4.6).
    fn ensure_compiled(&self, source: &str) -> RenderResult<()> {
        if self.cache.get(&source.to_string()).is_some() {
            return Ok(());
        }
        let mut env = self.env.lock().expect("template env poisoned");
        if env.get_template(source).is_err() {
            env.add_template_owned(source.to_string(), source.to_string())
                .map_err(|e| RenderError::Syntax(e.to_string()))?;
        }
        drop(env);
        self.cache.insert(source.to_string(), ());
        Ok(())
    }

    fn render_as_string(&self, source: &str, context: &Value) -> RenderResult<String> {
        self.ensure_compiled(source)?;
        let env = self.env.lock().expect("template env poisoned");
        let template = env
            .get_template(source)
            .map_err(|e| RenderError::Syntax(e.to_string()))?;
        let ctx = MValue::from_serialize(context);
        template
            .render(ctx)
            .map_err(|e| classify_minijinja_error(e))
    }

    /// Render a single template string. Simple single-reference forms
    /// return the typed value at that path; everything else returns a
    /// string.
    pub fn render_str(&self, source: &str, context: &Value) -> RenderResult<Value> {
        if let Some(caps) = SINGLE_REF.captures(source) {
            let path = &caps[1];
            return resolve_path(context, path);
        }
        self.render_as_string(source, context).map(Value::String)
    }

    /// Recursively render every string leaf of a nested JSON structure,
    /// preserving non-string leaves and structure shape.
    pub fn render_value(&self, value: &Value, context: &Value) -> RenderResult<Value> {
        match value {
            Value::String(s) => self.render_str(s, context),
            Value::Array(items) => items
                .iter()
                .map(|v| self.render_value(v, context))
                .collect::<RenderResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.render_value(v, context)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

fn classify_minijinja_error(err: minijinja::Error) -> RenderError {
    if err.kind() == minijinja::ErrorKind::UndefinedError {
        RenderError::Undefined(err.to_string())
    } else {
        RenderError::Render(err.to_string())
    }
}

fn resolve_path(context: &Value, path: &str) -> RenderResult<Value> {
    let mut current = context;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(v) => current = v,
            None => return Err(RenderError::Undefined(path.to_string())),
        }
    }
    Ok(current.clone())
}

/// Normalize a rendered `loop.in` value to a collection per §4.7.3: lists
/// pass through; strings are wrapped whole (never character-split);
/// dicts wrap as a single-element list; anything else materializes as a
/// one-element list. An *unresolved* template string (still containing
/// `{{`/`}}` after rendering failure) collapses to an empty list rather
/// than surfacing a split string.
pub fn normalize_loop_collection(rendered: &Value) -> Vec<Value> {
    match rendered {
        Value::Array(items) => items.clone(),
        Value::String(s) if s.contains("{{") || s.contains("}}") => Vec::new(),
        Value::Null => Vec::new(),
        Value::String(_) | Value::Object(_) => vec![rendered.clone()],
        other => vec![other.clone()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_reference_preserves_type() {
        let r = TemplateRenderer::new(10);
        let ctx = json!({"a": {"b": {"c": 42}}});
        let out = r.render_str("{{ a.b.c }}", &ctx).unwrap();
        assert_eq!(out, json!(42));
    }

    #[test]
    fn mixed_template_returns_string() {
        let r = TemplateRenderer::new(10);
        let ctx = json!({"name": "world"});
        let out = r.render_str("hello {{ name }}", &ctx).unwrap();
        assert_eq!(out, json!("hello world"));
    }

    #[test]
    fn undefined_reference_is_hard_error() {
        let r = TemplateRenderer::new(10);
        let ctx = json!({});
        assert!(r.render_str("{{ missing.thing }}", &ctx).is_err());
    }

    #[test]
    fn structural_render_recurses_into_nested_values() {
        let r = TemplateRenderer::new(10);
        let ctx = json!({"x": 7});
        let value = json!({"a": "{{ x }}", "b": [1, "{{ x }}"]});
        let out = r.render_value(&value, &ctx).unwrap();
        assert_eq!(out, json!({"a": 7, "b": [1, 7]}));
    }

    #[test]
    fn loop_collection_normalizes_string_as_single_element() {
        assert_eq!(normalize_loop_collection(&json!("abc")), vec![json!("abc")]);
    }

    #[test]
    fn loop_collection_normalizes_unresolved_template_to_empty() {
        assert_eq!(normalize_loop_collection(&json!("{{ missing }}")), Vec::<Value>::new());
    }

    #[test]
    fn boolean_coercion_matches_routing_expectations() {
        assert!(coerce_bool("true"));
        assert!(!coerce_bool("false"));
        assert!(!coerce_bool(""));
        assert!(coerce_bool("anything else"));
    }
}
