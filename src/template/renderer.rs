//! Application template renderer
//!
//! Renders every string in an [`ApplicationTemplate`] (map keys included)
//! against one parameter set and decodes the result back into an
//! Application. Rendering is all-or-nothing: any unresolved placeholder fails
//! the whole template, so a half-substituted Application is never produced.

use kube::api::ObjectMeta;
use serde_json::{Map, Value};

use crate::crd::{Application, ApplicationTemplate};
use crate::generators::Params;

use super::context::ParamsContext;
use super::engine::TemplateEngine;
use super::error::TemplateError;

/// Renders Application templates
pub struct Renderer {
    engine: TemplateEngine,
}

impl Renderer {
    /// Create a renderer with the standard placeholder engine
    pub fn new() -> Result<Self, TemplateError> {
        Ok(Self {
            engine: TemplateEngine::new()?,
        })
    }

    /// Render `template` with `params` into an Application.
    ///
    /// The result carries only what the template sets: name, optional
    /// namespace, labels, annotations, finalizers and spec. Ownership and
    /// namespace defaulting are the caller's concern.
    pub fn render(
        &self,
        template: &ApplicationTemplate,
        params: &Params,
    ) -> Result<Application, TemplateError> {
        let ctx = ParamsContext::new(params)?;
        let raw = serde_json::to_value(template).map_err(|e| TemplateError::Decode(e.to_string()))?;
        let rendered = self.render_value(String::new(), raw, &ctx)?;
        let rendered: ApplicationTemplate =
            serde_json::from_value(rendered).map_err(|e| TemplateError::Decode(e.to_string()))?;

        let name = rendered.metadata.name.trim().to_string();
        if name.is_empty() {
            return Err(TemplateError::EmptyName);
        }

        let metadata = ObjectMeta {
            name: Some(name),
            namespace: rendered.metadata.namespace.filter(|ns| !ns.is_empty()),
            labels: non_empty(rendered.metadata.labels),
            annotations: non_empty(rendered.metadata.annotations),
            finalizers: (!rendered.metadata.finalizers.is_empty())
                .then_some(rendered.metadata.finalizers),
            ..Default::default()
        };

        Ok(Application {
            metadata,
            spec: rendered.spec,
            status: None,
        })
    }

    fn render_value(
        &self,
        pointer: String,
        value: Value,
        ctx: &ParamsContext,
    ) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) => Ok(Value::String(self.engine.render(&pointer, &s, ctx)?)),
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| self.render_value(format!("{pointer}/{i}"), item, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(fields) => {
                let mut out = Map::with_capacity(fields.len());
                for (key, item) in fields {
                    let field = format!("{pointer}/{key}");
                    let key = self.engine.render(&field, &key, ctx)?;
                    out.insert(key, self.render_value(field, item, ctx)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other),
        }
    }
}

fn non_empty<K: Ord, V>(
    map: std::collections::BTreeMap<K, V>,
) -> Option<std::collections::BTreeMap<K, V>> {
    (!map.is_empty()).then_some(map)
}
