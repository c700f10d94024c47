//! Application templating
//!
//! Templates use `${...}` placeholders evaluated by minijinja with a custom
//! syntax:
//!
//! - `${cluster}`, `${metadata.labels.env}`, `${path.basename}` - parameters
//!   emitted by generators; dotted names resolve as written
//! - `${metadata.labels["app.kubernetes.io/name"]}` - keys that are not
//!   valid identifiers
//! - `$${...}` - a literal `${...}` (for Applications that template themselves)
//! - `{% if %}...{% endif %}` - conditionals
//! - Filters: `default`, `required`, `upper`, `lower`, `base64_encode`,
//!   `base64_decode`
//!
//! A placeholder naming a parameter the set does not contain is an error.

mod context;
mod engine;
mod error;
mod filters;
mod renderer;

pub use context::ParamsContext;
pub use engine::TemplateEngine;
pub use error::TemplateError;
pub use renderer::Renderer;
