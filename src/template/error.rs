//! Template error types

use std::fmt;

/// Errors that can occur while rendering an Application template
#[derive(Debug)]
pub enum TemplateError {
    /// A placeholder referenced a parameter the parameter set does not have
    Undefined {
        /// Template field being rendered (JSON pointer)
        field: String,
        /// Engine detail, including the offending expression
        detail: String,
    },
    /// Template syntax or filter evaluation failed
    Render {
        /// Template field being rendered (JSON pointer)
        field: String,
        /// Underlying engine error
        source: minijinja::Error,
    },
    /// The engine itself could not be configured
    Setup(String),
    /// Rendered template is not a valid Application
    Decode(String),
    /// Rendered Application name is empty
    EmptyName,
    /// Two parameter names differ only in `-` versus `_`
    AmbiguousKey {
        /// Name seen first, in key order
        first: String,
        /// Name that collides with it
        second: String,
    },
}

impl TemplateError {
    /// Attach the field being rendered to an engine error
    pub(crate) fn at_field(field: impl Into<String>, err: minijinja::Error) -> Self {
        let field = field.into();
        if err.kind() == minijinja::ErrorKind::UndefinedError {
            Self::Undefined {
                field,
                detail: err.to_string(),
            }
        } else {
            Self::Render { field, source: err }
        }
    }
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined { field, detail } => {
                write!(f, "unresolved placeholder in {}: {}", field, detail)
            }
            Self::Render { field, source } => {
                write!(f, "template render error in {}: {}", field, source)
            }
            Self::Setup(msg) => write!(f, "template engine setup failed: {}", msg),
            Self::Decode(msg) => write!(f, "rendered template is not a valid Application: {}", msg),
            Self::EmptyName => write!(f, "rendered application name is empty"),
            Self::AmbiguousKey { first, second } => write!(
                f,
                "parameters {} and {} cannot be told apart in placeholders",
                first, second
            ),
        }
    }
}

impl std::error::Error for TemplateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Render { source, .. } => Some(source),
            _ => None,
        }
    }
}
