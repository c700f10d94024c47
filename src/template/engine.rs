//! Placeholder engine
//!
//! Uses minijinja with custom syntax configuration:
//! - Variable delimiters: `${...}`
//! - Block delimiters: `{%...%}`
//! - Comment delimiters: `{#...#}`
//! - Escape: `$${...}` produces literal `${...}`

use minijinja::syntax::SyntaxConfig;
use minijinja::{Environment, UndefinedBehavior};

use super::context::ParamsContext;
use super::error::TemplateError;
use super::filters;

/// Placeholder for escaped `$${` during preprocessing
const ESCAPED_PLACEHOLDER: &str = "\x00__APPSET_ESCAPED_DOLLAR_BRACE__\x00";

/// Renders individual template strings against a parameter set.
///
/// Undefined parameters are errors, never empty strings.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    /// Create a new engine with `${...}` syntax and strict undefined handling
    pub fn new() -> Result<Self, TemplateError> {
        let syntax = SyntaxConfig::builder()
            .variable_delimiters("${", "}")
            .block_delimiters("{%", "%}")
            .comment_delimiters("{#", "#}")
            .build()
            .map_err(|e| TemplateError::Setup(e.to_string()))?;

        let mut env = Environment::new();
        env.set_syntax(syntax);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);

        env.add_filter("default", filters::default_filter);
        env.add_filter("required", filters::required);
        env.add_filter("upper", filters::upper);
        env.add_filter("lower", filters::lower);
        env.add_filter("base64_encode", filters::base64_encode);
        env.add_filter("base64_decode", filters::base64_decode);

        Ok(Self { env })
    }

    /// Render one template string.
    ///
    /// `field` names the template location for error messages.
    pub fn render(
        &self,
        field: &str,
        template: &str,
        ctx: &ParamsContext,
    ) -> Result<String, TemplateError> {
        if !Self::has_template_syntax(template) {
            return Ok(template.to_string());
        }

        let preprocessed = template.replace("$${", ESCAPED_PLACEHOLDER);
        let normalized = underscore_placeholder_hyphens(&preprocessed);

        let rendered = self
            .env
            .render_str(&normalized, ctx.to_value())
            .map_err(|e| TemplateError::at_field(field, e))?;

        Ok(rendered.replace(ESCAPED_PLACEHOLDER, "${"))
    }

    /// Check if a string contains any template syntax
    pub fn has_template_syntax(s: &str) -> bool {
        s.contains("${") || s.contains("{%") || s.contains("{#")
    }
}

/// Scanner position while rewriting placeholders
#[derive(Clone, Copy, PartialEq)]
enum Scan {
    Text,
    Placeholder,
    Quoted(char),
}

/// Rewrite `-` joining two identifier characters inside `${...}` to `_`.
///
/// `${values.my-flag}` would otherwise parse as a subtraction. Text outside
/// placeholders and quoted strings inside them are copied unchanged.
fn underscore_placeholder_hyphens(template: &str) -> String {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut scan = Scan::Text;

    for (i, &c) in chars.iter().enumerate() {
        let prev = i.checked_sub(1).map(|p| chars[p]);
        scan = match (scan, c) {
            (Scan::Text, '{') if prev == Some('$') => Scan::Placeholder,
            (Scan::Placeholder, '}') => Scan::Text,
            (Scan::Placeholder, '\'' | '"') => Scan::Quoted(c),
            (Scan::Quoted(quote), c) if c == quote => Scan::Placeholder,
            (scan, _) => scan,
        };

        let joins_identifiers = scan == Scan::Placeholder
            && c == '-'
            && prev.is_some_and(is_identifier_char)
            && chars.get(i + 1).copied().is_some_and(is_identifier_char);
        out.push(if joins_identifiers { '_' } else { c });
    }

    out
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
