use handlebars::Handlebars;
use pulldown_cmark::{html, Options, Parser};

use crate::error::{EngineError, EngineResult};

/// Render Markdown to HTML with tables, footnotes, strikethrough and task
/// lists enabled.
pub fn markdown_to_html(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);

    let parser = Parser::new_ext(markdown, options);
    let mut out = String::new();
    html::push_html(&mut out, parser);
    out
}

/// Render a Handlebars template with a JSON data object. Strict mode is off:
/// missing fields render empty, matching what template-driven scripts expect.
pub fn render_handlebars_template(template: &str, data_json: &str) -> EngineResult<String> {
    let data: serde_json::Value = serde_json::from_str(data_json)
        .map_err(|e| EngineError::invalid("data", format!("invalid JSON: {e}")))?;

    let handlebars = Handlebars::new();
    handlebars
        .render_template(template, &data)
        .map_err(|e| EngineError::invalid("template", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_basic_elements() {
        let html = markdown_to_html("# Title\n\nSome *emphasis* here.");
        assert!(html.contains("<h1>Title</h1>"));
        assert!(html.contains("<em>emphasis</em>"));
    }

    #[test]
    fn markdown_tables_enabled() {
        let html = markdown_to_html("| a | b |\n|---|---|\n| 1 | 2 |");
        assert!(html.contains("<table>"));
    }

    #[test]
    fn handlebars_substitutes_fields() {
        let out =
            render_handlebars_template("Hello {{name}}!", r#"{"name":"world"}"#).unwrap();
        assert_eq!(out, "Hello world!");
    }

    #[test]
    fn handlebars_missing_field_renders_empty() {
        let out = render_handlebars_template("[{{absent}}]", r#"{}"#).unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn handlebars_invalid_json_is_invalid_input() {
        let err = render_handlebars_template("{{x}}", "not json").unwrap_err();
        assert!(err.to_string().starts_with("InvalidInput"));
    }

    #[test]
    fn handlebars_bad_template_is_invalid_input() {
        let err = render_handlebars_template("{{#if}}", r#"{}"#).unwrap_err();
        assert!(err.to_string().starts_with("InvalidInput"));
    }
}
