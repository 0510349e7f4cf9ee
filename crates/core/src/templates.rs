//! Message template rendering.

use std::collections::HashMap;

/// Renders `{{variable}}` placeholders. Unknown variables render as empty
/// strings so a missing contact attribute never leaks template syntax.
pub struct TemplateRenderer;

impl TemplateRenderer {
    pub fn render(template: &str, variables: &HashMap<String, String>) -> String {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            result.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            match after_open.find("}}") {
                Some(end) => {
                    let name = after_open[..end].trim();
                    if let Some(value) = variables.get(name) {
                        result.push_str(value);
                    }
                    rest = &after_open[end + 2..];
                }
                None => {
                    // Unterminated placeholder: keep the text verbatim.
                    result.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        result.push_str(rest);
        result
    }

    /// Names of all placeholders appearing in `template`.
    pub fn placeholders(template: &str) -> Vec<String> {
        let mut names = Vec::new();
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find("}}") else {
                break;
            };
            names.push(after_open[..end].trim().to_string());
            rest = &after_open[end + 2..];
        }
        names
    }
}
