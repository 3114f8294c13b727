//! Waiting and error pages served by the wake path

use std::path::Path;
use tracing::{debug, warn};

const DEFAULT_WAIT_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="5">
<title>Starting {{project}}</title>
</head>
<body>
<h1>Starting {{project}}</h1>
<p>{{hostname}} is waking up. This page reloads automatically.</p>
</body>
</html>
"#;

const DEFAULT_ERROR_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Not available</title>
</head>
<body>
<h1>{{message}}</h1>
<p>{{hostname}}</p>
</body>
</html>
"#;

/// HTML pages with `{{placeholder}}` substitution
#[derive(Debug, Clone)]
pub struct Templates {
    wait: String,
    error: String,
}

impl Default for Templates {
    fn default() -> Self {
        Self {
            wait: DEFAULT_WAIT_PAGE.to_string(),
            error: DEFAULT_ERROR_PAGE.to_string(),
        }
    }
}

impl Templates {
    /// Load `wait.html` and `error.html` from `dir`, falling back to the
    /// built-in pages for any that are missing
    pub fn load(dir: Option<&Path>) -> Self {
        let Some(dir) = dir else {
            return Self::default();
        };

        Self {
            wait: read_template(dir, "wait.html").unwrap_or_else(|| DEFAULT_WAIT_PAGE.to_string()),
            error: read_template(dir, "error.html").unwrap_or_else(|| DEFAULT_ERROR_PAGE.to_string()),
        }
    }

    pub fn wait_page(&self, project: &str, hostname: &str) -> String {
        render(&self.wait, &[("project", project), ("hostname", hostname)])
    }

    pub fn error_page(&self, message: &str, hostname: &str) -> String {
        render(&self.error, &[("message", message), ("hostname", hostname)])
    }
}

fn read_template(dir: &Path, file: &str) -> Option<String> {
    let path = dir.join(file);
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            debug!(path = %path.display(), "Template loaded");
            Some(content)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Template unavailable, using built-in page");
            None
        }
    }
}

/// Replace every `{{key}}` with its HTML-escaped value
fn render(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |page, (key, value)| {
        page.replace(&format!("{{{{{}}}}}", key), &escape_html(value))
    })
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
