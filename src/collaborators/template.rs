//! Variable substitution for external command arguments.

use super::ItemDescriptor;
use std::collections::HashMap;
use std::path::Path;

/// Values substituted into `{name}` placeholders.
///
/// # Example
///
/// ```
/// use transcriptforge::collaborators::{ItemDescriptor, TemplateContext};
/// use std::path::Path;
///
/// let ctx = TemplateContext::new()
///     .with_item(&ItemDescriptor::new(7, "abc123", "Clase 7"))
///     .with_output(Path::new("/data/audio/demo/007_Clase 7.mp3.partial"));
///
/// assert_eq!(ctx.substitute("https://youtu.be/{item_id}"), "https://youtu.be/abc123");
/// assert_eq!(ctx.substitute("{index}"), "7");
/// ```
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    vars: HashMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `{item_id}`, `{title}` and `{index}`.
    pub fn with_item(self, item: &ItemDescriptor) -> Self {
        self.with_var("item_id", &item.item_id)
            .with_var("title", &item.title)
            .with_var("index", &item.index.to_string())
    }

    pub fn with_input(self, input: &Path) -> Self {
        self.with_var("input", &input.display().to_string())
    }

    pub fn with_output(self, output: &Path) -> Self {
        self.with_var("output", &output.display().to_string())
    }

    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }

    /// Replace every known `{name}`; unknown placeholders are left as-is.
    pub fn substitute(&self, template: &str) -> String {
        let mut result = template.to_string();
        for (key, value) in &self.vars {
            result = result.replace(&format!("{{{}}}", key), value);
        }
        result
    }

    pub fn substitute_all(&self, templates: &[String]) -> Vec<String> {
        templates.iter().map(|t| self.substitute(t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_paths_and_profile() {
        let ctx = TemplateContext::new()
            .with_input(Path::new("/t/001_A.srt"))
            .with_output(Path::new("/p/001_A_extracted.json.partial"))
            .with_var("profile", "lesson");

        let args = ctx.substitute_all(&[
            "--in={input}".to_string(),
            "{output}".to_string(),
            "--profile".to_string(),
            "{profile}".to_string(),
            "{unknown}".to_string(),
        ]);
        assert_eq!(
            args,
            vec![
                "--in=/t/001_A.srt",
                "/p/001_A_extracted.json.partial",
                "--profile",
                "lesson",
                "{unknown}"
            ]
        );
    }
}
