//! Response rendering.
//!
//! Actions hand off a symbolic response key plus variables; the renderer
//! turns that into user-visible text. When no richer template is available
//! the deterministic safe-fallback table answers, so internal failures never
//! leak implementation detail to the user.

use rustc_hash::FxHashMap;
use serde_json::Value;

/// Resolves a response key to user-visible text.
pub trait Renderer: Send + Sync {
    fn render(&self, response_key: &str, vars: &FxHashMap<String, Value>) -> String;
}

/// Safe-fallback response keys every deployment understands.
pub mod response_keys {
    pub const SYSTEM_UNAVAILABLE_CATALOG: &str = "system.unavailable.catalog";
    pub const SYSTEM_UNAVAILABLE_STORAGE: &str = "system.unavailable.storage";
    pub const CLARIFY_INTENT: &str = "clarify.intent";
    pub const GENERIC_UNKNOWN: &str = "generic.unknown";
    pub const REMINDER_ACK: &str = "reminder.ack";
    pub const REMINDER_FIRE: &str = "reminder.fire";
    pub const INTERNAL_PAUSE: &str = "internal.pause";
    pub const STATUS_SUMMARY: &str = "status.summary";
}

/// Template renderer with `{name}` substitution and a built-in fallback
/// table. Template storage is a deployment concern; the kernel only ships
/// the fallbacks.
#[derive(Default)]
pub struct TemplateRenderer {
    templates: FxHashMap<String, String>,
}

impl TemplateRenderer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_template(mut self, key: impl Into<String>, template: impl Into<String>) -> Self {
        self.templates.insert(key.into(), template.into());
        self
    }

    fn fallback(response_key: &str) -> &'static str {
        match response_key {
            response_keys::SYSTEM_UNAVAILABLE_CATALOG => {
                "I can't reach my routing tables right now. Please try again shortly."
            }
            response_keys::SYSTEM_UNAVAILABLE_STORAGE => {
                "My memory is briefly unavailable. Please try again shortly."
            }
            response_keys::CLARIFY_INTENT => {
                "I didn't quite catch that. Could you rephrase what you'd like me to do?"
            }
            response_keys::REMINDER_ACK => "Noted. I'll remind you: {summary}",
            response_keys::REMINDER_FIRE => "Reminder: {summary}",
            response_keys::INTERNAL_PAUSE => {
                "I need a moment to sort something out internally. I'll follow up."
            }
            response_keys::STATUS_SUMMARY => {
                "State: {state}. Queue: {queued} queued. Timers: {timers} pending."
            }
            _ => "Something went sideways on my end, but I'm still here.",
        }
    }

    fn substitute(template: &str, vars: &FxHashMap<String, Value>) -> String {
        let mut rendered = template.to_string();
        for (name, value) in vars {
            let needle = format!("{{{name}}}");
            if !rendered.contains(&needle) {
                continue;
            }
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            rendered = rendered.replace(&needle, &replacement);
        }
        rendered
    }
}

impl Renderer for TemplateRenderer {
    fn render(&self, response_key: &str, vars: &FxHashMap<String, Value>) -> String {
        let template = self
            .templates
            .get(response_key)
            .map(String::as_str)
            .unwrap_or_else(|| Self::fallback(response_key));
        Self::substitute(template, vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_key_renders_generic_fallback() {
        let renderer = TemplateRenderer::new();
        let text = renderer.render("no.such.key", &FxHashMap::default());
        assert!(text.contains("still here"));
    }

    #[test]
    fn variables_substitute_into_templates() {
        let renderer = TemplateRenderer::new();
        let mut vars = FxHashMap::default();
        vars.insert("summary".to_string(), json!("water the plants"));
        let text = renderer.render(response_keys::REMINDER_ACK, &vars);
        assert_eq!(text, "Noted. I'll remind you: water the plants");
    }

    #[test]
    fn installed_template_overrides_fallback() {
        let renderer =
            TemplateRenderer::new().with_template(response_keys::CLARIFY_INTENT, "Say again?");
        let text = renderer.render(response_keys::CLARIFY_INTENT, &FxHashMap::default());
        assert_eq!(text, "Say again?");
    }
}
