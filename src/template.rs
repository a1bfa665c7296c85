//! Mail template rendering.
//!
//! Templated notifications delegate subject/body/html production to a
//! [`TemplateEngine`]. The built-in [`TemplateStore`] is an in-memory registry
//! of [`MailTemplate`]s with `{{variable}}` substitution from a JSON context.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template not found: {0}")]
    NotFound(String),
    #[error("template already registered: {0}")]
    AlreadyExists(String),
}

/// A registered mail template. Every part may reference `{{variables}}`
/// resolved against the render context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailTemplate {
    pub id: String,
    pub subject: String,
    pub body: String,
    pub html: Option<String>,
}

/// Output of a template render: the mail body plus the subject and optional
/// HTML alternative that overwrite the caller-supplied values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMail {
    pub subject: String,
    pub body: String,
    pub html: Option<String>,
}

/// The external template-rendering collaborator. `create_link` asks the
/// engine to embed a tracking link for the recipients; the built-in store
/// accepts the flag but has no link service, so it is ignored there.
pub trait TemplateEngine: Send + Sync {
    fn render(
        &self,
        template: &str,
        context: &Map<String, Value>,
        from_email: Option<&str>,
        recipients: &[String],
        create_link: bool,
    ) -> Result<RenderedMail, TemplateError>;
}

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("valid placeholder regex"));

fn substitute(text: &str, context: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &regex::Captures| {
            match context.get(&caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                // Leave unknown placeholders visible rather than dropping them.
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// In-memory template registry.
#[derive(Default)]
pub struct TemplateStore {
    templates: RwLock<HashMap<String, MailTemplate>>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, template: MailTemplate) -> Result<(), TemplateError> {
        let mut guard = self.templates.write().expect("template store poisoned");
        if guard.contains_key(&template.id) {
            return Err(TemplateError::AlreadyExists(template.id));
        }
        guard.insert(template.id.clone(), template);
        Ok(())
    }
}

impl TemplateEngine for TemplateStore {
    fn render(
        &self,
        template: &str,
        context: &Map<String, Value>,
        _from_email: Option<&str>,
        _recipients: &[String],
        _create_link: bool,
    ) -> Result<RenderedMail, TemplateError> {
        let guard = self.templates.read().expect("template store poisoned");
        let tpl = guard
            .get(template)
            .ok_or_else(|| TemplateError::NotFound(template.to_string()))?;
        Ok(RenderedMail {
            subject: substitute(&tpl.subject, context),
            body: substitute(&tpl.body, context),
            html: tpl.html.as_deref().map(|h| substitute(h, context)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with(template: MailTemplate) -> TemplateStore {
        let store = TemplateStore::new();
        store.register(template).unwrap();
        store
    }

    fn context(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn renders_all_parts_with_substitution() {
        let store = store_with(MailTemplate {
            id: "order-shipped".into(),
            subject: "Order {{order_id}} shipped".into(),
            body: "Your order {{order_id}} is on its way via {{carrier}}.".into(),
            html: Some("<p>Order <b>{{order_id}}</b></p>".into()),
        });
        let ctx = context(&[("order_id", json!("ORD-1")), ("carrier", json!("DHL"))]);
        let rendered = store
            .render("order-shipped", &ctx, None, &[], false)
            .unwrap();
        assert_eq!(rendered.subject, "Order ORD-1 shipped");
        assert_eq!(rendered.body, "Your order ORD-1 is on its way via DHL.");
        assert_eq!(rendered.html.as_deref(), Some("<p>Order <b>ORD-1</b></p>"));
    }

    #[test]
    fn non_string_values_and_unknowns() {
        let store = store_with(MailTemplate {
            id: "t".into(),
            subject: "{{count}} items".into(),
            body: "{{missing}}".into(),
            html: None,
        });
        let ctx = context(&[("count", json!(3))]);
        let rendered = store.render("t", &ctx, None, &[], false).unwrap();
        assert_eq!(rendered.subject, "3 items");
        assert_eq!(rendered.body, "{{missing}}");
    }

    #[test]
    fn unknown_template_errors() {
        let store = TemplateStore::new();
        let err = store.render("nope", &Map::new(), None, &[], false).unwrap_err();
        assert!(matches!(err, TemplateError::NotFound(_)));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let tpl = MailTemplate {
            id: "t".into(),
            subject: "s".into(),
            body: "b".into(),
            html: None,
        };
        let store = store_with(tpl.clone());
        assert!(matches!(
            store.register(tpl),
            Err(TemplateError::AlreadyExists(_))
        ));
    }
}
