//! Message rendering: placeholder substitution into subject/body templates.
//!
//! The orchestrator only sees the `MessageRenderer` trait; rendering is a
//! pure function of the recipient so the send loop can call it once per
//! attempt without shared state.

use std::path::PathBuf;

use crate::error::ConfigError;
use crate::recipient::Recipient;

/// A fully rendered message ready for one relay hand-off.
#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: String,
    pub attachment_paths: Vec<PathBuf>,
}

/// Pure recipient → message function supplied to the orchestrator.
pub trait MessageRenderer: Send + Sync {
    fn render(&self, recipient: &Recipient) -> RenderedMessage;
}

impl<F> MessageRenderer for F
where
    F: Fn(&Recipient) -> RenderedMessage + Send + Sync,
{
    fn render(&self, recipient: &Recipient) -> RenderedMessage {
        self(recipient)
    }
}

/// Template source loadable from a JSON file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MessageTemplate {
    /// Subject variants; one is picked at random per message so consecutive
    /// sends do not share an identical subject line.
    pub subjects: Vec<String>,
    #[serde(default)]
    pub html_body: Option<String>,
    pub text_body: String,
    #[serde(default)]
    pub attachment_paths: Vec<PathBuf>,
}

impl MessageTemplate {
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path)?;
        let template: Self =
            serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        template.validate()?;
        Ok(template)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subjects.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "subjects".into(),
                message: "at least one subject line is required".into(),
            });
        }
        if self.text_body.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "text_body".into(),
                message: "text body must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// Substitutes `{name}`, `{company}`, `{email}` and `{metadata-key}`
/// placeholders from the recipient into a `MessageTemplate`.
pub struct TemplateRenderer {
    template: MessageTemplate,
    /// Sender address, available as `{email}` in templates.
    from_address: String,
}

impl TemplateRenderer {
    pub fn new(template: MessageTemplate, from_address: impl Into<String>) -> Self {
        Self {
            template,
            from_address: from_address.into(),
        }
    }

    fn substitute(&self, text: &str, recipient: &Recipient) -> String {
        let mut out = text.replace("{name}", recipient.display_name.as_deref().unwrap_or(""));
        out = out.replace("{company}", recipient.company.as_deref().unwrap_or(""));
        out = out.replace("{email}", &self.from_address);
        for (key, value) in &recipient.metadata {
            out = out.replace(&format!("{{{key}}}"), value);
        }
        out
    }
}

impl MessageRenderer for TemplateRenderer {
    fn render(&self, recipient: &Recipient) -> RenderedMessage {
        use rand::seq::SliceRandom;

        let subject = self
            .template
            .subjects
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_default();

        RenderedMessage {
            subject: self.substitute(&subject, recipient),
            html_body: self
                .template
                .html_body
                .as_deref()
                .map(|html| self.substitute(html, recipient)),
            text_body: self.substitute(&self.template.text_body, recipient),
            attachment_paths: self.template.attachment_paths.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> MessageTemplate {
        MessageTemplate {
            subjects: vec!["Hello {name}".into()],
            html_body: Some("<p>Dear {name} at {company}, write to {email}</p>".into()),
            text_body: "Dear {name} at {company} ({role})".into(),
            attachment_paths: vec![],
        }
    }

    #[test]
    fn substitutes_name_company_and_sender() {
        let renderer = TemplateRenderer::new(template(), "me@from.com");
        let recipient = Recipient::new("hr@acme.com")
            .with_name("Alice")
            .with_company("Acme");
        let rendered = renderer.render(&recipient);
        assert_eq!(rendered.subject, "Hello Alice");
        assert_eq!(rendered.text_body, "Dear Alice at Acme ({role})");
        assert_eq!(
            rendered.html_body.as_deref(),
            Some("<p>Dear Alice at Acme, write to me@from.com</p>")
        );
    }

    #[test]
    fn substitutes_metadata_keys() {
        let renderer = TemplateRenderer::new(template(), "me@from.com");
        let mut recipient = Recipient::new("hr@acme.com").with_name("Bob").with_company("Acme");
        recipient.metadata.insert("role".into(), "HR Manager".into());
        let rendered = renderer.render(&recipient);
        assert_eq!(rendered.text_body, "Dear Bob at Acme (HR Manager)");
    }

    #[test]
    fn missing_fields_render_empty() {
        let renderer = TemplateRenderer::new(template(), "me@from.com");
        let rendered = renderer.render(&Recipient::new("hr@acme.com"));
        assert_eq!(rendered.subject, "Hello ");
    }

    #[test]
    fn empty_subjects_rejected() {
        let t = MessageTemplate {
            subjects: vec![],
            html_body: None,
            text_body: "hi".into(),
            attachment_paths: vec![],
        };
        assert!(t.validate().is_err());
    }

    #[test]
    fn subject_rotation_stays_within_variants() {
        let t = MessageTemplate {
            subjects: vec!["A".into(), "B".into()],
            html_body: None,
            text_body: "hi".into(),
            attachment_paths: vec![],
        };
        let renderer = TemplateRenderer::new(t, "me@from.com");
        let recipient = Recipient::new("hr@acme.com");
        for _ in 0..20 {
            let subject = renderer.render(&recipient).subject;
            assert!(subject == "A" || subject == "B");
        }
    }
}
