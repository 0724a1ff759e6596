//! Relay client: SMTP delivery via lettre, behind a trait so the
//! orchestrator and tests can swap the transport.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use crate::config::SmtpConfig;
use crate::error::{SendError, SendErrorKind};
use crate::render::RenderedMessage;

/// Capability to attempt delivery of one rendered message to one address.
///
/// Implementations must run each call to completion (or their own timeout);
/// the orchestrator never aborts an in-flight send.
#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn send(&self, address: &str, message: &RenderedMessage) -> Result<(), SendError>;
}

/// SMTP relay over STARTTLS with username/password credentials.
pub struct SmtpRelay {
    config: SmtpConfig,
}

impl SmtpRelay {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    async fn load_attachments(
        &self,
        address: &str,
        message: &RenderedMessage,
    ) -> Result<Vec<(String, Vec<u8>)>, SendError> {
        let mut attachments = Vec::with_capacity(message.attachment_paths.len());
        for path in &message.attachment_paths {
            let bytes = tokio::fs::read(path).await.map_err(|e| {
                SendError::new(
                    address,
                    SendErrorKind::TransientNetwork,
                    format!("could not read attachment {}: {e}", path.display()),
                )
            })?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "attachment".to_string());
            attachments.push((filename, bytes));
        }
        Ok(attachments)
    }

    fn build_message(
        &self,
        address: &str,
        message: &RenderedMessage,
        attachments: Vec<(String, Vec<u8>)>,
    ) -> Result<Message, SendError> {
        // A from-address that cannot be parsed can never succeed for any
        // recipient, so it is classified as fatal.
        let from: Mailbox = self.config.from_address.parse().map_err(|e| {
            SendError::new(
                address,
                SendErrorKind::Auth,
                format!("invalid from address {:?}: {e}", self.config.from_address),
            )
        })?;
        let to: Mailbox = address.parse().map_err(|e| {
            SendError::new(
                address,
                SendErrorKind::RecipientRejected,
                format!("invalid recipient address: {e}"),
            )
        })?;

        let alternative = match &message.html_body {
            Some(html) => {
                MultiPart::alternative_plain_html(message.text_body.clone(), html.clone())
            }
            None => MultiPart::alternative_plain_html(
                message.text_body.clone(),
                message.text_body.clone(),
            ),
        };

        let mut body = MultiPart::mixed().multipart(alternative);
        for (filename, bytes) in attachments {
            let content_type = ContentType::parse("application/octet-stream").map_err(|e| {
                SendError::new(address, SendErrorKind::TransientNetwork, e.to_string())
            })?;
            body = body.singlepart(Attachment::new(filename).body(bytes, content_type));
        }

        Message::builder()
            .from(from)
            .to(to)
            .subject(&message.subject)
            .multipart(body)
            .map_err(|e| {
                SendError::new(
                    address,
                    SendErrorKind::RecipientRejected,
                    format!("failed to build message: {e}"),
                )
            })
    }
}

#[async_trait]
impl RelayClient for SmtpRelay {
    async fn send(&self, address: &str, message: &RenderedMessage) -> Result<(), SendError> {
        let attachments = self.load_attachments(address, message).await?;
        let email = self.build_message(address, message, attachments)?;

        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );
        let transport = SmtpTransport::starttls_relay(&self.config.host)
            .map_err(|e| classify_smtp_error(address, &e))?
            .port(self.config.port)
            .credentials(creds)
            .build();

        let addr = address.to_string();
        let result = tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| {
                SendError::new(
                    addr.as_str(),
                    SendErrorKind::TransientNetwork,
                    format!("send task failed: {e}"),
                )
            })?;

        match result {
            Ok(response) => {
                tracing::debug!(address, code = %response.code(), "Relay accepted message");
                Ok(())
            }
            Err(e) => Err(classify_smtp_error(address, &e)),
        }
    }
}

/// Map an SMTP reply code to a failure kind.
///
/// 53x auth replies abort the campaign; 452 is the relay's own quota;
/// remaining 4xx are transient; remaining 5xx mean this recipient is
/// refused but others may still succeed.
pub fn classify_smtp_code(code: u16) -> SendErrorKind {
    match code {
        530 | 534 | 535 | 538 => SendErrorKind::Auth,
        452 => SendErrorKind::RelayQuotaExceeded,
        400..=499 => SendErrorKind::TransientNetwork,
        _ => SendErrorKind::RecipientRejected,
    }
}

fn classify_smtp_error(address: &str, e: &lettre::transport::smtp::Error) -> SendError {
    let kind = match e.status() {
        Some(code) => {
            let numeric: u16 = code.to_string().parse().unwrap_or(0);
            classify_smtp_code(numeric)
        }
        // No reply code means we never got a proper SMTP response:
        // connection refused, timeout, TLS failure.
        None => SendErrorKind::TransientNetwork,
    };
    SendError::new(address, kind, e.to_string())
}
