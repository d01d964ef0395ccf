//! Personalised parent email rendering.
//!
//! Handlebars templates turn a notification's subject and message into an
//! HTML and a plain text body addressed to one guardian.

use handlebars::Handlebars;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::error::NotificationResult;
use crate::vocabulary::{DisabilityTag, display_names};

/// Rendered email content.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Event details shown in event-mode notifications.
#[derive(Debug, Clone, Serialize)]
pub struct EventSummary {
    pub title: String,
    pub starts_at: Option<String>,
}

/// Everything needed to personalise one email.
#[derive(Debug, Clone)]
pub struct MessageContext<'a> {
    pub guardian_name: &'a str,
    pub subject: &'a str,
    pub message: &'a str,
    pub disabilities: &'a BTreeSet<DisabilityTag>,
    pub unsubscribe_token: &'a str,
    pub event: Option<&'a EventSummary>,
}

#[derive(Serialize)]
struct TemplateData<'a> {
    guardian_name: &'a str,
    subject: &'a str,
    message: &'a str,
    paragraphs: Vec<&'a str>,
    disabilities: String,
    unsubscribe_url: String,
    organisation_name: &'a str,
    event: Option<&'a EventSummary>,
}

/// Template engine for parent notifications.
#[derive(Clone)]
pub struct MessageRenderer {
    handlebars: Arc<Handlebars<'static>>,
    base_url: String,
    organisation_name: String,
}

impl MessageRenderer {
    pub fn new(
        base_url: impl Into<String>,
        organisation_name: impl Into<String>,
    ) -> NotificationResult<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.register_template_string("parent_html", PARENT_HTML_TEMPLATE)?;
        handlebars.register_template_string("parent_text", PARENT_TEXT_TEMPLATE)?;

        Ok(Self {
            handlebars: Arc::new(handlebars),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            organisation_name: organisation_name.into(),
        })
    }

    pub fn unsubscribe_url(&self, token: &str) -> String {
        format!("{}/api/notifications/unsubscribe/{}", self.base_url, token)
    }

    pub fn render(&self, ctx: &MessageContext<'_>) -> NotificationResult<RenderedMessage> {
        debug!(guardian = %ctx.guardian_name, "Rendering parent notification");

        let data = TemplateData {
            guardian_name: ctx.guardian_name,
            subject: ctx.subject,
            message: ctx.message,
            paragraphs: ctx
                .message
                .split("\n\n")
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect(),
            disabilities: display_names(ctx.disabilities).join(", "),
            unsubscribe_url: self.unsubscribe_url(ctx.unsubscribe_token),
            organisation_name: &self.organisation_name,
            event: ctx.event,
        };

        Ok(RenderedMessage {
            subject: ctx.subject.to_string(),
            html: self.handlebars.render("parent_html", &data)?,
            text: self.handlebars.render("parent_text", &data)?,
        })
    }
}

const PARENT_HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>{{subject}}</title>
</head>
<body style="margin: 0; padding: 0; background-color: #f4f4f5; font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;">
  <table width="100%" cellspacing="0" cellpadding="0" style="max-width: 600px; margin: 0 auto; padding: 40px 20px;">
    <tr>
      <td style="background-color: #ffffff; border-radius: 8px; padding: 40px;">
        <h1 style="color: #18181b; font-size: 22px; font-weight: 600; margin: 0 0 16px 0;">{{subject}}</h1>
        <p style="color: #52525b; font-size: 16px; line-height: 24px; margin: 0 0 16px 0;">Dear {{guardian_name}},</p>
        {{#if event}}
        <table width="100%" cellspacing="0" cellpadding="0" style="margin: 0 0 16px 0;">
          <tr>
            <td style="background-color: #eff6ff; border-radius: 6px; padding: 16px; border-left: 4px solid #2563eb;">
              <p style="color: #1e3a8a; font-size: 15px; margin: 0;"><strong>{{event.title}}</strong></p>
              {{#if event.starts_at}}<p style="color: #1e40af; font-size: 13px; margin: 4px 0 0 0;">{{event.starts_at}}</p>{{/if}}
            </td>
          </tr>
        </table>
        {{/if}}
        {{#each paragraphs}}
        <p style="color: #3f3f46; font-size: 16px; line-height: 24px; margin: 0 0 16px 0;">{{this}}</p>
        {{/each}}
        {{#if disabilities}}
        <p style="color: #71717a; font-size: 13px; margin: 24px 0 0 0;">You are receiving this because your child's record includes: {{disabilities}}.</p>
        {{/if}}
      </td>
    </tr>
    <tr>
      <td style="padding: 24px 0; text-align: center;">
        <p style="color: #a1a1aa; font-size: 11px; margin: 0 0 8px 0;">{{organisation_name}}</p>
        <p style="color: #a1a1aa; font-size: 11px; margin: 0;">
          <a href="{{unsubscribe_url}}" style="color: #71717a;">Unsubscribe from these emails</a>
        </p>
      </td>
    </tr>
  </table>
</body>
</html>"#;

const PARENT_TEXT_TEMPLATE: &str = r#"{{{subject}}}

Dear {{{guardian_name}}},
{{#if event}}

{{{event.title}}}{{#if event.starts_at}} ({{{event.starts_at}}}){{/if}}
{{/if}}

{{{message}}}
{{#if disabilities}}

You are receiving this because your child's record includes: {{{disabilities}}}.
{{/if}}

---
{{{organisation_name}}}
Unsubscribe: {{{unsubscribe_url}}}
"#;
