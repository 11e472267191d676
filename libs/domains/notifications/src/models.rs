//! Data models for the notifications domain.

use chrono::{DateTime, Utc};
use job_queue::{JobId, QueueJob};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;
use validator::{Validate, ValidateEmail, ValidationError, ValidationErrors, ValidationErrorsKind};

/// E.164: optional `+`, no leading zero, at most 15 digits.
static PHONE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[1-9][0-9]{5,14}$").unwrap());

/// Longest address an SMTP path can carry.
const MAX_EMAIL_LENGTH: usize = 254;

// ============================================================================
// Channels and recipients
// ============================================================================

/// Delivery medium. Derived from the payload variant, never set separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Broadcast to every member of a team.
    Team,
    /// Direct message to one or more users.
    User,
    /// In-app notification (bell icon).
    InApp,
    Email,
    Sms,
    Push,
    /// User message held until `deliver_at`.
    ScheduledUser,
}

impl Channel {
    /// Environment-variable fragment, e.g. `IN_APP`.
    pub fn env_key(&self) -> String {
        self.as_ref().to_uppercase()
    }
}

/// Notification priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// An addressable delivery target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Recipient {
    User(Uuid),
    Email(String),
    Phone(String),
    /// Expanded to the team's members before any send.
    Team(Uuid),
}

impl Recipient {
    pub fn is_team(&self) -> bool {
        matches!(self, Recipient::Team(_))
    }

    /// Recipient kind label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Recipient::User(_) => "user",
            Recipient::Email(_) => "email",
            Recipient::Phone(_) => "phone",
            Recipient::Team(_) => "team",
        }
    }
}

impl Validate for Recipient {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        match self {
            Recipient::Email(address) => {
                if let Err(error) = validate_email_address(address) {
                    errors.add("email", error);
                }
            }
            Recipient::Phone(number) => {
                if let Err(error) = validate_phone_number(number) {
                    errors.add("phone", error);
                }
            }
            Recipient::User(_) | Recipient::Team(_) => {}
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::User(id) => write!(f, "user:{}", id),
            Recipient::Email(address) => write!(f, "email:{}", address),
            Recipient::Phone(number) => write!(f, "phone:{}", number),
            Recipient::Team(id) => write!(f, "team:{}", id),
        }
    }
}

fn validate_email_address(address: &str) -> Result<(), ValidationError> {
    if address.len() > MAX_EMAIL_LENGTH || !address.validate_email() {
        return Err(ValidationError::new("email")
            .with_message(format!("invalid email address '{}'", address).into()));
    }
    Ok(())
}

fn validate_phone_number(number: &str) -> Result<(), ValidationError> {
    if !PHONE_NUMBER.is_match(number) {
        return Err(ValidationError::new("phone")
            .with_message(format!("invalid phone number '{}'", number).into()));
    }
    Ok(())
}

fn validate_email_addresses(addresses: &[String]) -> Result<(), ValidationError> {
    addresses
        .iter()
        .try_for_each(|address| validate_email_address(address))
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank").with_message("must not be blank".into()));
    }
    Ok(())
}

fn email_has_body(content: &EmailContent) -> Result<(), ValidationError> {
    if content.text_body.is_empty() && content.html_body.as_deref().is_none_or(str::is_empty) {
        return Err(ValidationError::new("no_body").with_message("email has no body".into()));
    }
    Ok(())
}

// ============================================================================
// Payloads
// ============================================================================

/// Title + message content shared by team, user, in-app and scheduled messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct MessageContent {
    /// Short headline.
    #[validate(length(max = 255), custom(function = "not_blank"))]
    pub title: String,
    /// Message body.
    #[validate(custom(function = "not_blank"))]
    pub message: String,
    /// Priority, defaults to normal.
    #[serde(default)]
    pub priority: Priority,
    /// Arbitrary structured data for the client (entity ids, deep-link params).
    #[serde(default)]
    pub data: serde_json::Value,
    /// Link the client opens on click.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
}

impl MessageContent {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            priority: Priority::Normal,
            data: serde_json::Value::Null,
            action_url: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_action_url(mut self, url: impl Into<String>) -> Self {
        self.action_url = Some(url.into());
        self
    }
}

/// Rendered email. Template rendering happens upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "email_has_body"))]
pub struct EmailContent {
    #[validate(length(max = 998), custom(function = "not_blank"))]
    pub subject: String,
    pub text_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(custom(function = "validate_email_addresses"))]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(email, length(max = 254))]
    pub reply_to: Option<String>,
}

impl EmailContent {
    pub fn new(subject: impl Into<String>, text_body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            text_body: text_body.into(),
            html_body: None,
            cc: Vec::new(),
            reply_to: None,
        }
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html_body = Some(html.into());
        self
    }
}

/// SMS text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct SmsContent {
    #[validate(length(max = 1600), custom(function = "not_blank"))]
    pub body: String,
}

/// Mobile push notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PushContent {
    #[validate(length(max = 255), custom(function = "not_blank"))]
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<u32>,
}

/// User message delivered no earlier than `deliver_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ScheduledContent {
    #[serde(flatten)]
    #[validate(nested)]
    pub content: MessageContent,
    pub deliver_at: DateTime<Utc>,
}

/// Channel-specific payload, tagged by channel.
///
/// ```json
/// { "channel": "sms", "body": "Your order shipped" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum NotificationPayload {
    Team(MessageContent),
    User(MessageContent),
    InApp(MessageContent),
    Email(EmailContent),
    Sms(SmsContent),
    Push(PushContent),
    ScheduledUser(ScheduledContent),
}

impl NotificationPayload {
    pub fn channel(&self) -> Channel {
        match self {
            NotificationPayload::Team(_) => Channel::Team,
            NotificationPayload::User(_) => Channel::User,
            NotificationPayload::InApp(_) => Channel::InApp,
            NotificationPayload::Email(_) => Channel::Email,
            NotificationPayload::Sms(_) => Channel::Sms,
            NotificationPayload::Push(_) => Channel::Push,
            NotificationPayload::ScheduledUser(_) => Channel::ScheduledUser,
        }
    }

    /// Message content for the inbox-style channels.
    pub fn message(&self) -> Option<&MessageContent> {
        match self {
            NotificationPayload::Team(m)
            | NotificationPayload::User(m)
            | NotificationPayload::InApp(m) => Some(m),
            NotificationPayload::ScheduledUser(s) => Some(&s.content),
            _ => None,
        }
    }

}

impl Validate for NotificationPayload {
    fn validate(&self) -> Result<(), ValidationErrors> {
        match self {
            NotificationPayload::Team(m)
            | NotificationPayload::User(m)
            | NotificationPayload::InApp(m) => m.validate(),
            NotificationPayload::Email(e) => e.validate(),
            NotificationPayload::Sms(s) => s.validate(),
            NotificationPayload::Push(p) => p.validate(),
            NotificationPayload::ScheduledUser(s) => s.validate(),
        }
    }
}

// ============================================================================
// Job body
// ============================================================================

/// Per-job fan-out bookkeeping, carried across retry rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutProgress {
    /// Last attempt round that ran (1-based, 0 before the first).
    pub round: u32,
    /// Recipients delivered across all rounds.
    pub delivered: u32,
    /// Recipients failed permanently across all rounds.
    pub failed: u32,
}

/// Notification job body held by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub payload: NotificationPayload,
    pub recipients: Vec<Recipient>,
    /// Originating module (crm, hr, workflow), for logs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub progress: FanoutProgress,
}

impl NotificationJob {
    pub fn new(payload: NotificationPayload, recipients: Vec<Recipient>) -> Self {
        Self {
            payload,
            recipients,
            source: None,
            progress: FanoutProgress::default(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn channel(&self) -> Channel {
        self.payload.channel()
    }

    /// Requested delivery time for scheduled channels.
    pub fn deliver_at(&self) -> Option<DateTime<Utc>> {
        match &self.payload {
            NotificationPayload::ScheduledUser(s) => Some(s.deliver_at),
            _ => None,
        }
    }

    /// Same job addressed to a narrower recipient set.
    pub fn narrowed(&self, recipients: Vec<Recipient>, progress: FanoutProgress) -> Self {
        Self {
            payload: self.payload.clone(),
            recipients,
            source: self.source.clone(),
            progress,
        }
    }
}

impl QueueJob for NotificationJob {
    fn validate(&self) -> Result<(), String> {
        if self.recipients.is_empty() {
            return Err("recipients is empty".to_string());
        }
        if self.channel() == Channel::Team && !self.recipients.iter().any(Recipient::is_team) {
            return Err("team notification needs at least one team recipient".to_string());
        }

        let mut problems = Vec::new();
        for (index, recipient) in self.recipients.iter().enumerate() {
            if let Err(errors) = recipient.validate() {
                problems.push(describe(&errors, &format!("recipients[{}]", index)));
            }
        }
        if let Err(errors) = self.payload.validate() {
            problems.push(describe(&errors, "payload"));
        }

        if problems.is_empty() { Ok(()) } else { Err(problems.join("; ")) }
    }
}

/// Flattens nested validation errors into sorted `path: message` lines.
fn describe(errors: &ValidationErrors, prefix: &str) -> String {
    let mut lines = Vec::new();
    collect_messages(errors, prefix, &mut lines);
    lines.sort();
    lines.join("; ")
}

fn collect_messages(errors: &ValidationErrors, prefix: &str, lines: &mut Vec<String>) {
    for (field, kind) in errors.errors() {
        // struct-level errors carry no field name of their own
        let path = if &**field == "__all__" {
            prefix.to_string()
        } else if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", prefix, field)
        };

        match kind {
            ValidationErrorsKind::Field(list) => {
                for error in list {
                    let message = error.message.as_deref().unwrap_or(error.code.as_ref());
                    lines.push(format!("{}: {}", path, message));
                }
            }
            ValidationErrorsKind::Struct(nested) => collect_messages(nested, &path, lines),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect_messages(nested, &format!("{}[{}]", path, index), lines);
                }
            }
        }
    }
}

/// Request body accepted from collaborators: a job plus an optional dedupe key.
#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueNotification {
    #[serde(flatten)]
    pub job: NotificationJob,
    #[serde(default)]
    pub dedupe_key: Option<String>,
}

/// Reference returned to collaborators after enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enqueued {
    pub id: JobId,
    pub channel: Channel,
}
