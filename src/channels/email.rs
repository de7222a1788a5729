//! Email mailbox: IMAP over TLS for fetching, SMTP via lettre for replies.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::channels::MailboxSource;
use crate::error::ChannelError;
use crate::workflow::state::Message;

const CHANNEL_NAME: &str = "email";

// ── Configuration ───────────────────────────────────────────────────

/// Mailbox configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl EmailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set (mailbox disabled).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("EMAIL_IMAP_HOST").ok()?;

        let imap_port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host =
            std::env::var("EMAIL_SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
        })
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

pub struct ImapMailbox {
    config: EmailConfig,
}

impl ImapMailbox {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EmailConfig {
        &self.config
    }
}

#[async_trait]
impl MailboxSource for ImapMailbox {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn fetch_recent(&self, limit: usize) -> Result<Vec<Message>, ChannelError> {
        let cfg = self.config.clone();
        let fetched = tokio::task::spawn_blocking(move || fetch_recent_imap(&cfg, limit))
            .await
            .map_err(|e| ChannelError::FetchFailed {
                name: CHANNEL_NAME.into(),
                reason: format!("fetch task panicked: {e}"),
            })?
            .map_err(|e| ChannelError::FetchFailed {
                name: CHANNEL_NAME.into(),
                reason: e.to_string(),
            })?;
        debug!(count = fetched.len(), "Fetched recent emails");
        Ok(fetched)
    }

    async fn send(&self, message: &Message, draft: &str) -> Result<(), ChannelError> {
        let email = build_reply(&self.config.from_address, message, draft)?;
        let cfg = self.config.clone();
        let to = message.sender.clone();
        tokio::task::spawn_blocking(move || send_smtp(&cfg, &email))
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: CHANNEL_NAME.into(),
                reason: format!("send task panicked: {e}"),
            })??;
        info!("Email sent to {to}");
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: CHANNEL_NAME.into(),
        reason,
    }
}

/// `Re:`-prefixed subject, unless it already is one.
pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.is_empty() {
        return "Re: (no subject)".to_string();
    }
    if trimmed
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("re:"))
    {
        return trimmed.to_string();
    }
    format!("Re: {trimmed}")
}

/// Build the threaded reply to `original`.
fn build_reply(
    from: &str,
    original: &Message,
    body: &str,
) -> Result<lettre::Message, ChannelError> {
    let mut builder = lettre::Message::builder()
        .from(
            from.parse()
                .map_err(|e| send_failed(format!("Invalid from address: {e}")))?,
        )
        .to(original
            .sender
            .parse()
            .map_err(|e| send_failed(format!("Invalid to address: {e}")))?)
        .subject(reply_subject(&original.subject));

    if let Some(message_id) = original.reply_to_message_id.as_deref() {
        builder = builder
            .in_reply_to(message_id.to_string())
            .references(message_id.to_string());
    }

    builder
        .body(body.to_string())
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))
}

fn send_smtp(config: &EmailConfig, email: &lettre::Message) -> Result<(), ChannelError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::starttls_relay(&config.smtp_host)
        .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
        .port(config.smtp_port)
        .credentials(creds)
        .build();

    transport
        .send(email)
        .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;
    Ok(())
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            let name = MimeHeaders::attachment_name(part).unwrap_or("file");
            return format!("[Attachment: {name}]\n{text}");
        }
    }
    String::new()
}

fn parsed_date(parsed: &mail_parser::Message) -> Option<DateTime<Utc>> {
    let d = parsed.date()?;
    let naive = chrono::NaiveDate::from_ymd_opt(d.year as i32, u32::from(d.month), u32::from(d.day))?
        .and_hms_opt(u32::from(d.hour), u32::from(d.minute), u32::from(d.second))?;
    let offset_secs = (i64::from(d.tz_hour) * 3600 + i64::from(d.tz_minute) * 60)
        * if d.tz_before_gmt { -1 } else { 1 };
    Some(naive.and_utc() - chrono::Duration::seconds(offset_secs))
}

/// Convert raw RFC 822 bytes into a [`Message`]. `fallback_id` is used when
/// the email carries no `Message-ID`.
pub fn parse_email(raw: &[u8], fallback_id: &str) -> Option<Message> {
    let parsed = MessageParser::default().parse(raw)?;

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_default();
    let recipients = parsed
        .to()
        .map(|list| {
            list.iter()
                .filter_map(|a| a.address().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    let header_id = parsed.message_id().map(|s| s.to_string());

    Some(Message {
        id: header_id.clone().unwrap_or_else(|| fallback_id.to_string()),
        sender,
        recipients,
        subject: parsed.subject().unwrap_or_default().to_string(),
        body: extract_text(&parsed),
        received_at: parsed_date(&parsed).unwrap_or_else(Utc::now),
        thread_id: parsed
            .in_reply_to()
            .as_text()
            .map(|s| s.to_string()),
        reply_to_message_id: header_id.map(|id| format!("<{id}>")),
    })
}

/// Error type for IMAP fetch operations.
type ImapError = Box<dyn std::error::Error + Send + Sync>;

/// Fetch the `limit` most recent INBOX messages via raw IMAP over TLS
/// (blocking; run in `spawn_blocking`). Uses `BODY.PEEK[]` so the
/// mailbox's seen flags are left alone.
fn fetch_recent_imap(config: &EmailConfig, limit: usize) -> Result<Vec<Message>, ImapError> {
    use std::sync::Arc as StdArc;

    let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = StdArc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name: rustls::pki_types::ServerName<'_> =
        rustls::pki_types::ServerName::try_from(config.imap_host.clone())?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)?;
    let mut tls = rustls::StreamOwned::new(conn, tcp);

    let read_line =
        |tls: &mut rustls::StreamOwned<rustls::ClientConnection, TcpStream>| -> Result<String, ImapError> {
            let mut buf = Vec::new();
            loop {
                let mut byte = [0u8; 1];
                match std::io::Read::read(tls, &mut byte) {
                    Ok(0) => return Err("IMAP connection closed".into()),
                    Ok(_) => {
                        buf.push(byte[0]);
                        if buf.ends_with(b"\r\n") {
                            return Ok(String::from_utf8_lossy(&buf).to_string());
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

    let send_cmd =
        |tls: &mut rustls::StreamOwned<rustls::ClientConnection, TcpStream>,
         tag: &str,
         cmd: &str|
         -> Result<Vec<String>, ImapError> {
            let full = format!("{tag} {cmd}\r\n");
            IoWrite::write_all(tls, full.as_bytes())?;
            IoWrite::flush(tls)?;
            let mut lines = Vec::new();
            loop {
                let line = read_line(tls)?;
                let done = line.starts_with(tag);
                lines.push(line);
                if done {
                    break;
                }
            }
            Ok(lines)
        };

    let _greeting = read_line(&mut tls)?;

    let login_resp = send_cmd(
        &mut tls,
        "A1",
        &format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            config.password.expose_secret()
        ),
    )?;
    if !login_resp.last().is_some_and(|l| l.contains("OK")) {
        return Err("IMAP login failed".into());
    }

    let _select = send_cmd(&mut tls, "A2", "SELECT \"INBOX\"")?;

    let search_resp = send_cmd(&mut tls, "A3", "UID SEARCH ALL")?;
    let uids = parse_search_response(&search_resp);
    let recent = most_recent(&uids, limit);

    let mut results = Vec::with_capacity(recent.len());
    let mut tag_counter = 4_u32;

    for uid in recent {
        let fetch_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let fetch_resp = send_cmd(&mut tls, &fetch_tag, &format!("UID FETCH {uid} BODY.PEEK[]"))?;

        // Drop the untagged FETCH header, the closing paren, and the tag line.
        let raw: String = fetch_resp
            .iter()
            .skip(1)
            .take(fetch_resp.len().saturating_sub(2))
            .filter(|line| line.trim_end() != ")")
            .cloned()
            .collect();

        if let Some(message) = parse_email(raw.as_bytes(), &format!("imap-uid-{uid}")) {
            results.push(message);
        }
    }

    let logout_tag = format!("A{tag_counter}");
    let _ = send_cmd(&mut tls, &logout_tag, "LOGOUT");

    Ok(results)
}

/// UIDs from `* SEARCH` lines.
fn parse_search_response(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter(|line| line.starts_with("* SEARCH"))
        .flat_map(|line| line.split_whitespace().skip(2))
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// The last `limit` entries, in ascending order.
fn most_recent(uids: &[u32], limit: usize) -> Vec<u32> {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    let start = sorted.len().saturating_sub(limit);
    sorted[start..].to_vec()
}

// ── Tests ───────────────────────────────────────────────────────────
