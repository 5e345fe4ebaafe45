//! Email ingester: polls a mailbox on a fixed interval, extracts story
//! URLs from unseen messages, and pushes newly discovered [`StoryTask`]s into
//! the coordinator's ingress channel.
//!
//! Grounded in `root/app/services/url_ingester.py`. Mailbox access goes
//! through the narrow [`MailboxClient`] trait so tests can substitute an
//! in-memory fake instead of a real IMAP server; the real implementation
//! wraps the synchronous `imap` crate via `spawn_blocking`, matching how a
//! blocking C-library binding is typically bridged into a tokio runtime.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::activeset::ActiveSet;
use crate::classifier;
use crate::config::EmailConfig;
use crate::model::StoryTask;
use crate::notify::Notifier;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("failed to connect to mailbox {server}: {message}")]
    Connect { server: String, message: String },
    #[error("failed to fetch messages: {0}")]
    Fetch(String),
}

/// A single unseen message, already decoded to a plain-text/HTML body.
#[derive(Debug, Clone)]
pub struct MailMessage {
    pub id: String,
    pub body: String,
}

/// Narrow mailbox surface the ingester depends on.
#[async_trait]
pub trait MailboxClient: Send + Sync {
    async fn fetch_unseen(&self) -> Result<Vec<MailMessage>, MailboxError>;
    async fn mark_seen(&self, id: &str) -> Result<(), MailboxError>;
}

/// IMAP-backed mailbox client. Connects fresh on every poll (matching the
/// original's short-lived-connection approach) since polling intervals are
/// measured in minutes, not seconds.
pub struct ImapMailboxClient {
    config: EmailConfig,
}

impl ImapMailboxClient {
    #[must_use]
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailboxClient for ImapMailboxClient {
    #[instrument(skip(self), fields(server = %self.config.server, mailbox = %self.config.mailbox))]
    async fn fetch_unseen(&self) -> Result<Vec<MailMessage>, MailboxError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || fetch_unseen_blocking(&config))
            .await
            .map_err(|e| MailboxError::Fetch(e.to_string()))?
    }

    async fn mark_seen(&self, id: &str) -> Result<(), MailboxError> {
        let config = self.config.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || mark_seen_blocking(&config, &id))
            .await
            .map_err(|e| MailboxError::Fetch(e.to_string()))?
    }
}

fn connect_session(
    config: &EmailConfig,
) -> Result<imap::Session<native_tls::TlsStream<std::net::TcpStream>>, MailboxError> {
    let tls = native_tls::TlsConnector::builder()
        .build()
        .map_err(|e| MailboxError::Connect {
            server: config.server.clone(),
            message: e.to_string(),
        })?;
    let client =
        imap::connect((config.server.as_str(), 993), config.server.as_str(), &tls).map_err(|e| {
            MailboxError::Connect {
                server: config.server.clone(),
                message: e.to_string(),
            }
        })?;
    let mut session = client
        .login(&config.user, &config.password)
        .map_err(|(e, _)| MailboxError::Connect {
            server: config.server.clone(),
            message: e.to_string(),
        })?;
    session
        .select(&config.mailbox)
        .map_err(|e| MailboxError::Fetch(e.to_string()))?;
    Ok(session)
}

fn fetch_unseen_blocking(config: &EmailConfig) -> Result<Vec<MailMessage>, MailboxError> {
    let mut session = connect_session(config)?;
    let uids = session
        .uid_search("UNSEEN")
        .map_err(|e| MailboxError::Fetch(e.to_string()))?;

    let mut messages = Vec::new();
    for uid in uids {
        let fetched = session
            .uid_fetch(uid.to_string(), "RFC822")
            .map_err(|e| MailboxError::Fetch(e.to_string()))?;
        for m in fetched.iter() {
            if let Some(raw) = m.body() {
                let body = decode_body(raw);
                messages.push(MailMessage {
                    id: uid.to_string(),
                    body,
                });
            }
        }
    }
    let _ = session.logout();
    Ok(messages)
}

fn mark_seen_blocking(config: &EmailConfig, id: &str) -> Result<(), MailboxError> {
    let mut session = connect_session(config)?;
    session
        .uid_store(id, "+FLAGS (\\Seen)")
        .map_err(|e| MailboxError::Fetch(e.to_string()))?;
    let _ = session.logout();
    Ok(())
}

fn decode_body(raw: &[u8]) -> String {
    mail_parser::MessageParser::default()
        .parse(raw)
        .and_then(|msg| {
            msg.body_text(0)
                .map(|s| s.into_owned())
                .or_else(|| msg.body_html(0).map(|s| s.into_owned()))
        })
        .unwrap_or_default()
}

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>\)]+"#).expect("static URL regex must compile"));

/// Extracts candidate URLs from a decoded message body, trimming trailing
/// punctuation a sentence or markup might have attached.
#[must_use]
pub fn extract_urls(body: &str) -> Vec<String> {
    URL_PATTERN
        .find_iter(body)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', '!', '?']).to_string())
        .collect()
}

/// Runs the ingest loop until `shutdown` resolves, polling every
/// `config.poll_seconds`.
#[instrument(skip_all)]
pub async fn run(
    mailbox: Arc<dyn MailboxClient>,
    config: EmailConfig,
    active_set: Arc<ActiveSet>,
    notifier: Arc<Notifier>,
    sender: mpsc::Sender<StoryTask>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(config.poll_seconds));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = poll_once(&mailbox, &config, &active_set, &notifier, &sender).await {
                    warn!(error = %e, "mailbox poll failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("email ingester shutting down");
                    break;
                }
            }
        }
    }
}

async fn poll_once(
    mailbox: &Arc<dyn MailboxClient>,
    config: &EmailConfig,
    active_set: &Arc<ActiveSet>,
    notifier: &Arc<Notifier>,
    sender: &mpsc::Sender<StoryTask>,
) -> Result<(), MailboxError> {
    let messages = mailbox.fetch_unseen().await?;
    debug!(count = messages.len(), "fetched unseen messages");

    for message in messages {
        for url in extract_urls(&message.body) {
            let classification = classifier::classify(&url);
            if config.disabled_sites.contains(&classification.site) {
                debug!(site = %classification.site, "skipping disabled site");
                notifier
                    .notify(&format!(
                        "Skipped {} — site \"{}\" is disabled",
                        classification.normalized_url, classification.site
                    ))
                    .await;
                continue;
            }
            if active_set.insert(classification.normalized_url.clone()) {
                let task = StoryTask::new(classification.normalized_url, classification.site);
                if sender.send(task).await.is_err() {
                    warn!("ingress channel closed, dropping discovered task");
                }
            }
        }
        mailbox.mark_seen(&message.id).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_url_and_trims_trailing_punctuation() {
        let body = "New story posted: https://www.fanfiction.net/s/1/1/Title. Enjoy!";
        let urls = extract_urls(body);
        assert_eq!(urls, vec!["https://www.fanfiction.net/s/1/1/Title"]);
    }

    #[test]
    fn extracts_multiple_urls() {
        let body = "https://a.example/1 and also https://b.example/2";
        let urls = extract_urls(body);
        assert_eq!(urls.len(), 2);
    }

    #[tokio::test]
    async fn poll_once_skips_disabled_sites_and_dedups() {
        struct FakeMailbox;
        #[async_trait]
        impl MailboxClient for FakeMailbox {
            async fn fetch_unseen(&self) -> Result<Vec<MailMessage>, MailboxError> {
                Ok(vec![MailMessage {
                    id: "1".into(),
                    body: "https://www.fanfiction.net/s/1/1/Title".into(),
                }])
            }
            async fn mark_seen(&self, _id: &str) -> Result<(), MailboxError> {
                Ok(())
            }
        }

        let config = EmailConfig {
            user: "u".into(),
            password: "p".into(),
            server: "s".into(),
            mailbox: "INBOX".into(),
            poll_seconds: 60,
            disabled_sites: ["fanfiction".to_string()].into_iter().collect(),
        };
        let active_set = Arc::new(ActiveSet::new());
        let notifier = Arc::new(Notifier::new(&crate::config::NotificationsConfig::default()));
        let (tx, mut rx) = mpsc::channel(8);
        let mailbox: Arc<dyn MailboxClient> = Arc::new(FakeMailbox);

        poll_once(&mailbox, &config, &active_set, &notifier, &tx).await.unwrap();

        drop(tx);
        assert!(rx.recv().await.is_none());
    }
}
