//! Notification fan-out: delivers a message to every configured
//! back-end concurrently, best-effort.
//!
//! Grounded in the original's `root/app/notifications/` back-end dispatch,
//! reworked from coroutine futures into a plain concurrent fan-out. Delivery
//! never fails the caller — the facade swallows errors after exhausting
//! retries and just logs them.

use std::time::Duration;

use tracing::{instrument, warn};

use crate::config::NotificationsConfig;

const MAX_ATTEMPTS: u32 = 3;

/// A single notification back-end.
#[async_trait::async_trait]
trait Backend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, message: &str) -> Result<(), String>;
}

struct PushbulletBackend {
    api_key: String,
    device: Option<String>,
    client: reqwest::Client,
}

#[async_trait::async_trait]
impl Backend for PushbulletBackend {
    fn name(&self) -> &'static str {
        "pushbullet"
    }

    async fn send(&self, message: &str) -> Result<(), String> {
        let mut body = serde_json::json!({
            "type": "note",
            "title": "fanfic-pipeline",
            "body": message,
        });
        if let Some(device) = &self.device {
            body["device_iden"] = serde_json::Value::String(device.clone());
        }

        let response = self
            .client
            .post("https://api.pushbullet.com/v2/pushes")
            .header("Access-Token", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("pushbullet returned status {}", response.status()))
        }
    }
}

struct AppriseBackend {
    url: String,
    client: reqwest::Client,
}

#[async_trait::async_trait]
impl Backend for AppriseBackend {
    fn name(&self) -> &'static str {
        "apprise"
    }

    async fn send(&self, message: &str) -> Result<(), String> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "body": message }))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("apprise endpoint returned status {}", response.status()))
        }
    }
}

/// Fans a notification message out to every configured back-end.
pub struct Notifier {
    backends: Vec<Box<dyn Backend>>,
}

impl Notifier {
    #[must_use]
    pub fn new(config: &NotificationsConfig) -> Self {
        let client = reqwest::Client::new();
        let mut backends: Vec<Box<dyn Backend>> = Vec::new();

        if config.pushbullet.enabled {
            if let Some(api_key) = &config.pushbullet.api_key {
                backends.push(Box::new(PushbulletBackend {
                    api_key: api_key.clone(),
                    device: config.pushbullet.device.clone(),
                    client: client.clone(),
                }));
            }
        }

        for url in &config.apprise.urls {
            backends.push(Box::new(AppriseBackend {
                url: url.clone(),
                client: client.clone(),
            }));
        }

        Self { backends }
    }

    /// Sends `message` to every back-end concurrently. Never returns an
    /// error; failures are logged per-backend and otherwise swallowed.
    #[instrument(skip(self))]
    pub async fn notify(&self, message: &str) {
        let sends = self
            .backends
            .iter()
            .map(|backend| send_with_retry(backend.as_ref(), message));
        futures_util::future::join_all(sends).await;
    }
}

async fn send_with_retry(backend: &dyn Backend, message: &str) {
    send_with_retry_and_backoff(backend, message, |attempt| Duration::from_secs(10 * u64::from(attempt))).await;
}

async fn send_with_retry_and_backoff(
    backend: &dyn Backend,
    message: &str,
    backoff: impl Fn(u32) -> Duration,
) {
    for attempt in 1..=MAX_ATTEMPTS {
        match backend.send(message).await {
            Ok(()) => return,
            Err(e) => {
                warn!(backend = backend.name(), attempt, error = %e, "notification attempt failed");
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
    }
    warn!(backend = backend.name(), "notification delivery abandoned after {MAX_ATTEMPTS} attempts");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlakyBackend {
        attempts: Arc<AtomicUsize>,
        succeed_on: usize,
    }

    #[async_trait::async_trait]
    impl Backend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }
        async fn send(&self, _message: &str) -> Result<(), String> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_on {
                Ok(())
            } else {
                Err("simulated failure".to_string())
            }
        }
    }

    #[tokio::test]
    async fn retries_until_success_within_attempt_budget() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let backend = FlakyBackend {
            attempts: attempts.clone(),
            succeed_on: 2,
        };
        send_with_retry_and_backoff(&backend, "hello", |_| Duration::from_millis(0)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let backend = FlakyBackend {
            attempts: attempts.clone(),
            succeed_on: 100,
        };
        send_with_retry_and_backoff(&backend, "hello", |_| Duration::from_millis(0)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_ATTEMPTS as usize);
    }
}
