use std::time::Duration;

use log::{debug, warn};
use reqwest::Client;
use serde::Serialize;
use tokio::task::JoinHandle;
use url::Url;

#[derive(Serialize)]
struct WebhookPayload<'a> {
    content: &'a str,
}

/// Human-facing webhook notifications. Never part of coordination: delivery
/// failures are logged and otherwise ignored.
#[derive(Clone)]
pub struct Notifier {
    client: Client,
    url: Option<Url>,
}

impl Notifier {
    pub fn new(url: Option<Url>) -> Self {
        let client = Client::builder()
            .user_agent(concat!("dbsync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self { client, url }
    }

    pub fn send(&self, content: String) -> Option<JoinHandle<()>> {
        let url = self.url.clone()?;
        let client = self.client.clone();
        Some(tokio::spawn(async move {
            let result = client
                .post(url)
                .json(&WebhookPayload { content: &content })
                .send()
                .await
                .and_then(|r| r.error_for_status());
            match result {
                Ok(_) => debug!("notification sent"),
                Err(e) => warn!("notification failed: {e}"),
            }
        }))
    }

    pub fn database_updated(&self, database: &str) -> Option<JoinHandle<()>> {
        self.send(format!("✅ Database updated: **{database}**"))
    }
}
