use async_trait::async_trait;
use anyhow::{Context, Result};
use log::info;

/// Port to the outbound notification channel.
///
/// Pushing a notification is always best-effort from the caller's point of
/// view; implementations report failure but the pipeline never aborts on it.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn push(&self, target: &str, title: &str, lines: &[String], link: Option<&str>) -> Result<()>;
}

/// Webhook sink speaking the Feishu rich-post message format
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn push(&self, target: &str, title: &str, lines: &[String], link: Option<&str>) -> Result<()> {
        let mut content: Vec<Vec<serde_json::Value>> = lines
            .iter()
            .map(|line| vec![serde_json::json!({ "tag": "text", "text": line })])
            .collect();
        if let Some(href) = link {
            content.push(vec![serde_json::json!({
                "tag": "a",
                "text": "Download report",
                "href": href,
            })]);
        }
        let payload = serde_json::json!({
            "msg_type": "post",
            "content": {
                "post": {
                    "zh_cn": {
                        "title": title,
                        "content": content,
                    }
                }
            }
        });

        let response = self
            .client
            .post(target)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("failed to reach webhook {target}"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("webhook {target} answered {status}");
        }
        info!("notification delivered: {title}");
        Ok(())
    }
}
