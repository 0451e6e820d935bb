//! Outbound change notifications.

use std::thread;
use std::time::Duration;

use reqwest::blocking::{multipart, Client, RequestBuilder, Response};
use reqwest::{StatusCode, Url};
use serde_json::{json, Value};

use crate::config::NotifySettings;
use crate::decision::ChangeSummary;
use crate::error::{Error, Result};
use crate::monitor::SnapshotRecord;
use crate::util::tail_text;

pub const CONTENT_LIMIT: usize = 2000;
const DEFAULT_USER_AGENT: &str = concat!("tile-watch/", env!("CARGO_PKG_VERSION"));

pub trait Notifier {
    fn notify(&self, message: &str, image_png: &[u8], file_name: &str) -> Result<()>;
}

/// Message for a recorded change. The first line is always `label`.
pub fn change_message(label: &str, record: &SnapshotRecord, summary: &ChangeSummary) -> String {
    let mut lines = vec![
        label.to_string(),
        format!("snapshot: {}", record.id),
        format!(
            "changed tiles: {} ({} px)",
            summary.changed_tile_count, summary.changed_area
        ),
    ];
    if let Some(b) = summary.bounds {
        lines.push(format!("region: x={} y={} w={} h={}", b.x, b.y, b.w, b.h));
    }
    lines.join("\n")
}

/// Splits text into pages of at most `limit` characters, cutting at a newline,
/// then a space, then anywhere.
pub fn split_content(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut pages = Vec::new();
    let mut rest = text.trim();

    while rest.chars().count() > limit {
        let hard_cut = rest
            .char_indices()
            .nth(limit)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let window = &rest[..hard_cut];
        let cut = window
            .rfind('\n')
            .filter(|&i| i > 0)
            .or_else(|| window.rfind(' ').filter(|&i| i > 0))
            .unwrap_or(hard_cut);
        pages.push(rest[..cut].trim_end().to_string());
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() {
        pages.push(rest.to_string());
    }
    pages
}

/// Discord-compatible webhook: image attached to the first page, later pages as text.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    endpoint: Url,
    max_attempts: u32,
}

impl WebhookNotifier {
    pub fn from_settings(settings: &NotifySettings) -> Result<Self> {
        let url = settings
            .url
            .as_deref()
            .ok_or_else(|| Error::ConfigValidation("notify.url is not set".to_string()))?;
        let endpoint = build_endpoint(url, settings.wait, settings.thread_id.as_deref())?;
        let client = Client::builder()
            .user_agent(
                settings
                    .user_agent
                    .clone()
                    .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            )
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            max_attempts: settings.max_attempts.max(1),
        })
    }

    fn post_with_retry<F>(&self, mut make_request: F) -> Result<()>
    where
        F: FnMut() -> Result<RequestBuilder>,
    {
        for attempt in 1..=self.max_attempts {
            let response = make_request()?.send()?;
            let status = response.status();
            if status.is_success() {
                return Ok(());
            }

            let header_wait = retry_after_header(&response);
            let body = response.text().unwrap_or_default();
            if status == StatusCode::TOO_MANY_REQUESTS && attempt < self.max_attempts {
                let wait = header_wait
                    .or_else(|| retry_after_body(&body))
                    .unwrap_or(1.0)
                    .max(0.5);
                log::warn!(
                    "webhook rate limited (attempt {}/{}), retrying in {:.1}s",
                    attempt,
                    self.max_attempts,
                    wait
                );
                thread::sleep(Duration::from_secs_f64(wait));
                continue;
            }

            return Err(Error::Notify(format!(
                "HTTP {}: {}",
                status,
                tail_text(&body, 500)
            )));
        }
        Err(Error::Notify(format!(
            "gave up after {} attempts",
            self.max_attempts
        )))
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, message: &str, image_png: &[u8], file_name: &str) -> Result<()> {
        let pages = split_content(message, CONTENT_LIMIT);
        let first = pages.first().cloned().unwrap_or_default();

        self.post_with_retry(|| {
            let payload = json!({
                "content": first,
                "attachments": [{"id": 0, "filename": file_name}],
            });
            let file = multipart::Part::bytes(image_png.to_vec())
                .file_name(file_name.to_string())
                .mime_str("image/png")?;
            let form = multipart::Form::new()
                .text("payload_json", payload.to_string())
                .part("files[0]", file);
            Ok(self.client.post(self.endpoint.clone()).multipart(form))
        })?;

        for (i, page) in pages.iter().enumerate().skip(1) {
            self.post_with_retry(|| {
                Ok(self
                    .client
                    .post(self.endpoint.clone())
                    .json(&json!({ "content": page })))
            })?;
            log::debug!("sent follow-up page {}/{}", i + 1, pages.len());
        }

        log::info!(
            "notification sent: {} page(s), {} byte attachment",
            pages.len(),
            image_png.len()
        );
        Ok(())
    }
}

fn build_endpoint(url: &str, wait: bool, thread_id: Option<&str>) -> Result<Url> {
    let mut endpoint = Url::parse(url)
        .map_err(|e| Error::ConfigValidation(format!("invalid notify.url: {e}")))?;
    {
        let mut query = endpoint.query_pairs_mut();
        if wait {
            query.append_pair("wait", "true");
        }
        if let Some(thread_id) = thread_id {
            query.append_pair("thread_id", thread_id);
        }
    }
    if endpoint.query() == Some("") {
        endpoint.set_query(None);
    }
    Ok(endpoint)
}

fn retry_after_header(response: &Response) -> Option<f64> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
}

fn retry_after_body(body: &str) -> Option<f64> {
    serde_json::from_str::<Value>(body)
        .ok()?
        .get("retry_after")?
        .as_f64()
}
