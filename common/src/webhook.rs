use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    config::{DeviceConfig, WebhookMethod, WEBHOOK_MAX_RESPONSE_BODY},
    platform::Clock,
    state::DeviceState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRequest {
    pub method: WebhookMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Only set for `POST`.
    pub body: Option<String>,
}

impl WebhookRequest {
    /// Builds the request described by the stored configuration, or `None`
    /// when no webhook URL is configured.
    pub fn from_config(config: &DeviceConfig) -> Option<Self> {
        let url = config.webhook_url.trim();
        if url.is_empty() {
            return None;
        }

        let body = match config.webhook_method {
            WebhookMethod::Get => None,
            WebhookMethod::Post => Some(config.webhook_payload.clone()),
        };

        Some(Self {
            method: config.webhook_method,
            url: url.to_string(),
            headers: parse_headers(&config.webhook_headers),
            body,
        })
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(key, _)| key.eq_ignore_ascii_case(name))
    }
}

/// Parses free-form header text, one `Name: value` per line. Lines without a
/// colon, or with nothing before it, are skipped.
pub fn parse_headers(text: &str) -> Vec<(String, String)> {
    text.split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebhookError {
    #[error("webhook request timed out")]
    Timeout,
    #[error("webhook transport error: {0}")]
    Transport(String),
    #[error("webhook answered with HTTP {status}")]
    HttpStatus { status: u16, body: String },
}

/// Sends one HTTP request. Certificate validation is expected to be off so
/// that self-signed test endpoints work.
pub trait WebhookTransport {
    /// Returns any HTTP response, whatever its status. Only failures to get a
    /// response at all are errors.
    fn send(&mut self, request: &WebhookRequest) -> Result<WebhookResponse, WebhookError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing queued.
    Idle,
    /// Another dispatch holds the single-flight slot.
    Busy,
    /// A press was consumed but no webhook URL is configured.
    Skipped,
    Delivered { status: u16 },
    Failed(WebhookError),
}

/// Turns queued presses into webhook calls, one at a time.
#[derive(Debug, Clone, Default)]
pub struct WebhookDispatcher {
    delivered: u32,
    failed: u32,
}

impl WebhookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> u32 {
        self.delivered
    }

    pub fn failed(&self) -> u32 {
        self.failed
    }

    /// Consumes at most one queued press. Failures are logged and dropped;
    /// there are no retries.
    pub fn poll<T: WebhookTransport, C: Clock>(
        &mut self,
        state: &DeviceState,
        config: &DeviceConfig,
        transport: &mut T,
        clock: &C,
    ) -> DispatchOutcome {
        if state.pending() == 0 {
            return DispatchOutcome::Idle;
        }
        if !state.begin_flight() {
            return DispatchOutcome::Busy;
        }
        if !state.take_press() {
            state.end_flight();
            return DispatchOutcome::Idle;
        }
        state.touch(clock.now_ms());
        info!("dispatching webhook ({} still pending)", state.pending());

        let outcome = match WebhookRequest::from_config(config) {
            None => {
                info!("webhook URL not set, skipping request");
                DispatchOutcome::Skipped
            }
            Some(request) => self.deliver(transport, &request),
        };

        state.touch(clock.now_ms());
        state.end_flight();
        outcome
    }

    fn deliver<T: WebhookTransport>(
        &mut self,
        transport: &mut T,
        request: &WebhookRequest,
    ) -> DispatchOutcome {
        info!(
            "sending {} {} ({} header(s))",
            request.method.as_str(),
            request.url,
            request.headers.len()
        );
        for (name, _) in &request.headers {
            debug!("webhook header: {name}");
        }

        let result = transport.send(request).and_then(|response| {
            if response.is_success() {
                Ok(response)
            } else {
                Err(WebhookError::HttpStatus {
                    status: response.status,
                    body: response.body,
                })
            }
        });

        match result {
            Ok(response) => {
                self.delivered = self.delivered.saturating_add(1);
                info!(
                    "webhook answered HTTP {}: {}",
                    response.status,
                    clip(&response.body)
                );
                DispatchOutcome::Delivered {
                    status: response.status,
                }
            }
            Err(err) => {
                self.failed = self.failed.saturating_add(1);
                match &err {
                    WebhookError::HttpStatus { body, .. } => {
                        warn!("{err}: {}", clip(body));
                    }
                    _ => warn!("{err}"),
                }
                DispatchOutcome::Failed(err)
            }
        }
    }
}

fn clip(body: &str) -> &str {
    if body.len() <= WEBHOOK_MAX_RESPONSE_BODY {
        return body;
    }
    let mut end = WEBHOOK_MAX_RESPONSE_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
