use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

const AT_LIVE_ENDPOINT: &str = "https://api.africastalking.com/version1/messaging";
const AT_SANDBOX_ENDPOINT: &str = "https://api.sandbox.africastalking.com/version1/messaging";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound SMS channel. Failures are logged and reported as `None`.
#[async_trait]
pub trait SmsGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, recipients: &[String], text: &str) -> Option<Value>;
}

#[derive(Debug, Clone)]
pub struct AfricasTalkingConfig {
    pub username: String,
    pub api_key: String,
    pub sender: Option<String>,
    /// Defaults to the sandbox or live endpoint depending on `username`.
    pub endpoint: Option<String>,
}

pub struct AfricasTalkingGateway {
    config: AfricasTalkingConfig,
    client: reqwest::Client,
}

impl AfricasTalkingGateway {
    pub fn new(config: AfricasTalkingConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> &str {
        match self.config.endpoint.as_deref() {
            Some(endpoint) => endpoint,
            None if self.config.username == "sandbox" => AT_SANDBOX_ENDPOINT,
            None => AT_LIVE_ENDPOINT,
        }
    }
}

#[async_trait]
impl SmsGateway for AfricasTalkingGateway {
    fn name(&self) -> &str {
        "africastalking"
    }

    async fn send(&self, recipients: &[String], text: &str) -> Option<Value> {
        if recipients.is_empty() {
            warn!(event = "sms_send_skipped", reason = "no recipients");
            return None;
        }

        let to = recipients.join(",");
        let mut form = vec![
            ("username", self.config.username.as_str()),
            ("to", to.as_str()),
            ("message", text),
        ];
        if let Some(sender) = self.config.sender.as_deref() {
            form.push(("from", sender));
        }

        let response = match self
            .client
            .post(self.endpoint())
            .header("apiKey", &self.config.api_key)
            .header("Accept", "application/json")
            .timeout(SEND_TIMEOUT)
            .form(&form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(event = "sms_send_failed", to = %to, error = %err);
                return None;
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                warn!(event = "sms_send_failed", to = %to, error = %err);
                return None;
            }
        };
        if !status.is_success() {
            warn!(event = "sms_send_rejected", to = %to, status = status.as_u16(), body = %body);
            return None;
        }

        info!(event = "sms_sent", to = %to, chars = text.len());
        Some(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

/// Used when no SMS credentials are configured: replies are only logged.
#[derive(Debug, Default)]
pub struct LogOnlyGateway;

#[async_trait]
impl SmsGateway for LogOnlyGateway {
    fn name(&self) -> &str {
        "log-only"
    }

    async fn send(&self, recipients: &[String], text: &str) -> Option<Value> {
        info!(event = "sms_logged", to = %recipients.join(","), text = %text);
        Some(json!({ "status": "logged", "recipients": recipients }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::HeaderMap, routing::post, Form, Json, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(Option<String>, HashMap<String, String>)>>>;

    async fn messaging(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Form(form): Form<HashMap<String, String>>,
    ) -> Json<Value> {
        let key = headers
            .get("apiKey")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        seen.lock().expect("seen").push((key, form));
        Json(json!({"SMSMessageData": {"Message": "Sent to 1/1 Total Cost: KES 0.8000"}}))
    }

    async fn mock_endpoint() -> (String, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/version1/messaging", post(messaging))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}/version1/messaging"), seen)
    }

    #[tokio::test]
    async fn posts_vendor_form_with_api_key_header() {
        let (endpoint, seen) = mock_endpoint().await;
        let gateway = AfricasTalkingGateway::new(AfricasTalkingConfig {
            username: "sandbox".to_string(),
            api_key: "at-key".to_string(),
            sender: Some("1403".to_string()),
            endpoint: Some(endpoint),
        });

        let result = gateway
            .send(
                &["+254712345678".to_string(), "+254700000001".to_string()],
                "Cows are eating.",
            )
            .await
            .expect("send result");
        assert!(result["SMSMessageData"]["Message"]
            .as_str()
            .expect("message")
            .starts_with("Sent"));

        let seen = seen.lock().expect("seen");
        let (key, form) = &seen[0];
        assert_eq!(key.as_deref(), Some("at-key"));
        assert_eq!(form["username"], "sandbox");
        assert_eq!(form["to"], "+254712345678,+254700000001");
        assert_eq!(form["message"], "Cows are eating.");
        assert_eq!(form["from"], "1403");
    }

    #[tokio::test]
    async fn unreachable_gateway_yields_none() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let gateway = AfricasTalkingGateway::new(AfricasTalkingConfig {
            username: "sandbox".to_string(),
            api_key: "k".to_string(),
            sender: None,
            endpoint: Some(format!("http://{addr}/version1/messaging")),
        });
        assert!(gateway
            .send(&["+254712345678".to_string()], "hi")
            .await
            .is_none());
    }

    #[test]
    fn endpoint_follows_username() {
        let mut config = AfricasTalkingConfig {
            username: "sandbox".to_string(),
            api_key: "k".to_string(),
            sender: None,
            endpoint: None,
        };
        assert_eq!(
            AfricasTalkingGateway::new(config.clone()).endpoint(),
            AT_SANDBOX_ENDPOINT
        );
        config.username = "herdwatch".to_string();
        assert_eq!(AfricasTalkingGateway::new(config).endpoint(), AT_LIVE_ENDPOINT);
    }
}
