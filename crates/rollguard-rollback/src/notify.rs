//! NotificationSink: where finished rollbacks are reported.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Uri;
use http_body_util::Full;
use rollguard_core::{NotifyConfig, RollbackConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::NotifyError;
use crate::request::{RollbackRequest, RollbackResult};

pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>>;

/// A finished rollback plus the context it ran in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub app_id: String,
    pub reason: String,
    pub initiated_by: String,
    pub result: RollbackResult,
}

impl Notification {
    pub fn new(request: &RollbackRequest, result: &RollbackResult) -> Self {
        Self {
            app_id: request.app_id.clone(),
            reason: request.reason.clone(),
            initiated_by: request.initiated_by.clone(),
            result: result.clone(),
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn emit<'a>(&'a self, notification: &'a Notification) -> NotifyFuture<'a>;
}

/// Hand `notification` to `sink` without waiting. Failures are logged.
pub fn spawn_emit(sink: Arc<dyn NotificationSink>, notification: Notification) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = sink.emit(&notification).await {
            warn!(app_id = %notification.app_id, error = %e, "rollback notification failed");
        }
    })
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn emit<'a>(&'a self, notification: &'a Notification) -> NotifyFuture<'a> {
        Box::pin(async move {
            let result = &notification.result;
            if result.success {
                info!(
                    app_id = %notification.app_id,
                    release = result.release_used.as_deref().unwrap_or("-"),
                    initiated_by = %notification.initiated_by,
                    "rollback succeeded"
                );
            } else {
                warn!(
                    app_id = %notification.app_id,
                    failed_step = ?result.failed_step,
                    initiated_by = %notification.initiated_by,
                    message = %result.message,
                    "rollback failed"
                );
            }
            Ok(())
        })
    }
}

/// POSTs the notification as JSON to a plain `http://` webhook.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    url: String,
    timeout: Duration,
}

impl WebhookSink {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            timeout,
        }
    }

    async fn post(&self, body: Vec<u8>) -> Result<(), NotifyError> {
        let invalid = |detail: String| NotifyError::InvalidUrl {
            url: self.url.clone(),
            detail,
        };
        let uri: Uri = self.url.parse().map_err(|e| invalid(format!("{e}")))?;
        let host = uri.host().ok_or_else(|| invalid("missing host".to_string()))?;
        let authority = format!("{host}:{}", uri.port_u16().unwrap_or(80));
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

        let stream = tokio::net::TcpStream::connect(authority.as_str())
            .await
            .map_err(|e| NotifyError::Delivery(format!("connect {authority}: {e}")))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| NotifyError::Delivery(format!("handshake: {e}")))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("POST")
            .uri(path)
            .header("host", authority.as_str())
            .header("content-type", "application/json")
            .header("user-agent", concat!("rollguard/", env!("CARGO_PKG_VERSION")))
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| NotifyError::Delivery(format!("request: {e}")))?;
        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| NotifyError::Delivery(format!("send: {e}")))?;
        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

impl NotificationSink for WebhookSink {
    fn emit<'a>(&'a self, notification: &'a Notification) -> NotifyFuture<'a> {
        Box::pin(async move {
            let body = serde_json::to_vec(notification)?;
            tokio::time::timeout(self.timeout, self.post(body))
                .await
                .map_err(|_| NotifyError::Timeout(self.timeout))??;
            debug!(app_id = %notification.app_id, url = %self.url, "webhook delivered");
            Ok(())
        })
    }
}

/// Webhook when `[notify] webhook_url` is set, log otherwise.
pub fn sink_from_config(
    notify: Option<&NotifyConfig>,
    rollback: &RollbackConfig,
) -> Arc<dyn NotificationSink> {
    match notify.and_then(|n| n.webhook_url.as_deref()) {
        Some(url) => Arc::new(WebhookSink::new(url, rollback.notify_timeout())),
        None => Arc::new(LogSink),
    }
}

/// Forwards every notification to a channel.
#[derive(Debug, Clone)]
pub struct RecordingSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl RecordingSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for RecordingSink {
    fn emit<'a>(&'a self, notification: &'a Notification) -> NotifyFuture<'a> {
        Box::pin(async move {
            self.tx
                .send(notification.clone())
                .map_err(|_| NotifyError::Delivery("receiver dropped".to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::error::RollbackError;

    fn notification() -> Notification {
        let request = RollbackRequest::manual("shop", "alice");
        let error = RollbackError::NoPreviousRelease {
            app_id: "shop".to_string(),
            detail: "found 1 release(s)".to_string(),
        };
        Notification::new(&request, &RollbackResult::failed(&request, &error))
    }

    /// Accepts one request, returns the raw bytes read.
    async fn webhook_server(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hooks/rollback", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received);
                if text.contains("\r\n\r\n") && text.trim_end().ends_with('}') {
                    break;
                }
            }
            let response = format!("HTTP/1.1 {status_line}\r\ncontent-length: 0\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&received).into_owned()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn webhook_posts_json() {
        let (url, server) = webhook_server("200 OK").await;
        let sink = WebhookSink::new(&url, Duration::from_secs(5));
        sink.emit(&notification()).await.unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hooks/rollback HTTP/1.1"));
        assert!(request.contains("content-type: application/json"));
        assert!(request.contains("\"app_id\":\"shop\""));
    }

    #[tokio::test]
    async fn webhook_non_2xx_is_an_error() {
        let (url, _server) = webhook_server("500 Internal Server Error").await;
        let sink = WebhookSink::new(&url, Duration::from_secs(5));
        let err = sink.emit(&notification()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Status(500)));
    }

    #[tokio::test]
    async fn webhook_rejects_bad_url() {
        let sink = WebhookSink::new("not a url", Duration::from_secs(1));
        let err = sink.emit(&notification()).await.unwrap_err();
        assert!(matches!(err, NotifyError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn spawned_emit_reaches_sink() {
        let (sink, mut rx) = RecordingSink::channel();
        let handle = spawn_emit(Arc::new(sink), notification());
        handle.await.unwrap();
        let received = rx.try_recv().unwrap();
        assert_eq!(received.app_id, "shop");
        assert!(!received.result.success);
    }

    #[test]
    fn config_without_webhook_logs() {
        // LogSink never fails.
        let sink = sink_from_config(None, &RollbackConfig::default());
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(sink.emit(&notification())).unwrap();
    }
}
