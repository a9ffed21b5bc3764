//! Notification broker: `POST /notify` with `{"title": "...", "message": "..."}`.
//!
//! - `200 OK`: notification dispatched
//! - `400 Bad Request`: body is not JSON, or `title`/`message` is empty
//! - `500 Internal Server Error`: the local notifier failed
//!
//! Other methods on `/notify` get axum's `405`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::post,
    Router,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{bind_local, remote_socket_path, serve_http, BrokerHandle, NOTIFICATION_SOCKET_PREFIX};

/// Body of `POST /notify`. Missing fields decode as empty and are rejected.
#[derive(Debug, Default, Deserialize)]
pub struct NotificationRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
}

/// Local OS notification trigger.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, title: &str, message: &str) -> Result<(), String>;
}

/// Desktop notifications via the platform notification service.
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopNotifier;

impl Notifier for DesktopNotifier {
    fn notify(&self, title: &str, message: &str) -> Result<(), String> {
        #[cfg(feature = "desktop-notifications")]
        {
            notify_rust::Notification::new()
                .summary(title)
                .body(message)
                .appname("gh-ado-codespaces")
                .show()
                .map(|_| ())
                .map_err(|e| e.to_string())
        }

        #[cfg(not(feature = "desktop-notifications"))]
        {
            debug!("Desktop notifications disabled, dropping '{title}': {message}");
            Err("desktop notifications are not compiled in".to_string())
        }
    }
}

/// Router serving `/notify`.
pub fn router(notifier: Arc<dyn Notifier>) -> Router {
    Router::new()
        .route("/notify", post(handle_notify))
        .with_state(notifier)
}

/// Start the notification broker on an ephemeral local port.
pub async fn start(
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
) -> std::io::Result<BrokerHandle> {
    let (listener, port) = bind_local().await?;
    let socket_path = remote_socket_path(NOTIFICATION_SOCKET_PREFIX);
    debug!("Local notification HTTP service created on port: {port}, socket path: {socket_path}");

    let task = serve_http("notification", listener, router(notifier), cancel.clone());
    Ok(BrokerHandle::new("notification", port, socket_path, cancel, task))
}

async fn handle_notify(
    State(notifier): State<Arc<dyn Notifier>>,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let Ok(req) = serde_json::from_slice::<NotificationRequest>(&body) else {
        return (StatusCode::BAD_REQUEST, "Invalid JSON");
    };
    if req.title.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing title");
    }
    if req.message.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing message");
    }

    debug!("Sending notification: title={}, message={}", req.title, req.message);

    // notify-rust talks to D-Bus synchronously.
    let result = tokio::task::spawn_blocking(move || notifier.notify(&req.title, &req.message))
        .await
        .unwrap_or_else(|e| Err(e.to_string()));

    match result {
        Ok(()) => {
            info!("Notification delivered");
            (StatusCode::OK, "OK")
        }
        Err(e) => {
            warn!("Error sending notification: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to send notification")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingNotifier {
        fail: bool,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, title: &str, message: &str) -> Result<(), String> {
            if self.fail {
                return Err("no notification daemon".into());
            }
            self.sent
                .lock()
                .unwrap()
                .push((title.to_string(), message.to_string()));
            Ok(())
        }
    }

    async fn send(app: Router, method: Method, body: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri("/notify")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn delivers_valid_notification() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (status, body) = send(
            router(notifier.clone()),
            Method::POST,
            r#"{"title":"Build","message":"done"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
        assert_eq!(
            *notifier.sent.lock().unwrap(),
            vec![("Build".to_string(), "done".to_string())]
        );
    }

    #[tokio::test]
    async fn empty_title_is_rejected() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (status, _) = send(
            router(notifier.clone()),
            Method::POST,
            r#"{"title":"","message":"x"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_message_and_bad_json_are_rejected() {
        let notifier: Arc<dyn Notifier> = Arc::new(RecordingNotifier::default());
        let (status, body) = send(router(notifier.clone()), Method::POST, r#"{"title":"t"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Missing message");

        let (status, body) = send(router(notifier), Method::POST, "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Invalid JSON");
    }

    #[tokio::test]
    async fn notifier_failure_is_500() {
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let (status, _) = send(router(notifier), Method::POST, r#"{"title":"a","message":"b"}"#).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn get_is_not_allowed() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (status, _) = send(router(notifier), Method::GET, "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn serves_over_tcp_until_stopped() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let notifier = Arc::new(RecordingNotifier::default());
        let handle = start(notifier.clone(), CancellationToken::new()).await.unwrap();
        assert!(handle.socket_path().starts_with("/tmp/gh-ado-notification-"));

        let body = r#"{"title":"hi","message":"there"}"#;
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", handle.port()))
            .await
            .unwrap();
        let request = format!(
            "POST /notify HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);

        handle.stop(std::time::Duration::from_secs(2)).await;
    }
}
