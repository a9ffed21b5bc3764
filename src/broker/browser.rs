//! URL-open broker: `POST /open?url=<percent-encoded URL>`.
//!
//! Lets tools inside the codespace (`$BROWSER`, OAuth device flows) open a
//! page in the workstation's default browser.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::post,
    Router,
};
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{bind_local, remote_socket_path, serve_http, BrokerHandle, BROWSER_SOCKET_PREFIX};
use crate::transport::exec_program;

#[derive(Debug, Deserialize)]
pub struct OpenParams {
    pub url: Option<String>,
}

/// Local default-browser opener.
pub trait UrlOpener: Send + Sync + 'static {
    fn open(&self, url: String) -> BoxFuture<'_, Result<(), String>>;
}

/// Opens URLs with the platform launcher (`xdg-open`, `open`, `rundll32`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOpener;

impl SystemOpener {
    fn command(url: &str) -> (&'static str, Vec<String>) {
        if cfg!(target_os = "macos") {
            ("open", vec![url.to_string()])
        } else if cfg!(windows) {
            (
                "rundll32",
                vec!["url.dll,FileProtocolHandler".to_string(), url.to_string()],
            )
        } else {
            ("xdg-open", vec![url.to_string()])
        }
    }
}

impl UrlOpener for SystemOpener {
    fn open(&self, url: String) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            let (program, args) = Self::command(&url);
            exec_program(program, &args, Duration::from_secs(15))
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
    }
}

/// Router serving `/open`.
pub fn router(opener: Arc<dyn UrlOpener>) -> Router {
    Router::new()
        .route("/open", post(handle_open))
        .with_state(opener)
}

/// Start the URL-open broker on an ephemeral local port.
pub async fn start(
    opener: Arc<dyn UrlOpener>,
    cancel: CancellationToken,
) -> std::io::Result<BrokerHandle> {
    let (listener, port) = bind_local().await?;
    let socket_path = remote_socket_path(BROWSER_SOCKET_PREFIX);
    debug!("Local browser service created on port: {port}, socket path: {socket_path}");

    let task = serve_http("browser", listener, router(opener), cancel.clone());
    Ok(BrokerHandle::new("browser", port, socket_path, cancel, task))
}

async fn handle_open(
    State(opener): State<Arc<dyn UrlOpener>>,
    Query(params): Query<OpenParams>,
) -> (StatusCode, &'static str) {
    let Some(url) = params.url.filter(|u| !u.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing url");
    };

    info!("Opening URL in local browser: {url}");
    match opener.open(url.clone()).await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(e) => {
            warn!("Error opening browser for {url}: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to open URL")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingOpener {
        fail: bool,
        opened: Mutex<Vec<String>>,
    }

    impl UrlOpener for RecordingOpener {
        fn open(&self, url: String) -> BoxFuture<'_, Result<(), String>> {
            self.opened.lock().unwrap().push(url);
            let result = if self.fail {
                Err("no browser".to_string())
            } else {
                Ok(())
            };
            Box::pin(async move { result })
        }
    }

    async fn send_post(app: Router, uri: &str) -> StatusCode {
        app.oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
        .status()
    }

    #[tokio::test]
    async fn opens_decoded_url() {
        let opener = Arc::new(RecordingOpener::default());
        let status = send_post(
            router(opener.clone()),
            "/open?url=https%3A%2F%2Fexample.com%2Flogin%3Fcode%3D1",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            *opener.opened.lock().unwrap(),
            vec!["https://example.com/login?code=1".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_or_empty_url_is_400() {
        let opener = Arc::new(RecordingOpener::default());
        assert_eq!(send_post(router(opener.clone()), "/open").await, StatusCode::BAD_REQUEST);
        assert_eq!(send_post(router(opener.clone()), "/open?url=").await, StatusCode::BAD_REQUEST);
        assert!(opener.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn opener_failure_is_500_after_attempt() {
        let opener = Arc::new(RecordingOpener {
            fail: true,
            ..Default::default()
        });
        let status = send_post(router(opener.clone()), "/open?url=https://example.com").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(opener.opened.lock().unwrap().len(), 1);
    }

    #[test]
    fn platform_command_passes_url_last() {
        let (_, args) = SystemOpener::command("https://example.com");
        assert_eq!(args.last().map(String::as_str), Some("https://example.com"));
    }
}
