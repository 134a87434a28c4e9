//! Loopback HTTP stub used by unit tests.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri, Version};
use axum::Router;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
pub struct StubResponse {
    pub status: u16,
    pub body: String,
}

impl StubResponse {
    pub fn ok(body: &str) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub request_line: String,
    pub body: Vec<u8>,
}

struct Script {
    responses: Vec<StubResponse>,
    next: AtomicUsize,
    seen: Mutex<Vec<SeenRequest>>,
}

/// Serves the queued responses in order; the last one repeats once the queue is exhausted.
pub struct StubServer {
    port: u16,
    script: Arc<Script>,
    handle: tokio::task::JoinHandle<()>,
}

impl StubServer {
    pub async fn start(responses: Vec<StubResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener, responses)
    }

    /// Serve on an already-bound listener (used to impersonate a launched backend).
    pub fn serve(listener: TcpListener, responses: Vec<StubResponse>) -> Self {
        let port = listener.local_addr().unwrap().port();
        let script = Arc::new(Script {
            responses,
            next: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .fallback(reply)
            .with_state(script.clone());
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            port,
            script,
            handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.script.seen.lock().unwrap().clone()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn reply(
    State(script): State<Arc<Script>>,
    method: Method,
    uri: Uri,
    version: Version,
    body: Bytes,
) -> (StatusCode, String) {
    script.seen.lock().unwrap().push(SeenRequest {
        request_line: format!("{method} {uri} {version:?}"),
        body: body.to_vec(),
    });
    let idx = script.next.fetch_add(1, Ordering::SeqCst);
    let resp = script
        .responses
        .get(idx)
        .or_else(|| script.responses.last())
        .cloned()
        .unwrap_or_else(|| StubResponse::status(404, "no stub"));
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, resp.body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_queue_then_repeats_last() {
        let server = StubServer::start(vec![
            StubResponse::status(503, "starting"),
            StubResponse::ok("ready"),
        ])
        .await;
        let http = reqwest::Client::new();
        let mut statuses = Vec::new();
        for _ in 0..3 {
            let resp = http
                .get(format!("{}/getModels", server.base_url()))
                .send()
                .await
                .unwrap();
            statuses.push(resp.status().as_u16());
        }
        assert_eq!(statuses, [503, 200, 200]);

        let resp = http
            .post(format!("{}/segment?diameter=30", server.base_url()))
            .body("payload")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.text().await.unwrap(), "ready");

        let seen = server.requests();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].request_line, "GET /getModels HTTP/1.1");
        assert_eq!(seen[3].request_line, "POST /segment?diameter=30 HTTP/1.1");
        assert_eq!(seen[3].body, b"payload");
    }
}
