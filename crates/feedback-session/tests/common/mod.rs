//! Minimal HTTP/1.1 responder for exercising the client against canned
//! server behaviour.

#![allow(dead_code)]

use feedback_session::token::{encode_unsigned, now_secs};
use feedback_session::transport::TransportGuard;
use feedback_session::{ApiClient, Credential, EventBus, StorageAdapter};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// A request as seen by the mock server.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub body: String,
}

pub struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            body: body.to_string(),
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }
}

type Route = dyn Fn(&Recorded) -> Reply + Send + Sync;

pub struct MockServer {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Recorded>>>,
    task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn start<F>(route: F) -> Self
    where
        F: Fn(&Recorded) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let route: Arc<Route> = Arc::new(route);

        let log = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let log = Arc::clone(&log);
                let route = Arc::clone(&route);
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut reader = BufReader::new(read);
                    let Some(req) = read_request(&mut reader).await else {
                        return;
                    };
                    log.lock().unwrap().push(req.clone());
                    let reply = route(&req);
                    let response = format!(
                        "HTTP/1.1 {} Mock\r\n\
                         content-type: application/json\r\n\
                         content-length: {}\r\n\
                         connection: close\r\n\r\n{}",
                        reply.status,
                        reply.body.len(),
                        reply.body
                    );
                    let _ = write.write_all(response.as_bytes()).await;
                    let _ = write.shutdown().await;
                });
            }
        });

        Self {
            addr,
            requests,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_request<R>(reader: &mut BufReader<R>) -> Option<Recorded>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    reader.read_line(&mut line).await.ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut authorization = None;
    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).await.ok()?;
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "authorization" => authorization = Some(value.to_string()),
                "content-length" => content_length = value.parse().unwrap_or(0),
                _ => {}
            }
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await.ok()?;
    Some(Recorded {
        method,
        path,
        authorization,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

/// Client parts wired against `server`, sharing one storage and bus.
pub struct Client {
    pub storage: Arc<StorageAdapter>,
    pub bus: Arc<EventBus>,
    pub api: Arc<ApiClient>,
}

pub fn client_for(server: &MockServer) -> Client {
    let storage = Arc::new(StorageAdapter::in_memory());
    let bus = Arc::new(EventBus::new());
    let guard = TransportGuard::with_client(
        reqwest::Client::new(),
        server.url(),
        Arc::clone(&storage),
        Arc::clone(&bus),
    );
    Client {
        storage,
        bus,
        api: Arc::new(ApiClient::new(guard)),
    }
}

/// A credential for `email` expiring `secs` seconds from now.
pub fn credential_for(email: &str, secs: i64) -> Credential {
    let now = now_secs();
    encode_unsigned(&json!({"sub": email, "iat": now, "exp": now + secs}))
}

pub fn user_json(id: i64, email: &str) -> serde_json::Value {
    json!({
        "id": id,
        "email": email,
        "is_active": true,
        "created_at": "2026-10-01T12:00:00"
    })
}

pub fn feedback_json(id: i64, upvotes: i64, has_upvoted: bool) -> serde_json::Value {
    json!({
        "id": id,
        "text": format!("item {id}"),
        "upvotes": upvotes,
        "user_id": 1,
        "user_email": "author@example.com",
        "has_upvoted": has_upvoted,
        "created_at": "2026-10-01T12:00:00"
    })
}

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("feedback_session=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}
