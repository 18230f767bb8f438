/*!
HTTP probe target

Answers every request, whatever the method or path, with one fixed status
code and counts the hits. Used to drive the agent's HTTP checks.
*/

use anyhow::Result;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

struct TargetState {
    status: StatusCode,
    hits: AtomicUsize,
    last_headers: Mutex<Option<HeaderMap>>,
}

async fn respond(State(state): State<Arc<TargetState>>, headers: HeaderMap) -> StatusCode {
    state.hits.fetch_add(1, Ordering::SeqCst);
    *state.last_headers.lock().unwrap() = Some(headers);
    state.status
}

pub struct StatusServer {
    addr: SocketAddr,
    state: Arc<TargetState>,
    handle: JoinHandle<()>,
}

impl StatusServer {
    pub async fn start(status: u16) -> Result<Self> {
        let state = Arc::new(TargetState {
            status: StatusCode::from_u16(status)?,
            hits: AtomicUsize::new(0),
            last_headers: Mutex::new(None),
        });

        let app = Router::new().fallback(respond).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("status server stopped: {}", e);
            }
        });

        Ok(Self {
            addr,
            state,
            handle,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}/health", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    /// Value of `name` on the most recent request
    pub fn last_header(&self, name: &str) -> Option<String> {
        self.state
            .last_headers
            .lock()
            .unwrap()
            .as_ref()?
            .get(name)?
            .to_str()
            .ok()
            .map(str::to_string)
    }
}

impl Drop for StatusServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
