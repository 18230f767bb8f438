//! Check runner for collector-configured probes
//!
//! Every second the active configuration is normalized and each check whose
//! own frequency elapsed is marked as run and spawned on its own task. A
//! semaphore bounds how many execute at once.

use crate::docs::{CheckDoc, Doc};
use crate::errors::AgentError;
use crate::input::{Input, StartupFuture};
use crate::stream::{Check, HttpMethod, ProbeKind, Stream};
use parking_lot::Mutex;
use reqwest::Method;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

const EVALUATE_INTERVAL: Duration = Duration::from_secs(1);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone)]
pub struct CheckRunner {
    stream: Stream,
    last_run: Arc<Mutex<HashMap<String, Instant>>>,
    limit: Arc<Semaphore>,
}

impl CheckRunner {
    pub fn new(stream: Stream, max_concurrent: usize) -> Self {
        Self {
            stream,
            last_run: Arc::new(Mutex::new(HashMap::new())),
            limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Normalize the active checks and claim the ones that are due
    ///
    /// A claimed check has its last run set to `now` before it executes.
    /// Last-run times are keyed by check id and survive configuration pushes.
    pub fn claim_due(&self, now: Instant) -> Vec<Check> {
        let conf = self.stream.conf().load();
        let mut last_run = self.last_run.lock();
        let mut due = Vec::new();
        let mut active = HashSet::new();

        for definition in conf.checks() {
            let check = match definition.normalize() {
                Ok(check) => check,
                Err(e) => {
                    warn!(
                        check_id = %definition.id,
                        error = %e,
                        kind = e.kind(),
                        "check: Check validate failed"
                    );
                    continue;
                }
            };
            active.insert(check.id.clone());

            let ready = last_run
                .get(&check.id)
                .map_or(true, |last| now.saturating_duration_since(*last) > check.frequency);
            if ready {
                last_run.insert(check.id.clone(), now);
                due.push(check);
            }
        }

        last_run.retain(|id, _| active.contains(id));
        due
    }

    /// Spawn one task per due check
    pub fn dispatch(&self, now: Instant) -> usize {
        let due = self.claim_due(now);
        let count = due.len();

        for check in due {
            let runner = self.clone();
            tokio::spawn(async move {
                let Ok(_permit) = runner.limit.clone().acquire_owned().await else {
                    return;
                };
                runner.execute(&check).await;
            });
        }

        count
    }

    /// Run one check and ingest its result record
    pub async fn execute(&self, check: &Check) -> Option<CheckDoc> {
        match check.kind {
            ProbeKind::Ping => None,
            ProbeKind::Http => {
                let doc = self.run_http(check).await;
                self.stream.append(Doc::Check(doc.clone()));
                Some(doc)
            }
        }
    }

    async fn run_http(&self, check: &Check) -> CheckDoc {
        let mut doc = CheckDoc {
            check_id: check.id.clone(),
            ..Default::default()
        };

        let client = match http_client(check.timeout) {
            Ok(client) => Some(client),
            Err(e) => {
                error!(check_id = %check.id, error = %e, "check: Check run failed");
                None
            }
        };

        for target in &check.targets {
            let (latency, err) = match &client {
                Some(client) => probe_http(client, check, target).await,
                None => (0, "check: Client unavailable".to_string()),
            };
            doc.targets.push(target.clone());
            doc.latency.push(latency);
            doc.errors.push(err);
        }

        doc
    }

    /// Evaluate forever on a one second interval
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(EVALUATE_INTERVAL);
        loop {
            ticker.tick().await;
            let spawned = self.dispatch(Instant::now());
            if spawned > 0 {
                debug!(checks = spawned, "check: Dispatched checks");
            }
        }
    }
}

impl Input for CheckRunner {
    fn name(&self) -> &'static str {
        "check"
    }

    fn startup(&mut self, _stream: Stream) -> Option<StartupFuture> {
        let runner = self.clone();
        Some(Box::pin(async move {
            runner.run().await;
            Ok(())
        }))
    }
}

/// Client honouring proxy variables, with keep-alive and HTTP/2 negotiation
fn http_client(timeout: Duration) -> Result<reqwest::Client, AgentError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .tcp_keepalive(TCP_KEEPALIVE)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build()
        .map_err(|e| AgentError::request_with("check: Failed to build client", e))
}

fn method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Head => Method::HEAD,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
    }
}

/// Latency in ms rounded up, and an error string that is empty on success
async fn probe_http(client: &reqwest::Client, check: &Check, target: &str) -> (u64, String) {
    let mut req = client.request(method(check.method), target);
    for header in &check.headers {
        req = req.header(header.key.as_str(), header.value.as_str());
    }

    let start = Instant::now();
    let resp = match req.send().await {
        Ok(resp) => resp,
        Err(e) => {
            error!(
                check_id = %check.id,
                target = %target,
                error = %e,
                "check: Request run error"
            );
            return (0, e.to_string());
        }
    };
    let latency = ((start.elapsed().as_micros() + 999) / 1000).max(1) as u64;

    let status = resp.status().as_u16();
    if status != check.status_code {
        return (latency, format!("check: Request status error {}", status));
    }

    (latency, String::new())
}
