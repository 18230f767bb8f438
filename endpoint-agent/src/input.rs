//! Input scheduler
//!
//! Owns every producer and the single [`Stream`]. Inputs are either ticked
//! on a fixed rate or run their own loop from a one-time startup task.

use crate::errors::AgentError;
use crate::stream::Stream;
use futures::future::BoxFuture;
use std::time::{Duration, Instant};
use tracing::{error, info};

const TICK: Duration = Duration::from_secs(1);

pub type StartupFuture = BoxFuture<'static, Result<(), AgentError>>;

/// Producer of records
///
/// Polled inputs override [`Input::rate`] and [`Input::poll`]; long running
/// inputs return their loop from [`Input::startup`] instead. `poll` runs on
/// the scheduler loop and must stay cheap.
pub trait Input: Send {
    fn name(&self) -> &'static str;

    fn rate(&self) -> Option<Duration> {
        None
    }

    fn poll(&mut self, _stream: &Stream) -> Result<(), AgentError> {
        Ok(())
    }

    fn startup(&mut self, _stream: Stream) -> Option<StartupFuture> {
        None
    }
}

struct Entry {
    input: Box<dyn Input>,
    last_run: Option<Instant>,
}

pub struct Scheduler {
    stream: Stream,
    entries: Vec<Entry>,
}

impl Scheduler {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            entries: Vec::new(),
        }
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn register<I: Input + 'static>(&mut self, input: I) {
        info!(input = input.name(), "input: Registered input");
        self.entries.push(Entry {
            input: Box::new(input),
            last_run: None,
        });
    }

    /// Spawn every startup action as its own task
    pub fn spawn_startups(&mut self) {
        for entry in &mut self.entries {
            let name = entry.input.name();
            if let Some(task) = entry.input.startup(self.stream.clone()) {
                tokio::spawn(async move {
                    if let Err(e) = task.await {
                        error!(input = name, error = %e, kind = e.kind(), "input: Input startup error");
                    }
                });
            }
        }
    }

    /// Poll every input whose rate has elapsed, returns how many ran
    pub fn tick(&mut self, now: Instant) -> usize {
        let mut polled = 0;

        for entry in &mut self.entries {
            let Some(rate) = entry.input.rate() else {
                continue;
            };
            let due = entry
                .last_run
                .map_or(true, |last| now.saturating_duration_since(last) > rate);
            if !due {
                continue;
            }

            entry.last_run = Some(now);
            polled += 1;
            if let Err(e) = entry.input.poll(&self.stream) {
                error!(
                    input = entry.input.name(),
                    error = %e,
                    kind = e.kind(),
                    "input: Input handler error"
                );
            }
        }

        polled
    }

    /// Start the transport and the startup tasks, then tick forever
    pub async fn run(mut self) {
        tokio::spawn(self.stream.clone().run());
        self.spawn_startups();

        loop {
            self.tick(Instant::now());
            tokio::time::sleep(TICK).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigData, ConfigStore};
    use crate::docs::{Doc, LoadDoc};
    use crate::stream::ActiveConf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn stream() -> Stream {
        let store = Arc::new(ConfigStore::new("unused.toml", ConfigData::default()));
        Stream::new(store, ActiveConf::new())
    }

    struct Counter {
        rate: Duration,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Input for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn rate(&self) -> Option<Duration> {
            Some(self.rate)
        }

        fn poll(&mut self, stream: &Stream) -> Result<(), AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AgentError::exec("counter: Failed"));
            }
            stream.append(Doc::Load(LoadDoc::default()));
            Ok(())
        }
    }

    struct Oneshot {
        tx: Option<tokio::sync::oneshot::Sender<()>>,
    }

    impl Input for Oneshot {
        fn name(&self) -> &'static str {
            "oneshot"
        }

        fn startup(&mut self, _stream: Stream) -> Option<StartupFuture> {
            let tx = self.tx.take()?;
            Some(Box::pin(async move {
                let _ = tx.send(());
                Err(AgentError::exec("oneshot: Done"))
            }))
        }
    }

    #[test]
    fn test_tick_respects_rate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(stream());
        scheduler.register(Counter {
            rate: Duration::from_secs(10),
            calls: calls.clone(),
            fail: false,
        });

        let start = Instant::now();
        assert_eq!(scheduler.tick(start), 1);
        assert_eq!(scheduler.tick(start + Duration::from_secs(5)), 0);
        assert_eq!(scheduler.tick(start + Duration::from_secs(10)), 0);
        assert_eq!(scheduler.tick(start + Duration::from_secs(11)), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.stream().primary_len(), 2);
    }

    #[test]
    fn test_failing_input_does_not_stop_others() {
        let failing = Arc::new(AtomicUsize::new(0));
        let healthy = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(stream());
        scheduler.register(Counter {
            rate: Duration::from_secs(1),
            calls: failing.clone(),
            fail: true,
        });
        scheduler.register(Counter {
            rate: Duration::from_secs(1),
            calls: healthy.clone(),
            fail: false,
        });

        let start = Instant::now();
        scheduler.tick(start);
        scheduler.tick(start + Duration::from_secs(2));
        assert_eq!(failing.load(Ordering::SeqCst), 2);
        assert_eq!(healthy.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_startup_runs_once_and_is_not_ticked() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut scheduler = Scheduler::new(stream());
        scheduler.register(Oneshot { tx: Some(tx) });

        scheduler.spawn_startups();
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(scheduler.tick(Instant::now()), 0);
    }
}
