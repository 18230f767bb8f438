use endpoint_agent::config::{ConfigData, ConfigStore};
use endpoint_agent::crypto::KeyPair;
use endpoint_agent::docs::{Doc, LoadDoc};
use endpoint_agent::stream::{ActiveConf, Stream};
use endpoint_devkit::test_utils::{init_logging, parse_record, wait_for};
use endpoint_devkit::MockCollector;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "0123456789abcdef0123456789abcdef";
const WAIT: Duration = Duration::from_secs(10);

fn agent_store(collector: &MockCollector, secret: &str) -> Arc<ConfigStore> {
    let keys = KeyPair::generate().unwrap();
    collector.trust_agent(&keys.public_key).unwrap();

    let mut data = ConfigData {
        id: "65f0a1b2c3d4e5f601234567".to_string(),
        remote_hosts: vec![collector.host()],
        secret: secret.to_string(),
        public_key: keys.public_key,
        private_key: keys.private_key,
        server_public_key: collector.public_key().to_string(),
        ..Default::default()
    };
    data.transport.plaintext = true;
    data.transport.reconnect_delay_ms = 50;
    data.transport.handshake_timeout_secs = 5;

    Arc::new(ConfigStore::new("unused.toml", data))
}

/// One second ping interval, two second read deadline
fn fast_liveness(store: &ConfigStore) {
    store.set(|c| {
        c.transport.ping_interval_secs = 1;
        c.transport.ping_wait_secs = 2;
    });
}

async fn wait_connected(collector: &MockCollector, count: usize) {
    wait_for(WAIT, || async { (collector.connections() >= count).then_some(()) })
        .await
        .unwrap();
}

fn load(n: usize) -> Doc {
    Doc::Load(LoadDoc {
        load1: n as f64,
        ..Default::default()
    })
}

fn load_values(records: &[String]) -> Vec<u64> {
    records
        .iter()
        .filter_map(|r| parse_record(r))
        .filter(|(tag, _)| tag == "load")
        .filter_map(|(_, body)| body["lx"].as_f64())
        .map(|v| v as u64)
        .collect()
}

#[tokio::test]
async fn test_records_arrive_in_order() {
    init_logging();
    let collector = MockCollector::start(SECRET).await.unwrap();
    let stream = Stream::new(agent_store(&collector, SECRET), ActiveConf::new());

    for n in 0..20 {
        stream.append(load(n));
    }
    let handle = tokio::spawn(stream.clone().run());

    let records = collector.wait_for_records(20, WAIT).await.unwrap();
    assert_eq!(load_values(&records), (0..20).collect::<Vec<_>>());
    assert!(records.iter().all(|r| r.ends_with('\n')));
    assert_eq!(stream.primary_len(), 0);

    let nonces = collector.comm_nonces();
    assert_eq!(nonces.len(), 1);
    assert_eq!(nonces[0].len(), 64);

    handle.abort();
}

#[tokio::test]
async fn test_pushed_conf_replaces_active_conf() {
    init_logging();
    let collector = MockCollector::start(SECRET).await.unwrap();
    let stream = Stream::new(agent_store(&collector, SECRET), ActiveConf::new());
    let handle = tokio::spawn(stream.clone().run());

    wait_connected(&collector, 1).await;

    let conf = json!({
        "checks": [{
            "id": "5f3c1a2b9d8e7f60",
            "name": "web",
            "type": "http",
            "method": "GET",
            "frequency": 30,
            "targets": ["https://zero.example.com/health"],
        }]
    });
    assert_eq!(collector.push_conf(&conf).unwrap(), 1);

    let checks = wait_for(WAIT, || async {
        let active = stream.conf().load();
        (!active.checks().is_empty()).then(|| active.checks().to_vec())
    })
    .await
    .unwrap();
    assert_eq!(checks[0].id, "5f3c1a2b9d8e7f60");
    assert_eq!(checks[0].frequency, 30);

    // Data still flows after a conf push
    stream.append(load(7));
    let records = collector.wait_for_records(1, WAIT).await.unwrap();
    assert_eq!(load_values(&records), vec![7]);

    handle.abort();
}

#[tokio::test]
async fn test_unconfirmed_records_resent_after_reconnect() {
    init_logging();
    let collector = MockCollector::start(SECRET).await.unwrap();
    let stream = Stream::new(agent_store(&collector, SECRET), ActiveConf::new());
    collector.close_after(5);

    for n in 0..10 {
        stream.append(load(n));
    }
    let handle = tokio::spawn(stream.clone().run());

    let seen = wait_for(WAIT, || async {
        let values: BTreeSet<u64> = load_values(&collector.records()).into_iter().collect();
        (values.len() == 10 && collector.connections() >= 2).then_some(values)
    })
    .await
    .unwrap();
    assert_eq!(seen, (0..10).collect::<BTreeSet<_>>());

    // The first five were delivered before the drop and are resent with the rest
    collector.wait_for_records(15, WAIT).await.unwrap();
    assert_eq!(stream.dropped(), 0);

    handle.abort();
}

#[tokio::test]
async fn test_bad_secret_rejected_and_retried() {
    init_logging();
    let collector = MockCollector::start(SECRET).await.unwrap();
    let stream = Stream::new(agent_store(&collector, "wrong-secret"), ActiveConf::new());
    stream.append(load(1));
    let handle = tokio::spawn(stream.clone().run());

    wait_for(WAIT, || async { (collector.rejected_connections() >= 2).then_some(()) })
        .await
        .unwrap();
    assert_eq!(collector.connections(), 0);
    assert!(collector.records().is_empty());
    assert_eq!(stream.primary_len(), 1);

    handle.abort();
}

#[tokio::test]
async fn test_missing_key_material_never_connects() {
    init_logging();
    let collector = MockCollector::start(SECRET).await.unwrap();
    let store = agent_store(&collector, SECRET);
    store.set(|c| c.server_public_key.clear());
    let stream = Stream::new(store, ActiveConf::new());
    let handle = tokio::spawn(stream.clone().run());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(collector.connections(), 0);
    assert_eq!(collector.rejected_connections(), 0);

    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_not_starved_by_backlog() {
    init_logging();
    let collector = MockCollector::start(SECRET).await.unwrap();
    let store = agent_store(&collector, SECRET);
    fast_liveness(&store);
    store.set(|c| c.transport.ping_wait_secs = 3);
    let stream = Stream::new(store, ActiveConf::new());
    let handle = tokio::spawn(stream.clone().run());
    wait_connected(&collector, 1).await;

    // Keep the primary tier non-empty for two read deadlines
    let until = tokio::time::Instant::now() + Duration::from_secs(6);
    let mut n = 0;
    while tokio::time::Instant::now() < until {
        if stream.primary_len() < 500 {
            for _ in 0..100 {
                stream.append(load(n));
                n += 1;
            }
        }
        tokio::task::yield_now().await;
    }

    assert_eq!(collector.connections(), 1);
    assert!(collector.records().len() > 1000);

    handle.abort();
}

#[tokio::test]
async fn test_idle_connection_kept_alive_by_pongs() {
    init_logging();
    let collector = MockCollector::start(SECRET).await.unwrap();
    let store = agent_store(&collector, SECRET);
    fast_liveness(&store);
    let stream = Stream::new(store, ActiveConf::new());
    let handle = tokio::spawn(stream.clone().run());
    wait_connected(&collector, 1).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(collector.connections(), 1);

    handle.abort();
}

#[tokio::test]
async fn test_unanswered_pings_expire_read_deadline() {
    init_logging();
    let collector = MockCollector::start(SECRET).await.unwrap();
    collector.stall_next(Duration::from_secs(30));
    let store = agent_store(&collector, SECRET);
    fast_liveness(&store);
    let stream = Stream::new(store, ActiveConf::new());
    let handle = tokio::spawn(stream.clone().run());

    wait_connected(&collector, 2).await;

    stream.append(load(3));
    let records = collector.wait_for_records(1, WAIT).await.unwrap();
    assert_eq!(load_values(&records), vec![3]);

    handle.abort();
}

#[tokio::test]
async fn test_undecryptable_frames_keep_connection() {
    init_logging();
    let collector = MockCollector::start(SECRET).await.unwrap();
    let stream = Stream::new(agent_store(&collector, SECRET), ActiveConf::new());
    let handle = tokio::spawn(stream.clone().run());
    wait_connected(&collector, 1).await;

    collector.push_raw(&[7u8; 64]).unwrap();
    collector.push_raw(&[1u8; 10]).unwrap();
    collector
        .push_conf(&json!({ "checks": [{ "id": "after-garbage", "type": "ping" }] }))
        .unwrap();

    let id = wait_for(WAIT, || async {
        let active = stream.conf().load();
        active.checks().first().map(|c| c.id.clone())
    })
    .await
    .unwrap();
    assert_eq!(id, "after-garbage");
    assert_eq!(collector.connections(), 1);

    stream.append(load(5));
    let records = collector.wait_for_records(1, WAIT).await.unwrap();
    assert_eq!(load_values(&records), vec![5]);

    handle.abort();
}
