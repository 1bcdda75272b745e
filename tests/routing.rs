//! Routing across several gateway nodes sharing one table store

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use poolmux::config::ControllerConfig;
use poolmux::controller::{Controller, Destination};
use poolmux::spawner::BackendSpawner;
use poolmux::store::MemoryStore;
use poolmux::tables::{Endpoint, NodeRecord, PoolRecord, ProcessRecord, Tables};

/// Stands in for the manager: records a backend on its own node
struct RecordingSpawner {
    tables: Arc<Tables>,
    node: Endpoint,
    backend_port: u16,
    calls: Arc<AtomicUsize>,
}

impl BackendSpawner for RecordingSpawner {
    async fn start_spawner(&self, _trace_id: Option<&str>, pool_id: &str) -> Option<Endpoint> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // a real manager takes a while to come up
        tokio::time::sleep(Duration::from_millis(50)).await;

        let record = ProcessRecord {
            mux_host: self.node.host.clone(),
            mux_port: self.node.port,
            backend_host: self.node.host.clone(),
            backend_port: self.backend_port,
            manager_pid: 4000,
            backend_pid: Some(4001),
            started_at: chrono::Utc::now().timestamp(),
        };
        self.tables
            .set_process(pool_id, &record, Duration::from_secs(60))
            .ok()?;
        Some(record.backend_endpoint())
    }
}

fn shared_tables() -> Arc<Tables> {
    let tables = Arc::new(Tables::new(Arc::new(MemoryStore::new())));
    tables
        .insert_pool(&PoolRecord {
            pool_id: "P1".to_string(),
            owner: "alice".to_string(),
            buckets_directory: "/srv/pools/P1".to_string(),
            access_keys: vec!["AK1".to_string()],
            direct_hostnames: vec!["p1.example.com".to_string()],
        })
        .unwrap();
    tables
}

fn controller_config() -> ControllerConfig {
    ControllerConfig {
        lock_timeout_secs: 60,
        lock_poll_ms: 10,
        lock_wait_secs: 10,
    }
}

fn controller(
    tables: &Arc<Tables>,
    host: &str,
    calls: &Arc<AtomicUsize>,
) -> Arc<Controller<RecordingSpawner>> {
    let node = Endpoint::new(host, 8008);
    let spawner = RecordingSpawner {
        tables: Arc::clone(tables),
        node: node.clone(),
        backend_port: 9100,
        calls: Arc::clone(calls),
    };
    Arc::new(Controller::new(
        Arc::clone(tables),
        spawner,
        node,
        &controller_config(),
    ))
}

fn register(tables: &Tables, host: &str) {
    tables
        .register_node(
            &NodeRecord {
                host: host.to_string(),
                port: 8008,
                started_at: 0,
                last_heartbeat: 0,
            },
            Duration::from_secs(60),
        )
        .unwrap();
}

#[tokio::test]
async fn test_one_backend_across_nodes() {
    let tables = shared_tables();
    let calls = Arc::new(AtomicUsize::new(0));
    let controllers: Vec<_> = ["10.0.0.1", "10.0.0.2", "10.0.0.3"]
        .iter()
        .map(|host| controller(&tables, host, &calls))
        .collect();

    // no registered nodes: every controller schedules onto itself
    let requests = controllers.iter().flat_map(|c| {
        (0..4).map(move |i| {
            let c = Arc::clone(c);
            async move {
                let host = if i % 2 == 0 { Some("p1.example.com") } else { None };
                let key = if i % 2 == 0 { None } else { Some("AK1") };
                let (destination, pool) = c.route_request(None, host, key).await.unwrap();
                (c.node().clone(), destination, pool)
            }
        })
    });
    let results = futures::future::join_all(requests).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let record = tables.get_process("P1").unwrap().expect("process record written");
    let winner = record.mux_endpoint();
    for (node, destination, pool) in results {
        assert_eq!(pool.as_deref(), Some("P1"));
        if node == winner {
            assert_eq!(destination, Destination::Local(record.backend_endpoint()));
        } else {
            assert_eq!(destination, Destination::Remote(winner.clone()));
        }
    }
}

#[tokio::test]
async fn test_existing_backend_is_used_without_spawning() {
    let tables = shared_tables();
    register(&tables, "10.0.0.1");
    register(&tables, "10.0.0.2");
    tables
        .set_process(
            "P1",
            &ProcessRecord {
                mux_host: "node1".to_string(),
                mux_port: 9000,
                backend_host: "node1".to_string(),
                backend_port: 9301,
                manager_pid: 1,
                backend_pid: None,
                started_at: 0,
            },
            Duration::from_secs(60),
        )
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let gateway = controller(&tables, "10.0.0.2", &calls);

    let (destination, pool) = gateway.route_request(Some("t-1"), None, Some("AK1")).await.unwrap();
    assert_eq!(destination, Destination::Remote(Endpoint::new("node1", 9000)));
    assert_eq!(pool.as_deref(), Some("P1"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_new_backend_goes_to_least_loaded_node() {
    let tables = shared_tables();
    register(&tables, "10.0.0.1");
    register(&tables, "10.0.0.2");
    for (pool, port) in [("P8", 9001), ("P9", 9002)] {
        tables
            .set_process(
                pool,
                &ProcessRecord {
                    mux_host: "10.0.0.1".to_string(),
                    mux_port: 8008,
                    backend_host: "10.0.0.1".to_string(),
                    backend_port: port,
                    manager_pid: 1,
                    backend_pid: None,
                    started_at: 0,
                },
                Duration::from_secs(60),
            )
            .unwrap();
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let busy = controller(&tables, "10.0.0.1", &calls);
    let idle = controller(&tables, "10.0.0.2", &calls);

    let (destination, _) = busy.route_request(None, Some("p1.example.com"), None).await.unwrap();
    assert_eq!(destination, Destination::Remote(Endpoint::new("10.0.0.2", 8008)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // the chosen node starts it when the request arrives there
    let (destination, _) = idle.route_request(None, Some("p1.example.com"), None).await.unwrap();
    assert_eq!(destination, Destination::Local(Endpoint::new("10.0.0.2", 9100)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_pool_is_not_found() {
    let tables = shared_tables();
    let calls = Arc::new(AtomicUsize::new(0));
    let gateway = controller(&tables, "10.0.0.1", &calls);

    let (destination, pool) = gateway
        .route_request(None, Some("nobody.example.com"), Some("AK-UNKNOWN"))
        .await
        .unwrap();
    assert_eq!(destination, Destination::NotFound);
    assert_eq!(pool, None);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(tables.list_processes().unwrap().is_empty());
}
