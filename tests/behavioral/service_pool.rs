// ABOUTME: Behavioral tests for the service pool against a scripted worker farm
// Verifies acquisition timing, bind correlation, growth signals and draining

use super::fixtures::{loopback, BindReply, WorkerFarm};
use busline::bus::InMemoryBus;
use busline::config::PoolConfig;
use busline::pool::{InstanceCountProvisioner, PoolError, ProvisionError, ServicePool, ServiceProvisioner};
use busline::protocol::SHUTDOWN_SERVICE;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Provisioner that only counts growth signals
#[derive(Default)]
struct CountingProvisioner {
    provisioned: AtomicUsize,
    removed: Mutex<Vec<String>>,
    disposed: AtomicUsize,
}

impl ServiceProvisioner for CountingProvisioner {
    fn provision(&self) -> Result<(), ProvisionError> {
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_removed(&self, socket_id: &str) {
        self.removed.lock().unwrap().push(socket_id.to_string());
    }

    fn on_dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

fn has_removed(provisioner: &CountingProvisioner) -> bool {
    !provisioner.removed.lock().unwrap().is_empty()
}

fn pool_config(pool_size: usize) -> PoolConfig {
    PoolConfig {
        drain_window: Duration::from_millis(20),
        ..PoolConfig::for_service("jdt", pool_size)
    }
}

fn started_pool(
    bus: &Arc<InMemoryBus>,
    provisioner: Arc<dyn ServiceProvisioner>,
    config: PoolConfig,
) -> ServicePool {
    let pool = ServicePool::new(bus.clone(), provisioner, config).unwrap();
    assert!(pool.start());
    pool
}

#[tokio::test]
async fn test_bind_confirmation_returns_within_one_poll_step() {
    let (bus, _) = loopback();
    let farm = WorkerFarm::new(&bus, "jdt", BindReply::Echo);
    let pool = started_pool(&bus, Arc::new(CountingProvisioner::default()), pool_config(1));
    farm.announce("s1");

    let started = Instant::now();
    let socket = pool.acquire("alice").await.unwrap();

    assert_eq!(socket, "s1");
    assert!(started.elapsed() < Duration::from_millis(50));
    let binds = farm.bind_requests();
    assert_eq!(binds.len(), 1);
    assert_eq!(binds[0].socket_id, "s1");
    assert_eq!(binds[0].username, "alice");
    assert!(binds[0].callback_id.is_some());
}

#[tokio::test]
async fn test_empty_pool_fails_after_three_rounds() {
    let (bus, _) = loopback();
    let provisioner = Arc::new(CountingProvisioner::default());
    let pool = started_pool(&bus, provisioner.clone(), pool_config(1));
    let initial = provisioner.provisioned.load(Ordering::SeqCst);

    let started = Instant::now();
    let result = pool.acquire("alice").await;

    assert!(matches!(result, Err(PoolError::Provisioning { trials: 3, .. })));
    assert!(started.elapsed() >= Duration::from_millis(1500));
    // one growth signal per round
    assert_eq!(provisioner.provisioned.load(Ordering::SeqCst) - initial, 3);
}

#[tokio::test]
async fn test_silent_worker_is_discarded_and_next_one_used() {
    let (bus, _) = loopback();
    let provisioner = Arc::new(CountingProvisioner::default());
    let pool = started_pool(&bus, provisioner.clone(), pool_config(2));

    // s1 never confirms; s2 confirms through a second farm that only
    // answers once s1 has been discarded
    let silent = WorkerFarm::new(&bus, "jdt", BindReply::Silent);
    silent.announce("s1");

    let announcer = Arc::clone(&bus);
    let discarded = Arc::clone(&provisioner);
    let helper = tokio::spawn(async move {
        while !has_removed(&discarded) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let farm = WorkerFarm::new(&announcer, "jdt", BindReply::Legacy);
        farm.announce("s2");
        farm
    });

    let socket = pool.acquire("alice").await.unwrap();
    let _farm = helper.await.unwrap();

    assert_eq!(socket, "s2");
    assert_eq!(*provisioner.removed.lock().unwrap(), vec!["s1".to_string()]);
    let shutdowns = bus.published_of(SHUTDOWN_SERVICE);
    assert_eq!(shutdowns.len(), 1);
    assert_eq!(shutdowns[0].str_field("socketID"), Some("s1"));
    assert_eq!(pool.stats().metrics.bind_timeouts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquires_get_distinct_workers() {
    let (bus, _) = loopback();
    let farm = WorkerFarm::new(&bus, "jdt", BindReply::Echo);
    let pool = started_pool(&bus, Arc::new(CountingProvisioner::default()), pool_config(4));
    for socket in ["s1", "s2", "s3", "s4"] {
        farm.announce(socket);
    }
    assert!(pool.is_warmed_up());

    let mut handles = Vec::new();
    for user in ["alice", "bob", "carol", "dave"] {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move { pool.acquire(user).await }));
    }

    let mut sockets = Vec::new();
    for handle in handles {
        sockets.push(handle.await.unwrap().unwrap());
    }
    sockets.sort();
    assert_eq!(sockets, vec!["s1", "s2", "s3", "s4"]);
    assert_eq!(pool.stats().bound, 4);
    assert_eq!(pool.ready_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_acquires_for_one_user_never_orphan_a_worker() {
    let (bus, _) = loopback();
    let farm = WorkerFarm::new(&bus, "jdt", BindReply::Echo);
    let pool = started_pool(&bus, Arc::new(CountingProvisioner::default()), pool_config(1));
    farm.announce("s1");
    farm.announce("s2");

    let first = pool.clone();
    let second = pool.clone();
    let a = tokio::spawn(async move { first.acquire("alice").await });
    let b = tokio::spawn(async move { second.acquire("alice").await });
    let handed_out = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];

    assert_eq!(handed_out, ["s1".to_string(), "s1".to_string()]);
    assert_eq!(pool.binding("alice"), Some("s1".to_string()));
    assert_eq!(farm.bind_requests().len(), 1);

    assert!(pool.dispose().await);
    let mut shut: Vec<String> = bus
        .published_of(SHUTDOWN_SERVICE)
        .iter()
        .filter_map(|m| m.str_field("socketID").map(str::to_string))
        .collect();
    shut.sort();
    assert_eq!(shut, vec!["s1".to_string(), "s2".to_string()]);
}

#[tokio::test]
async fn test_instance_count_provisioner_drives_farm() {
    let (bus, _) = loopback();
    let farm = Arc::new(WorkerFarm::new(&bus, "jdt", BindReply::Echo));
    let scaled = Arc::new(Mutex::new(Vec::new()));
    let announced = Arc::new(AtomicUsize::new(0));

    let scale_farm = Arc::clone(&farm);
    let scale_log = Arc::clone(&scaled);
    let provisioner = InstanceCountProvisioner::new(move |count| {
        scale_log.lock().unwrap().push(count);
        let previous = announced.fetch_max(count as usize, Ordering::SeqCst);
        for i in previous..count as usize {
            scale_farm.announce(&format!("worker-{i}"));
        }
        Ok(())
    });

    let pool = started_pool(&bus, Arc::new(provisioner), pool_config(2));
    assert!(pool.is_warmed_up());

    assert_eq!(pool.acquire("alice").await.unwrap(), "worker-0");
    // queue (2) was at the pool size, so the round asked for one more
    assert_eq!(*scaled.lock().unwrap(), vec![2, 3]);
    assert_eq!(pool.ready_count(), 2);
}

#[tokio::test]
async fn test_release_then_reacquire_binds_new_worker() {
    let (bus, _) = loopback();
    let farm = WorkerFarm::new(&bus, "jdt", BindReply::Echo);
    let provisioner = Arc::new(CountingProvisioner::default());
    let pool = started_pool(&bus, provisioner.clone(), pool_config(1));
    farm.announce("s1");
    farm.announce("s2");

    assert_eq!(pool.acquire("alice").await.unwrap(), "s1");
    assert!(pool.release("alice"));
    assert!(!pool.release("alice"));
    assert_eq!(pool.acquire("alice").await.unwrap(), "s2");

    assert_eq!(*provisioner.removed.lock().unwrap(), vec!["s1".to_string()]);
    assert_eq!(pool.stats().metrics.releases, 1);
}

#[tokio::test]
async fn test_dispose_shuts_down_everything_once() {
    let (bus, _) = loopback();
    let farm = WorkerFarm::new(&bus, "jdt", BindReply::Echo);
    let provisioner = Arc::new(CountingProvisioner::default());
    let pool = started_pool(&bus, provisioner.clone(), pool_config(1));
    farm.announce("s1");
    farm.announce("s2");
    pool.acquire("alice").await.unwrap();

    let (first, second) = tokio::join!(pool.dispose(), pool.dispose());
    assert!(first ^ second);

    let mut removed = provisioner.removed.lock().unwrap().clone();
    removed.sort();
    assert_eq!(removed, vec!["s1".to_string(), "s2".to_string()]);
    assert_eq!(provisioner.disposed.load(Ordering::SeqCst), 1);

    // broadcasts after dispose are not tracked
    farm.announce("s3");
    assert_eq!(pool.ready_count(), 0);
    assert!(matches!(pool.acquire("bob").await, Err(PoolError::NotRunning)));
}
