use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use tokio::time::sleep;
use weft::{Cluster, Config, Error, EventKind, GlobalId, Registry};

fn init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A registry whose only task counts its runs and shuts the cluster down.
fn counting(runs: &Arc<AtomicUsize>) -> Registry {
    let runs = runs.clone();
    let mut registry = Registry::new();
    registry.register("gated", move |scope, _, _| {
        runs.fetch_add(1, Ordering::SeqCst);
        scope.shutdown()?;
        Ok(GlobalId::NULL)
    });
    registry
}

/// Creates an event on node 0 and a task on node 1 waiting for it.
async fn gated_task(cluster: &Cluster) -> Result<GlobalId, Error> {
    let gate = Arc::new(Mutex::new(GlobalId::NULL));
    let out = gate.clone();
    cluster
        .exec(0, move |scope| {
            let gated = scope.template_create("gated", 0, 1)?;
            let event = scope.event_create(EventKind::Once, false)?;
            scope.task_create(gated, &[], 1, Some(&[event]), 0, GlobalId::node_hint(1))?;
            *out.lock().unwrap() = event;
            Ok(())
        })?
        .await
        .map_err(|_| Error::ShutDown)??;
    // let the creation traffic settle
    sleep(Duration::from_millis(100)).await;
    let event = *gate.lock().unwrap();
    Ok(event)
}

async fn open(cluster: &Cluster, event: GlobalId) -> Result<(), Error> {
    cluster
        .exec(0, move |scope| scope.event_satisfy(event, GlobalId::NULL))?
        .await
        .map_err(|_| Error::ShutDown)?
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_paused_cluster_parks_work_until_resumed() {
    init();
    let runs = Arc::new(AtomicUsize::new(0));
    let cluster = Cluster::start(Config::builder().nodes(2).build(), counting(&runs)).unwrap();
    let event = gated_task(&cluster).await.unwrap();

    assert_eq!(cluster.pause().await.unwrap(), 0);
    open(&cluster, event).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    cluster.resume().unwrap();
    cluster.wait().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    cluster.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pause_reports_unconfirmed_messages() {
    init();
    let runs = Arc::new(AtomicUsize::new(0));
    let cluster = Cluster::start(Config::builder().nodes(2).build(), counting(&runs)).unwrap();
    let event = gated_task(&cluster).await.unwrap();

    cluster.pause().await.unwrap();
    // parked at node 0, so the satisfy stays unconfirmed
    open(&cluster, event).await.unwrap();
    assert_eq!(cluster.pause().await.unwrap(), 1);
    cluster.resume().unwrap();
    cluster.wait().await.unwrap();
    cluster.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_load_returns_to_the_saved_graph() {
    init();
    let dir = std::env::temp_dir().join(format!("weft-save-load-{}", std::process::id()));
    let runs = Arc::new(AtomicUsize::new(0));
    let config = Config::builder().nodes(2).checkpoint_dir(dir.clone()).build();
    let cluster = Cluster::start(config, counting(&runs)).unwrap();
    let event = gated_task(&cluster).await.unwrap();

    assert_eq!(cluster.save().await.unwrap(), 0);
    cluster.resume().unwrap();
    open(&cluster, event).await.unwrap();
    cluster.wait().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // the task has not run yet in the checkpoint
    cluster.load().await.unwrap();
    cluster.resume().unwrap();
    open(&cluster, event).await.unwrap();
    cluster.wait().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    cluster.stop().await.unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}
