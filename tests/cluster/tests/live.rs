//! Scenarios against a live Docker cluster.
//!
//! Every test here brings up its own compose project and tears it down
//! afterwards. Tests share the Docker host, so they run one at a time.
//!
//! Run: `cargo test -p cluster-tests --test live -- --ignored`

use cluster_harness::runtime::DockerRuntime;
use cluster_harness::{Composition, HarnessConfig, ServiceState};
use serial_test::serial;

fn composition() -> Composition {
    let config = HarnessConfig::default();
    let runtime = DockerRuntime::new(&config.project).expect("docker runtime");
    Composition::new(config, Box::new(runtime), cluster_tests::services::catalog())
        .expect("service catalog")
}

async fn run(name: &str) {
    let c = composition();
    let registry = cluster_tests::registry().expect("registry");
    let result = registry.run(&c, name, Vec::new()).await;
    c.down(true).await.expect("cleanup failed");
    result.unwrap_or_else(|e| panic!("{} failed: {:?}", name, e));
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn materialized_comes_up_and_answers() {
    let c = composition();
    c.up(&["materialized"]).await.expect("up failed");
    assert_eq!(c.state("materialized").await, ServiceState::Running);
    assert_eq!(c.state("cockroach").await, ServiceState::Running);

    let rows = c.sql_query("SELECT 1").await.expect("query failed");
    assert_eq!(rows, vec![vec![Some("1".to_string())]]);

    c.down(true).await.expect("cleanup failed");
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn drop_default_cluster() {
    run("test-drop-default-cluster").await;
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn statement_timeout_on_crash_loop() {
    run("test-github-12251").await;
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn command_history_bounded() {
    run("test-github-15531").await;
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn frontiers_after_restart() {
    run("test-github-15535").await;
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn replica_targeted_subscribe_abort() {
    run("test-replica-targeted-subscribe-abort").await;
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn bootstrap_vars() {
    run("test-bootstrap-vars").await;
}
