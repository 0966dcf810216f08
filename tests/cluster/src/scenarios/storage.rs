//! Storage recovery scenarios.
//!
//! Sources must survive restarts of the control plane and of the process
//! running them, and a Postgres snapshot interrupted by a failpoint must
//! resume once the failpoint is turned off.

use std::time::Duration;

use cluster_harness::workflow::{WorkflowArgs, WorkflowFuture};
use cluster_harness::{Composition, HarnessError, ScriptOptions};
use futures_util::FutureExt;
use tracing::info;

use super::{restart_materialized, run_scripts, wait_for_rows, INGEST_WAIT};
use crate::services::Clusterd;

/// Failpoint making the Postgres snapshot fail.
pub const SNAPSHOT_FAILURE: &str = "FAILPOINTS=pg_snapshot_failure=return";
/// Failpoint pausing the Postgres snapshot after two tables.
pub const SNAPSHOT_PAUSE: &str = "FAILPOINTS=pg_snapshot_pause=return(2)";

const COUNTER_TICKED: &str = "SELECT count(*) > 0 FROM counter";
const UPSERT_CONTENTS: &str = "SELECT key, text FROM upsert_text ORDER BY key";

/// Topic the upsert scenario produces to.
pub const UPSERT_TOPIC: &str = "upsert-text";

const PERSIST_SETTLE: Duration = Duration::from_secs(10);
const CRASH_SETTLE: Duration = Duration::from_secs(10);

/// Sources on a remote clusterd across control plane and clusterd restarts.
pub fn test_remote_storage(c: &Composition, _args: WorkflowArgs) -> WorkflowFuture<'_> {
    remote_storage(c).boxed()
}

async fn remote_storage(c: &Composition) -> Result<(), HarnessError> {
    c.down(true).await?;
    c.up(&[
        "cockroach",
        "materialized",
        "clusterd1",
        "zookeeper",
        "kafka",
        "schema-registry",
    ])
    .await?;

    let options = || {
        let mut options = ScriptOptions::default().no_reset();
        options.default_timeout = Some(Duration::from_secs(15));
        options
    };

    run_scripts(c, options(), &["storage/01-create-sources.td"]).await?;
    wait_for_rows(c, COUNTER_TICKED, &["t"], INGEST_WAIT).await?;

    restart_materialized(c).await?;
    wait_for_rows(c, COUNTER_TICKED, &["t"], INGEST_WAIT).await?;
    run_scripts(c, options(), &["storage/02-after-environmentd-restart.td"]).await?;

    c.kill("clusterd1").await?;
    run_scripts(c, options(), &["storage/03-while-clusterd-down.td"]).await?;

    c.up(&["clusterd1"]).await?;
    wait_for_rows(c, "SELECT max(counter) > 0 FROM counter", &["t"], INGEST_WAIT).await?;
    run_scripts(c, options(), &["storage/04-after-clusterd-restart.td"]).await
}

/// Upsert sources keep ingesting after their clusterd is killed.
pub fn test_upsert(c: &Composition, _args: WorkflowArgs) -> WorkflowFuture<'_> {
    upsert(c).boxed()
}

async fn upsert(c: &Composition) -> Result<(), HarnessError> {
    c.down(true).await?;
    c.up(&["materialized", "zookeeper", "kafka", "schema-registry"])
        .await?;

    let options = || {
        let mut options = ScriptOptions::default().no_reset();
        options.default_timeout = Some(Duration::from_secs(30));
        options
    };

    produce(c, UPSERT_TOPIC, &[("fish", "fish"), ("bird", "goose"), ("mammal", "moose")]).await?;
    run_scripts(c, options(), &["upsert/01-create-sources.td"]).await?;
    wait_for_rows(
        c,
        UPSERT_CONTENTS,
        &["bird goose", "fish fish", "mammal moose"],
        INGEST_WAIT,
    )
    .await?;

    // Let the ingested state reach persist before the crash.
    info!("sleeping {:?} before killing clusterd", PERSIST_SETTLE);
    tokio::time::sleep(PERSIST_SETTLE).await;
    c.exec_ok("materialized", &["bash", "-c", "kill -9 `pidof clusterd`"])
        .await?;

    produce(c, UPSERT_TOPIC, &[("bird", "crow"), ("mammal", "whale"), ("reptile", "lizard")])
        .await?;
    wait_for_rows(
        c,
        UPSERT_CONTENTS,
        &["bird crow", "fish fish", "mammal whale", "reptile lizard"],
        INGEST_WAIT,
    )
    .await?;
    run_scripts(c, options(), &["upsert/02-after-clusterd-restart.td"]).await
}

/// Produce `key:value` records to `topic` from inside the kafka service.
pub async fn produce(
    c: &Composition,
    topic: &str,
    records: &[(&str, &str)],
) -> Result<(), HarnessError> {
    let script = producer_command(topic, records);
    c.exec_ok("kafka", &["bash", "-c", &script]).await?;
    info!(topic, count = records.len(), "produced records");
    Ok(())
}

fn producer_command(topic: &str, records: &[(&str, &str)]) -> String {
    let lines: Vec<String> = records
        .iter()
        .map(|(key, value)| format!("{}:{}", key, value))
        .collect();
    format!(
        "printf '{}\\n' | kafka-console-producer --bootstrap-server kafka:9092 \
         --topic {} --property parse.key=true --property key.separator=:",
        lines.join("\\n"),
        topic
    )
}

/// A Postgres snapshot that fails must resume once the failpoint is off.
pub fn pg_snapshot_resumption(c: &Composition, _args: WorkflowArgs) -> WorkflowFuture<'_> {
    snapshot_resumption(c).boxed()
}

async fn snapshot_resumption(c: &Composition) -> Result<(), HarnessError> {
    c.down(true).await?;

    let _failing = c.override_services(vec![Clusterd::new("storage")
        .environment_extra([SNAPSHOT_FAILURE])
        .build()]);
    c.up(&["materialized", "postgres", "storage"]).await?;

    let options = postgres_script_options(c).await?;
    run_scripts(
        c,
        options.clone(),
        &[
            "pg-snapshot-resumption/01-configure-postgres.td",
            "pg-snapshot-resumption/02-create-sources.td",
        ],
    )
    .await?;

    info!("sleeping {:?} so storage crashes on the failpoint", CRASH_SETTLE);
    tokio::time::sleep(CRASH_SETTLE).await;

    let _healthy = c.override_services(vec![Clusterd::new("storage").build()]);
    c.up(&["storage"]).await?;
    wait_for_rows(c, "SELECT f1 FROM t1 ORDER BY f1", &["1", "2", "3"], INGEST_WAIT).await?;
    run_scripts(c, options, &["pg-snapshot-resumption/04-verify-data.td"]).await?;

    // Replication keeps going after the snapshot.
    wait_for_rows(c, "SELECT count(*) FROM t1", &["4"], INGEST_WAIT).await
}

/// A Postgres snapshot paused part-way must complete after a restart.
pub fn pg_snapshot_partial_failure(c: &Composition, _args: WorkflowArgs) -> WorkflowFuture<'_> {
    snapshot_partial_failure(c).boxed()
}

async fn snapshot_partial_failure(c: &Composition) -> Result<(), HarnessError> {
    c.down(true).await?;

    let _paused = c.override_services(vec![Clusterd::new("storage")
        .environment_extra([SNAPSHOT_PAUSE])
        .build()]);
    c.up(&["materialized", "postgres", "storage"]).await?;

    let options = postgres_script_options(c).await?;
    run_scripts(
        c,
        options.clone(),
        &[
            "pg-snapshot-partial-failure/01-configure-postgres.td",
            "pg-snapshot-partial-failure/02-create-sources.td",
        ],
    )
    .await?;
    wait_for_rows(c, "SELECT f1 FROM t1 ORDER BY f1", &["1", "2"], INGEST_WAIT).await?;
    run_scripts(
        c,
        options.clone(),
        &["pg-snapshot-partial-failure/03-verify-good-sub-source.td"],
    )
    .await?;

    c.kill("storage").await?;

    let _resumed = c.override_services(vec![Clusterd::new("storage").build()]);
    run_scripts(
        c,
        options.clone(),
        &["pg-snapshot-partial-failure/04-add-more-data.td"],
    )
    .await?;
    c.up(&["storage"]).await?;
    wait_for_rows(c, "SELECT f1 FROM t1 ORDER BY f1", &["1", "2", "3"], INGEST_WAIT).await?;
    wait_for_rows(c, "SELECT f1 FROM t2 ORDER BY f1", &["10", "20", "30"], INGEST_WAIT).await?;
    run_scripts(c, options, &["pg-snapshot-partial-failure/05-verify-data.td"]).await
}

/// Script options with a `postgres` connection to the upstream database.
async fn postgres_script_options(c: &Composition) -> Result<ScriptOptions, HarnessError> {
    let postgres = c
        .sql_client_for("postgres", 5432)
        .await?
        .user("postgres")
        .password("postgres")
        .database("postgres");
    Ok(ScriptOptions::default()
        .no_reset()
        .connection("postgres", postgres))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_harness::runtime::{MockCall, MockRuntime};
    use cluster_harness::HarnessConfig;

    #[test]
    fn producer_command_renders_records() {
        let cmd = producer_command("upsert-text", &[("fish", "fish"), ("bird", "goose")]);
        assert!(cmd.starts_with("printf 'fish:fish\\nbird:goose\\n' | kafka-console-producer"));
        assert!(cmd.contains("--topic upsert-text"));
        assert!(cmd.contains("key.separator=:"));
    }

    #[tokio::test]
    async fn produce_execs_in_kafka() {
        let runtime = MockRuntime::new();
        let c = Composition::new(
            HarnessConfig::default(),
            Box::new(runtime.clone()),
            crate::services::catalog(),
        )
        .unwrap();
        c.up(&["kafka"]).await.unwrap();

        produce(&c, UPSERT_TOPIC, &[("k", "v")]).await.unwrap();

        let execs: Vec<MockCall> = runtime
            .calls()
            .into_iter()
            .filter(|call| matches!(call, MockCall::Exec(..)))
            .collect();
        assert_eq!(execs.len(), 1);
    }

    #[tokio::test]
    async fn produce_requires_running_kafka() {
        let runtime = MockRuntime::new();
        let c = Composition::new(
            HarnessConfig::default(),
            Box::new(runtime),
            crate::services::catalog(),
        )
        .unwrap();

        let err = produce(&c, UPSERT_TOPIC, &[("k", "v")]).await.unwrap_err();
        assert!(matches!(err, HarnessError::Exec(_)));
    }

    #[tokio::test]
    async fn failpoint_override_recreates_storage() {
        let runtime = MockRuntime::new();
        let c = Composition::new(
            HarnessConfig::default(),
            Box::new(runtime.clone()),
            crate::services::catalog(),
        )
        .unwrap();

        {
            let _failing = c.override_services(vec![Clusterd::new("storage")
                .environment_extra([SNAPSHOT_FAILURE])
                .build()]);
            c.up(&["storage"]).await.unwrap();
            let started = runtime.started_definition("storage").unwrap();
            assert_eq!(started.environment["FAILPOINTS"], "pg_snapshot_failure=return");

            {
                let _healthy = c.override_services(vec![Clusterd::new("storage").build()]);
                c.up(&["storage"]).await.unwrap();
                let started = runtime.started_definition("storage").unwrap();
                assert!(!started.environment.contains_key("FAILPOINTS"));
            }
        }
        assert!(c.definition("storage").is_none());
    }
}
