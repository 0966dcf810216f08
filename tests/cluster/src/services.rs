//! Service catalog of the cluster under test.
//!
//! `catalog()` returns the base definitions every scenario starts from.
//! [`Materialized`], [`Clusterd`] and [`Postgres`] build the variants
//! scenarios push as scoped overrides.

use cluster_harness::{HealthCheck, ServiceDefinition};
use std::time::Duration;

/// SQL port of the control plane.
pub const SQL_PORT: u16 = 6875;
/// Internal SQL port (system user).
pub const INTERNAL_SQL_PORT: u16 = 6877;
/// HTTP port serving health and metrics on every cluster process.
pub const HTTP_PORT: u16 = 6878;

/// Storage controller port of a compute node.
pub const STORAGECTL_PORT: u16 = 2100;
/// Compute controller port of a compute node.
pub const COMPUTECTL_PORT: u16 = 2101;
/// Dataflow (timely) port of a compute node.
pub const COMPUTE_PORT: u16 = 2102;

const MATERIALIZED_IMAGE: &str = "materialize/materialized:latest";
const CLUSTERD_IMAGE: &str = "materialize/clusterd:latest";
const COCKROACH_IMAGE: &str = "cockroachdb/cockroach:v23.1.11";
const POSTGRES_IMAGE: &str = "postgres:15.4";
const CONFLUENT_VERSION: &str = "7.5.0";

/// Every base service.
pub fn catalog() -> Vec<ServiceDefinition> {
    vec![
        zookeeper(),
        kafka(),
        schema_registry(),
        localstack(),
        cockroach(),
        Clusterd::new("clusterd1").build(),
        Clusterd::new("clusterd2").build(),
        Clusterd::new("clusterd3").build(),
        Clusterd::new("clusterd4").build(),
        // Some scenarios panic a cluster process on purpose; environmentd
        // must stay up.
        Materialized::new()
            .propagate_crashes(false)
            .external_cockroach(true)
            .build(),
        redpanda(),
        Postgres::new().build(),
    ]
}

/// Control plane (`materialized`) definition builder.
#[derive(Debug, Clone)]
pub struct Materialized {
    propagate_crashes: bool,
    external_cockroach: bool,
    options: Vec<String>,
    environment_extra: Vec<String>,
}

impl Default for Materialized {
    fn default() -> Self {
        Self {
            propagate_crashes: true,
            external_cockroach: false,
            options: Vec::new(),
            environment_extra: Vec::new(),
        }
    }
}

impl Materialized {
    /// Default control plane.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a crashing cluster process takes environmentd down with it.
    pub fn propagate_crashes(mut self, propagate: bool) -> Self {
        self.propagate_crashes = propagate;
        self
    }

    /// Keep catalog and consensus state in the `cockroach` service.
    pub fn external_cockroach(mut self, external: bool) -> Self {
        self.external_cockroach = external;
        self
    }

    /// Extra command-line options.
    pub fn options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.extend(options.into_iter().map(Into::into));
        self
    }

    /// Extra `KEY=value` environment entries.
    pub fn environment_extra<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environment_extra
            .extend(entries.into_iter().map(Into::into));
        self
    }

    /// Build the definition.
    pub fn build(self) -> ServiceDefinition {
        let mut def = ServiceDefinition::new("materialized", MATERIALIZED_IMAGE)
            .ports(&[SQL_PORT, INTERNAL_SQL_PORT])
            .metrics_port(HTTP_PORT)
            .env("MZ_SOFT_ASSERTIONS", "1")
            .env(
                "MZ_ORCHESTRATOR_PROCESS_PROPAGATE_CRASHES",
                if self.propagate_crashes { "true" } else { "false" },
            )
            .env("MZ_PERSIST_BLOB_URL", "file:///mzdata/persist/blob")
            .env("MZ_BOOTSTRAP_ROLE", "materialize")
            .volume("mzdata:/mzdata")
            .volume("tmp:/share/tmp")
            .healthcheck(
                HealthCheck::shell("curl -fsS localhost:6878/api/readyz")
                    .interval(Duration::from_secs(1))
                    .retries(120),
            )
            .startup_timeout(Duration::from_secs(180));

        if self.external_cockroach {
            def = def
                .env(
                    "MZ_ADAPTER_STASH_URL",
                    "postgres://root@cockroach:26257?options=--search_path=adapter",
                )
                .env(
                    "MZ_STORAGE_STASH_URL",
                    "postgres://root@cockroach:26257?options=--search_path=storage",
                )
                .env(
                    "MZ_PERSIST_CONSENSUS_URL",
                    "postgres://root@cockroach:26257?options=--search_path=consensus",
                )
                .depends_on("cockroach");
        }

        for entry in &self.environment_extra {
            def = def.env_entry(entry);
        }
        def.args(self.options)
    }
}

/// Compute/storage node (`clusterd`) definition builder.
#[derive(Debug, Clone)]
pub struct Clusterd {
    name: String,
    environment_extra: Vec<String>,
}

impl Clusterd {
    /// Node named `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            environment_extra: Vec::new(),
        }
    }

    /// Extra `KEY=value` environment entries (e.g. `FAILPOINTS=...`).
    pub fn environment_extra<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environment_extra
            .extend(entries.into_iter().map(Into::into));
        self
    }

    /// Build the definition.
    pub fn build(self) -> ServiceDefinition {
        let mut def = ServiceDefinition::new(&self.name, CLUSTERD_IMAGE)
            .ports(&[STORAGECTL_PORT, COMPUTECTL_PORT, COMPUTE_PORT])
            .metrics_port(HTTP_PORT)
            .env(
                "CLUSTERD_STORAGE_CONTROLLER_LISTEN_ADDR",
                &format!("0.0.0.0:{}", STORAGECTL_PORT),
            )
            .env(
                "CLUSTERD_COMPUTE_CONTROLLER_LISTEN_ADDR",
                &format!("0.0.0.0:{}", COMPUTECTL_PORT),
            )
            .env(
                "CLUSTERD_INTERNAL_HTTP_LISTEN_ADDR",
                &format!("0.0.0.0:{}", HTTP_PORT),
            )
            .env("CLUSTERD_SECRETS_READER", "local-file")
            .env("CLUSTERD_SECRETS_READER_LOCAL_FILE_DIR", "/mzdata/secrets")
            .env("MZ_SOFT_ASSERTIONS", "1")
            .volume("mzdata:/mzdata")
            .volume("tmp:/share/tmp");

        for entry in &self.environment_extra {
            def = def.env_entry(entry);
        }
        def
    }
}

/// Upstream PostgreSQL definition builder.
#[derive(Debug, Clone, Default)]
pub struct Postgres;

impl Postgres {
    /// PostgreSQL with logical replication enabled.
    pub fn new() -> Self {
        Self
    }

    /// Build the definition.
    pub fn build(self) -> ServiceDefinition {
        ServiceDefinition::new("postgres", POSTGRES_IMAGE)
            .args([
                "postgres",
                "-c",
                "wal_level=logical",
                "-c",
                "max_wal_senders=20",
                "-c",
                "max_replication_slots=20",
            ])
            .ports(&[5432])
            .env("POSTGRES_PASSWORD", "postgres")
            .env("POSTGRESDB", "postgres")
            .healthcheck(HealthCheck::cmd(&["pg_isready", "-U", "postgres"]))
    }
}

fn cockroach() -> ServiceDefinition {
    ServiceDefinition::new("cockroach", COCKROACH_IMAGE)
        .args(["start-single-node", "--insecure"])
        .ports(&[26257])
        .env("COCKROACH_ENGINE_MAX_SYNC_DURATION_DEFAULT", "120s")
        .volume("cockroach:/cockroach/cockroach-data")
        .healthcheck(HealthCheck::shell(
            "curl -fsS 'localhost:8080/health?ready=1'",
        ))
}

fn zookeeper() -> ServiceDefinition {
    ServiceDefinition::new(
        "zookeeper",
        &format!("confluentinc/cp-zookeeper:{}", CONFLUENT_VERSION),
    )
    .ports(&[2181])
    .env("ZOOKEEPER_CLIENT_PORT", "2181")
    .healthcheck(HealthCheck::shell("nc -z localhost 2181"))
}

fn kafka() -> ServiceDefinition {
    ServiceDefinition::new(
        "kafka",
        &format!("confluentinc/cp-kafka:{}", CONFLUENT_VERSION),
    )
    .ports(&[9092])
    .env("KAFKA_ZOOKEEPER_CONNECT", "zookeeper:2181")
    .env("KAFKA_ADVERTISED_LISTENERS", "PLAINTEXT://kafka:9092")
    .env("KAFKA_BROKER_ID", "1")
    .env("KAFKA_OFFSETS_TOPIC_REPLICATION_FACTOR", "1")
    .env("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
    .depends_on("zookeeper")
    .healthcheck(HealthCheck::shell("nc -z localhost 9092"))
}

fn schema_registry() -> ServiceDefinition {
    ServiceDefinition::new(
        "schema-registry",
        &format!("confluentinc/cp-schema-registry:{}", CONFLUENT_VERSION),
    )
    .ports(&[8081])
    .env("SCHEMA_REGISTRY_KAFKASTORE_BOOTSTRAP_SERVERS", "PLAINTEXT://kafka:9092")
    .env("SCHEMA_REGISTRY_HOST_NAME", "localhost")
    .depends_on("kafka")
    .healthcheck(HealthCheck::shell("curl -fsS localhost:8081"))
}

fn localstack() -> ServiceDefinition {
    ServiceDefinition::new("localstack", "localstack/localstack:2.3")
        .ports(&[4566])
        .healthcheck(HealthCheck::shell(
            "curl -fsS localhost:4566/_localstack/health",
        ))
}

fn redpanda() -> ServiceDefinition {
    ServiceDefinition::new("redpanda", "docker.vectorized.io/vectorized/redpanda:v23.2.14")
        .args([
            "redpanda",
            "start",
            "--overprovisioned",
            "--smp=1",
            "--memory=1G",
            "--reserve-memory=0M",
            "--node-id=0",
            "--check=false",
            "--set",
            "redpanda.enable_transactions=true",
            "--advertise-kafka-addr=redpanda:9092",
        ])
        .ports(&[9092, 8081])
        .healthcheck(HealthCheck::shell("curl -fsS localhost:9644/v1/status/ready"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn catalog_names_are_unique() {
        let names: Vec<String> = catalog().into_iter().map(|d| d.name).collect();
        let unique: BTreeSet<&String> = names.iter().collect();
        assert_eq!(names.len(), unique.len());
        for expected in ["materialized", "clusterd1", "clusterd4", "cockroach", "postgres"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn catalog_materialized_uses_cockroach() {
        let mz = catalog()
            .into_iter()
            .find(|d| d.name == "materialized")
            .unwrap();
        assert!(mz.depends_on.contains("cockroach"));
        assert_eq!(
            mz.environment["MZ_ORCHESTRATOR_PROCESS_PROPAGATE_CRASHES"],
            "false"
        );
    }

    #[test]
    fn materialized_options_and_environment_are_equivalent_inputs() {
        let param = "allowed_cluster_replica_sizes='1', '2', 'oops'";
        let by_option = Materialized::new()
            .options([format!("--bootstrap-system-parameter={}", param)])
            .build();
        let by_env = Materialized::new()
            .environment_extra([format!("MZ_BOOTSTRAP_SYSTEM_PARAMETER={}", param)])
            .build();

        assert_eq!(
            by_option.command,
            vec![format!("--bootstrap-system-parameter={}", param)]
        );
        assert_eq!(by_env.environment["MZ_BOOTSTRAP_SYSTEM_PARAMETER"], param);
        assert_ne!(by_option, by_env);
    }

    #[test]
    fn clusterd_failpoints() {
        let storage = Clusterd::new("storage")
            .environment_extra(["FAILPOINTS=pg_snapshot_failure=return"])
            .build();
        assert_eq!(storage.name, "storage");
        assert_eq!(storage.environment["FAILPOINTS"], "pg_snapshot_failure=return");
        assert_eq!(storage.metrics_port, Some(HTTP_PORT));
        assert_ne!(storage, Clusterd::new("storage").build());
    }

    #[test]
    fn postgres_enables_logical_replication() {
        let pg = Postgres::new().build();
        assert!(pg.command.iter().any(|a| a == "wal_level=logical"));
        assert!(pg.healthcheck.is_some());
    }
}
