//! Process configuration from CLI flags and environment variables.

use std::path::PathBuf;

use clap::Parser;

use crate::graph::GraphConfig;

#[derive(Parser, Clone, Debug)]
#[command(
    name = "spectre",
    about = "Kubernetes change recorder and incident-investigation backend",
    version
)]
pub struct Opts {
    /// Directory for block files and the template snapshot.
    #[arg(long, env = "SPECTRE_DATA_DIR", default_value = "/var/lib/spectre")]
    pub data_dir: PathBuf,

    /// HTTP listen port.
    #[arg(long, env = "SPECTRE_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Log filter (tracing env-filter syntax).
    #[arg(long, env = "SPECTRE_LOG", default_value = "info")]
    pub log_level: String,

    /// Watch configuration file (list of resources to watch).
    #[arg(long, env = "SPECTRE_WATCH_CONFIG", default_value = "/etc/spectre/watch.yaml")]
    pub watch_config: PathBuf,

    /// Uncompressed block segment target, bytes.
    #[arg(long, env = "SPECTRE_SEGMENT_SIZE", default_value_t = 10 * 1024 * 1024)]
    pub segment_size: usize,

    /// Decompressed block cache budget in MiB. Zero disables the cache.
    #[arg(long, env = "SPECTRE_BLOCK_CACHE_MIB", default_value_t = 64)]
    pub block_cache_mib: usize,

    /// Concurrent heavyweight API requests (search, export, import).
    #[arg(long, env = "SPECTRE_MAX_CONCURRENT_REQUESTS", default_value_t = 32)]
    pub max_concurrent_requests: usize,

    /// Graph engine Bolt host.
    #[arg(long, env = "SPECTRE_GRAPH_HOST", default_value = "localhost")]
    pub graph_host: String,

    /// Graph engine Bolt port.
    #[arg(long, env = "SPECTRE_GRAPH_PORT", default_value_t = 7687)]
    pub graph_port: u16,

    #[arg(long, env = "SPECTRE_GRAPH_USER", default_value = "neo4j")]
    pub graph_user: String,

    #[arg(long, env = "SPECTRE_GRAPH_PASSWORD", default_value = "", hide_env_values = true)]
    pub graph_password: String,

    /// Integration instance config file.
    #[arg(
        long,
        env = "SPECTRE_INTEGRATIONS_CONFIG",
        default_value = "/etc/spectre/integrations.yaml"
    )]
    pub integrations_config: PathBuf,

    /// Namespace integration Secret references resolve from.
    #[arg(long, env = "SPECTRE_SECRETS_NAMESPACE", default_value = "spectre-system")]
    pub secrets_namespace: String,

    /// Path segment the MCP endpoint is served under.
    #[arg(long, env = "SPECTRE_MCP_PATH", default_value = "mcp")]
    pub mcp_path: String,

    /// Event queue capacity; overflow drops the oldest entries.
    #[arg(long, env = "SPECTRE_EVENT_QUEUE_CAPACITY", default_value_t = 10_000)]
    pub event_queue_capacity: usize,

    /// Serve the tool protocol on stdin/stdout; diagnostics go to stderr.
    #[arg(long)]
    pub stdio: bool,
}

impl Opts {
    pub fn graph_config(&self) -> GraphConfig {
        GraphConfig {
            host: self.graph_host.clone(),
            port: self.graph_port,
            user: self.graph_user.clone(),
            password: self.graph_password.clone(),
        }
    }

    pub fn block_cache_bytes(&self) -> usize {
        self.block_cache_mib * 1024 * 1024
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    pub fn templates_path(&self) -> PathBuf {
        self.data_dir.join("templates.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let opts = Opts::parse_from(["spectre"]);
        assert_eq!(opts.port, 8080);
        assert_eq!(opts.segment_size, 10 * 1024 * 1024);
        assert_eq!(opts.block_cache_bytes(), 64 * 1024 * 1024);
        assert!(!opts.stdio);
    }

    #[test]
    fn cache_can_be_disabled() {
        let opts = Opts::parse_from(["spectre", "--block-cache-mib", "0"]);
        assert_eq!(opts.block_cache_bytes(), 0);
    }
}
