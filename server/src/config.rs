use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Switchboard session-routing and signaling-relay server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(
    name = "switchboard-server",
    version,
    about = "Switchboard session-routing and signaling-relay server"
)]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "SWITCHBOARD_PORT", default_value = "4610")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "SWITCHBOARD_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./switchboard.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "SWITCHBOARD_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (token-verification secret)
    #[arg(long, env = "SWITCHBOARD_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Redis URL for the cross-process routing store and relay bus.
    /// When unset, the server runs single-process with in-memory backends.
    #[arg(long, env = "SWITCHBOARD_REDIS_URL")]
    pub redis_url: Option<String>,

    /// TTL in seconds for routing entries. Entries are refreshed on the
    /// ping cadence; the TTL only bounds staleness after a process crash.
    #[arg(long, env = "SWITCHBOARD_ROUTE_TTL_SECS", default_value = "90")]
    pub route_ttl_secs: u64,

    /// Upper bound in milliseconds for any single store or bus operation.
    /// A timed-out call drops the in-flight message, never the connection.
    #[arg(long, env = "SWITCHBOARD_STORE_TIMEOUT_MS", default_value = "500")]
    pub store_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4610,
            bind_address: "0.0.0.0".to_string(),
            config: "./switchboard.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            redis_url: None,
            route_ttl_secs: 90,
            store_timeout_ms: 500,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (SWITCHBOARD_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("SWITCHBOARD_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Switchboard Server Configuration
# Place this file at ./switchboard.toml or specify with --config <path>
# All settings can be overridden via environment variables (SWITCHBOARD_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 4610)
# port = 4610

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the token-verification secret
# data_dir = "./data"

# ---- Cross-Process Routing ----

# Redis URL for the shared routing store and relay bus.
# Leave unset to run a single process with in-memory backends.
# redis_url = "redis://127.0.0.1:6379/0"

# TTL in seconds for routing entries (refreshed while the connection lives;
# bounds staleness after a crash)
# route_ttl_secs = 90

# Upper bound in milliseconds for a single store/bus operation
# store_timeout_ms = 500
"#
    .to_string()
}
