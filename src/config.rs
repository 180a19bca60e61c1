use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::{env, fmt::Display, str::FromStr, time::Duration};

use crate::{backend::remote::RetryPolicy, executor::ConnectOptions, protocol};

/// Which storage backend `serve` puts behind the asset store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Local,
    Remote,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "remote" => Ok(BackendKind::Remote),
            other => anyhow::bail!("unknown backend `{}` (expected local or remote)", other),
        }
    }
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Serve the asset HTTP API
    Serve,
    /// Run a store node that keeps assets in SQLite
    Node,
    /// Create the store node's tables and indexes, then exit
    Provision,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend: BackendKind,
    pub storage_dir: String,
    pub node_addr: String,
    pub node_database_url: String,
    pub auth_token: String,
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub max_frame_len: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Versioned, lockable asset store")]
pub struct Args {
    #[command(subcommand)]
    pub mode: Mode,

    /// Host to bind to (overrides ASSET_STORE_HOST)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to bind to (overrides ASSET_STORE_PORT)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Storage backend behind the API (overrides ASSET_STORE_BACKEND)
    #[arg(long, global = true, value_enum)]
    pub backend: Option<BackendKind>,

    /// Directory where the local backend keeps assets (overrides ASSET_STORE_STORAGE_DIR)
    #[arg(long, global = true)]
    pub storage_dir: Option<String>,

    /// Store node address, to listen on or connect to (overrides ASSET_STORE_NODE_ADDR)
    #[arg(long, global = true)]
    pub node_addr: Option<String>,

    /// Store node database URL (overrides ASSET_STORE_NODE_DATABASE_URL)
    #[arg(long, global = true)]
    pub node_database_url: Option<String>,

    /// Shared store node credential (overrides ASSET_STORE_AUTH_TOKEN)
    #[arg(long, global = true)]
    pub auth_token: Option<String>,

    /// Per-connection time budget in milliseconds (overrides ASSET_STORE_TIMEOUT_MS)
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Attempts per remote call (overrides ASSET_STORE_RETRY_ATTEMPTS)
    #[arg(long, global = true)]
    pub retry_attempts: Option<u32>,

    /// Delay before the first retry in milliseconds (overrides ASSET_STORE_RETRY_BACKOFF_MS)
    #[arg(long, global = true)]
    pub retry_backoff_ms: Option<u64>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the mode to run.
    pub fn from_env_and_args() -> Result<(Self, Mode)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("ASSET_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("ASSET_STORE_PORT", 3000u16)?;
        let env_backend = env_or("ASSET_STORE_BACKEND", BackendKind::Local)?;
        let env_storage =
            env::var("ASSET_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/assets".into());
        let env_node_addr =
            env::var("ASSET_STORE_NODE_ADDR").unwrap_or_else(|_| "127.0.0.1:7070".into());
        let env_node_db = env::var("ASSET_STORE_NODE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/node/assets.db".into());
        let env_token = env::var("ASSET_STORE_AUTH_TOKEN").unwrap_or_default();
        let env_timeout = env_or("ASSET_STORE_TIMEOUT_MS", 10_000u64)?;
        let env_attempts = env_or("ASSET_STORE_RETRY_ATTEMPTS", 3u32)?;
        let env_backoff = env_or("ASSET_STORE_RETRY_BACKOFF_MS", 200u64)?;
        let max_frame_len = env_or("ASSET_STORE_MAX_FRAME_LEN", protocol::DEFAULT_MAX_FRAME_LEN)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            backend: args.backend.unwrap_or(env_backend),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            node_addr: args.node_addr.unwrap_or(env_node_addr),
            node_database_url: args.node_database_url.unwrap_or(env_node_db),
            auth_token: args.auth_token.unwrap_or(env_token),
            timeout: Duration::from_millis(args.timeout_ms.unwrap_or(env_timeout)),
            retry_attempts: args.retry_attempts.unwrap_or(env_attempts),
            retry_backoff: Duration::from_millis(args.retry_backoff_ms.unwrap_or(env_backoff)),
            max_frame_len,
        };

        Ok((cfg, args.mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            token: self.auth_token.clone(),
            timeout: self.timeout,
            max_frame_len: self.max_frame_len,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            backoff: self.retry_backoff,
        }
    }
}

/// Read `name` from the environment, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_case_insensitively() {
        assert_eq!("Remote".parse::<BackendKind>().unwrap(), BackendKind::Remote);
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert!("s3".parse::<BackendKind>().is_err());
    }

    #[test]
    fn cli_flags_parse_after_subcommand() {
        let args = Args::try_parse_from([
            "asset-store",
            "serve",
            "--backend",
            "remote",
            "--timeout-ms",
            "250",
        ])
        .unwrap();
        assert_eq!(args.mode, Mode::Serve);
        assert_eq!(args.backend, Some(BackendKind::Remote));
        assert_eq!(args.timeout_ms, Some(250));
    }

    #[test]
    fn unset_variable_uses_default() {
        let value: u32 = env_or("ASSET_STORE_TEST_SURELY_UNSET", 7).unwrap();
        assert_eq!(value, 7);
    }
}
