//! Runs one tierlink node from a TOML file.
//!
//! ```text
//! tier-node --config login.toml [--bind 0.0.0.0:7000] [--json-logs]
//! ```
//!
//! Exit codes: 0 after ctrl-c, 2 when the listener cannot bind, 3 when the
//! configuration cannot be read or is invalid.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use serde::Deserialize;
use tierlink::prelude::*;
use tracing_subscriber::EnvFilter;

const EXIT_BIND: u8 = 2;
const EXIT_CONFIG: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "tier-node", about = "Run one login, central or game tier node")]
struct Args {
    /// TOML file with a `[server]` table and optional `[[accounts]]`.
    #[arg(long)]
    config: PathBuf,

    /// Overrides `server.bind`.
    #[arg(long)]
    bind: Option<String>,

    /// Log as JSON lines instead of human-readable text.
    #[arg(long)]
    json_logs: bool,
}

// ---------------------------------------------------------------------------
// Config file
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NodeFile {
    server: ServerConfig,
    #[serde(default)]
    accounts: Vec<AccountEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct AccountEntry {
    name: String,
    password: String,
    identity: u64,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    max_characters: u32,
    #[serde(default)]
    privileged: bool,
    #[serde(default)]
    ephemeral: bool,
}

/// Accounts listed in the config file. Central and game tiers usually
/// have none: their users arrive with tickets.
struct AccountTable {
    accounts: HashMap<String, AccountEntry>,
}

impl AccountTable {
    fn new(entries: Vec<AccountEntry>) -> Self {
        Self {
            accounts: entries.into_iter().map(|a| (a.name.clone(), a)).collect(),
        }
    }
}

impl Authenticator for AccountTable {
    async fn authenticate(
        &self,
        account: &str,
        password: &str,
    ) -> Result<AccountRecord, SessionError> {
        match self.accounts.get(account) {
            Some(entry) if entry.password == password => Ok(AccountRecord {
                identity: IdentityId(entry.identity),
                account: entry.name.clone(),
                roles: entry.roles.clone(),
                max_characters: entry.max_characters,
                privileged: entry.privileged,
                ephemeral: entry.ephemeral,
            }),
            _ => Err(SessionError::AuthFailed(format!("bad credentials for {account}"))),
        }
    }
}

fn load(path: &PathBuf) -> Result<NodeFile, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    toml::from_str(&text).map_err(|e| format!("cannot parse {}: {e}", path.display()))
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.json_logs);

    let file = match load(&args.config) {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(error = %e, "configuration failed");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let mut config = file.server;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let server = match TierServerBuilder::new(config)
        .build(AccountTable::new(file.accounts))
        .await
    {
        Ok(server) => server,
        Err(TierlinkError::Transport(e)) => {
            tracing::error!(error = %e, "cannot bind listener");
            return ExitCode::from(EXIT_BIND);
        }
        Err(e) => {
            tracing::error!(error = %e, "configuration failed");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if let Ok(addr) = server.local_addr() {
        tracing::info!(%addr, "listening");
    }
    let handle = server.handle();
    let node = tokio::spawn(server.run());

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for ctrl-c, shutting down");
    }
    handle.shutdown();

    match node.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "node stopped with an error");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "node task panicked");
            ExitCode::FAILURE
        }
    }
}
