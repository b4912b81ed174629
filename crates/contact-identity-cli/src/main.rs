use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use contact_identity_core::{ContactId, IdentityQuery};
use contact_identity_store_sqlite::{SqliteStore, StoreOptions};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "cid")]
#[command(about = "Contact identity reconciliation CLI")]
struct Cli {
    #[arg(long, default_value = "./contact_identity.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value_t = 5_000)]
    busy_timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Reconcile one (email, phone) pair and print the resulting identity.
    Identify(IdentifyArgs),
    Contact {
        #[command(subcommand)]
        command: ContactCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct IdentifyArgs {
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ContactCommand {
    /// Print the cluster the given contact belongs to.
    Show(ContactShowArgs),
    /// Print every stored contact, soft-deleted rows included.
    List,
}

#[derive(Debug, Args)]
struct ContactShowArgs {
    #[arg(long)]
    id: i64,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let options = StoreOptions { busy_timeout_ms: cli.busy_timeout_ms };

    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open_with_options(&cli.db, options)?;
            run_db(command, &mut store)
        }
        Command::Identify(args) => {
            // Validate before the database file is created.
            let query = IdentityQuery::new(args.email, args.phone)?;
            let mut store = SqliteStore::open_with_options(&cli.db, options)?;
            run_identify(&query, &mut store)
        }
        Command::Contact { command } => {
            let mut store = SqliteStore::open_with_options(&cli.db, options)?;
            run_contact(command, &mut store)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    tracing::info!(
        before_version = before.current_version,
        after_version = after.current_version,
        "schema migrated"
    );
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_integrity_check(store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let report = store.integrity_check()?;
    let clean = report.is_clean();
    let mut value = serde_json::to_value(&report).context("failed to serialize integrity report")?;
    if let Value::Object(object) = &mut value {
        object.insert("clean".to_string(), Value::Bool(clean));
    }
    emit_json(value)
}

fn run_identify(query: &IdentityQuery, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let view = store.reconcile(query)?;
    tracing::info!(
        primary_contact_id = %view.primary_contact_id,
        secondary_contacts = view.secondary_contact_ids.len(),
        "identify completed"
    );
    emit_json(serde_json::json!({ "contact": view }))
}

fn run_contact(command: ContactCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        ContactCommand::Show(args) => {
            let view = store
                .cluster_of(ContactId(args.id))?
                .ok_or_else(|| anyhow!("contact not found: {}", args.id))?;
            emit_json(serde_json::json!({ "contact": view }))
        }
        ContactCommand::List => {
            let contacts = store.list_contacts()?;
            emit_json(serde_json::json!({
                "count": contacts.len(),
                "contacts": contacts
            }))
        }
    }
}
