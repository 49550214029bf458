use std::path::PathBuf;

use anyhow::{anyhow, Result};
use billing_api::auth::hash_password;
use billing_core::{AccountId, Capability, TariffId, TariffLinkId, ValidationErrors};
use billing_store_sqlite::SqliteStore;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "billing")]
#[command(about = "Administration CLI for the billing tariff store")]
struct Cli {
    #[arg(long, env = "BILLING_DB", default_value = "./billing.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Operator {
        #[command(subcommand)]
        command: OperatorCommand,
    },
    Group {
        #[command(subcommand)]
        command: GroupCommand,
    },
    TariffLink {
        #[command(subcommand)]
        command: TariffLinkCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum OperatorCommand {
    /// Print the Argon2id PHC hash of a password without touching the database.
    HashPassword { password: String },
    Create(OperatorCreateArgs),
}

#[derive(Debug, Args)]
struct OperatorCreateArgs {
    #[arg(long)]
    login: String,
    #[arg(long)]
    password: String,
    #[arg(long, default_value = "")]
    display_name: String,
}

#[derive(Debug, Subcommand)]
enum GroupCommand {
    Create(GroupCreateArgs),
    AddMember(GroupMemberArgs),
    Grant(GroupGrantArgs),
}

#[derive(Debug, Args)]
struct GroupCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
}

#[derive(Debug, Args)]
struct GroupMemberArgs {
    #[arg(long)]
    group: String,
    #[arg(long)]
    login: String,
}

#[derive(Debug, Args)]
struct GroupGrantArgs {
    #[arg(long)]
    group: String,
    /// One of `accounts.read`, `tariffs.read`, `tariffs.update`.
    #[arg(long)]
    capability: String,
}

#[derive(Debug, Subcommand)]
enum TariffLinkCommand {
    Provision(ProvisionArgs),
    Show(ShowArgs),
}

#[derive(Debug, Args)]
struct ProvisionArgs {
    #[arg(long)]
    account_id: i64,
    #[arg(long)]
    tariff_id: i64,
}

#[derive(Debug, Args)]
struct ShowArgs {
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
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        Command::Operator { command: OperatorCommand::HashPassword { password } } => {
            emit_json(serde_json::json!({ "password_hash": hash_password(&password)? }))
        }
        Command::Operator { command: OperatorCommand::Create(args) } => {
            let mut store = open_migrated(&cli.db)?;
            run_operator_create(&args, &mut store)
        }
        Command::Group { command } => {
            let mut store = open_migrated(&cli.db)?;
            run_group(command, &mut store)
        }
        Command::TariffLink { command } => {
            let mut store = open_migrated(&cli.db)?;
            run_tariff_link(command, &mut store)
        }
    }
}

fn open_migrated(path: &std::path::Path) -> Result<SqliteStore> {
    let mut store = SqliteStore::open(path)?;
    store.migrate()?;
    Ok(store)
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_operator_create(args: &OperatorCreateArgs, store: &mut SqliteStore) -> Result<()> {
    let mut errors = ValidationErrors::new();
    errors.check(!args.login.trim().is_empty(), "login", "must be provided");
    errors.check(!args.password.is_empty(), "password", "must be provided");
    errors.into_result().map_err(|errors| anyhow!("invalid operator: {errors}"))?;

    let display_name =
        if args.display_name.is_empty() { args.login.as_str() } else { args.display_name.as_str() };
    let identity = store.insert_operator(&args.login, &hash_password(&args.password)?, display_name)?;
    emit_json(serde_json::to_value(identity)?)
}

fn run_group(command: GroupCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        GroupCommand::Create(args) => {
            let group_id = store.create_group(&args.name, &args.description)?;
            emit_json(serde_json::json!({ "group_id": group_id, "name": args.name }))
        }
        GroupCommand::AddMember(args) => {
            let group_id = store
                .group_by_name(&args.group)?
                .ok_or_else(|| anyhow!("group not found: {}", args.group))?;
            let operator = store
                .operator_by_login(&args.login)?
                .ok_or_else(|| anyhow!("operator not found: {}", args.login))?;
            store.add_group_member(group_id, operator.identity.id)?;
            emit_json(serde_json::json!({
                "group_id": group_id,
                "operator_id": operator.identity.id,
                "capabilities": store.capabilities_for(operator.identity.id)?
            }))
        }
        GroupCommand::Grant(args) => {
            let capability = Capability::parse(&args.capability)?;
            let group_id = store
                .group_by_name(&args.group)?
                .ok_or_else(|| anyhow!("group not found: {}", args.group))?;
            store.grant_capability(group_id, capability)?;
            emit_json(serde_json::json!({
                "group_id": group_id,
                "capability": capability,
                "fid": capability.fid()
            }))
        }
    }
}

fn run_tariff_link(command: TariffLinkCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        TariffLinkCommand::Provision(args) => {
            let mut errors = ValidationErrors::new();
            errors.check(args.account_id > 0, "account_id", "must be a positive integer");
            errors.check(args.tariff_id > 0, "tariff_id", "must be a positive integer");
            errors.into_result().map_err(|errors| anyhow!("invalid tariff link: {errors}"))?;

            let link =
                store.insert_tariff_link(AccountId(args.account_id), TariffId(args.tariff_id))?;
            emit_json(serde_json::to_value(link)?)
        }
        TariffLinkCommand::Show(args) => {
            let link = store
                .get_tariff_link(TariffLinkId(args.id))?
                .ok_or_else(|| anyhow!("tariff link not found: {}", args.id))?;
            emit_json(serde_json::to_value(link)?)
        }
    }
}
