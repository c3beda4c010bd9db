use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use contact_kernel_api::{ContactKernelApi, IdentifyRequest};
use contact_kernel_core::ContactId;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ck")]
#[command(about = "Contact Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./contact_kernel.sqlite3")]
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
    phone: Option<i64>,
}

#[derive(Debug, Subcommand)]
enum ContactCommand {
    List,
    Count,
    Delete(ContactDeleteArgs),
}

#[derive(Debug, Args)]
struct ContactDeleteArgs {
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

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = ContactKernelApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(&command, &api),
        Command::Identify(args) => run_identify(args, &api),
        Command::Contact { command } => run_contact(&command, &api),
    }
}

fn run_db(command: &DbCommand, api: &ContactKernelApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(result)?)
        }
    }
}

fn run_identify(args: IdentifyArgs, api: &ContactKernelApi) -> Result<()> {
    let response =
        api.identify(IdentifyRequest { email: args.email, phone_number: args.phone })?;
    emit_json(serde_json::to_value(response)?)
}

fn run_contact(command: &ContactCommand, api: &ContactKernelApi) -> Result<()> {
    match command {
        ContactCommand::List => {
            let contacts = api.list_contacts()?;
            emit_json(serde_json::json!({ "contacts": contacts }))
        }
        ContactCommand::Count => {
            let active_contacts = api.contact_count()?;
            emit_json(serde_json::json!({ "active_contacts": active_contacts }))
        }
        ContactCommand::Delete(args) => {
            let result = api.delete_contact(ContactId(args.id))?;
            emit_json(serde_json::to_value(result)?)
        }
    }
}
