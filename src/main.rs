mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use docdbx::{Database, DbConfig};

use crate::commands::{
    AggregateArgs, DeleteArgs, IndexArgs, InsertArgs, QueryArgs, RestoreArgs, UpdateArgs,
};

#[derive(Parser)]
#[command(author, version, about = "docdbx embedded document database")]
struct Cli {
    /// Path to the key=value configuration file
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a filter query against a collection
    Query(QueryArgs),
    /// Insert a JSON record into a collection
    Insert(InsertArgs),
    /// Shallow-merge changes into matching records
    Update(UpdateArgs),
    /// Delete matching records
    Delete(DeleteArgs),
    /// Build or drop an index on a field
    Index(IndexArgs),
    /// Run an aggregation pipeline
    Aggregate(AggregateArgs),
    /// List collections in the database
    Collections,
    /// Snapshot the database into a backup directory
    Backup,
    /// Restore the database from a backup directory
    Restore(RestoreArgs),
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = DbConfig::load(&cli.config)?;
    let db = Database::open(config)?;

    match cli.command {
        Commands::Query(args) => commands::query(&db, args),
        Commands::Insert(args) => commands::insert(&db, args),
        Commands::Update(args) => commands::update(&db, args),
        Commands::Delete(args) => commands::delete(&db, args),
        Commands::Index(args) => commands::index(&db, args),
        Commands::Aggregate(args) => commands::aggregate(&db, args),
        Commands::Collections => commands::collections(&db),
        Commands::Backup => commands::backup(&db),
        Commands::Restore(args) => commands::restore(&db, args),
    }
}

/// Results go to stdout; diagnostics stay on stderr.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
