use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;

use docdbx::{Database, QueryOptions};

#[derive(Args)]
pub struct QueryArgs {
    /// Collection to query
    pub collection: String,

    /// Filter document as a JSON literal
    #[arg(default_value = "{}")]
    pub filter: String,

    /// Sort specification as a JSON literal, e.g. '{"age": -1}'
    #[arg(long)]
    pub sort: Option<String>,

    /// Number of matching records to skip
    #[arg(long)]
    pub skip: Option<usize>,

    /// Maximum number of records to return
    #[arg(long)]
    pub limit: Option<usize>,

    /// Comma-separated top-level fields to project
    #[arg(long)]
    pub project: Option<String>,
}

#[derive(Args)]
pub struct InsertArgs {
    /// Collection to insert into
    pub collection: String,

    /// Record as a JSON object literal
    pub record: String,
}

#[derive(Args)]
pub struct UpdateArgs {
    /// Collection to update
    pub collection: String,

    /// Filter document as a JSON literal
    pub filter: String,

    /// Fields to shallow-merge into matching records, as a JSON object
    pub changes: String,
}

#[derive(Args)]
pub struct DeleteArgs {
    /// Collection to delete from
    pub collection: String,

    /// Filter document as a JSON literal
    pub filter: String,
}

#[derive(Args)]
pub struct IndexArgs {
    /// Collection to index
    pub collection: String,

    /// Field to index
    pub field: String,

    /// Drop the index instead of building it
    #[arg(long, default_value_t = false)]
    pub drop: bool,
}

#[derive(Args)]
pub struct AggregateArgs {
    /// Collection to aggregate
    pub collection: String,

    /// Pipeline stages as a JSON array literal
    pub pipeline: String,
}

#[derive(Args)]
pub struct RestoreArgs {
    /// Backup directory containing manifest.json
    pub backup_dir: PathBuf,
}

pub fn query(db: &Database, args: QueryArgs) -> Result<()> {
    let filter = parse_json("filter", &args.filter)?;
    let options = QueryOptions {
        sort: args
            .sort
            .as_deref()
            .map(|raw| {
                parse_json("sort", raw)?.as_object().cloned().ok_or_else(|| {
                    anyhow::anyhow!("sort must be a JSON object of field directions")
                })
            })
            .transpose()?,
        skip: args.skip,
        limit: args.limit,
        projection: args.project.as_deref().map(|fields| {
            fields
                .split(',')
                .map(|field| field.trim().to_string())
                .filter(|field| !field.is_empty())
                .collect()
        }),
    };

    let records = db.query(&args.collection, &filter, &options)?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

pub fn insert(db: &Database, args: InsertArgs) -> Result<()> {
    let record = parse_json("record", &args.record)?;
    db.insert(&args.collection, record)?;
    println!("inserted 1 record into {}", args.collection);
    Ok(())
}

pub fn update(db: &Database, args: UpdateArgs) -> Result<()> {
    let filter = parse_json("filter", &args.filter)?;
    let changes = parse_json("changes", &args.changes)?;
    let modified = db.update(&args.collection, &filter, &changes)?;
    println!("updated {modified} record(s) in {}", args.collection);
    Ok(())
}

pub fn delete(db: &Database, args: DeleteArgs) -> Result<()> {
    let filter = parse_json("filter", &args.filter)?;
    let removed = db.delete(&args.collection, &filter)?;
    println!("deleted {removed} record(s) from {}", args.collection);
    Ok(())
}

pub fn index(db: &Database, args: IndexArgs) -> Result<()> {
    if args.drop {
        db.drop_index(&args.collection, &args.field)?;
        println!("dropped index on {}.{}", args.collection, args.field);
    } else {
        db.build_index(&args.collection, &args.field)?;
        println!("built index on {}.{}", args.collection, args.field);
    }
    Ok(())
}

pub fn aggregate(db: &Database, args: AggregateArgs) -> Result<()> {
    let pipeline = parse_json("pipeline", &args.pipeline)?;
    let results = db.aggregate(&args.collection, &pipeline)?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

pub fn collections(db: &Database) -> Result<()> {
    for name in db.list_collections()? {
        println!("{name}");
    }
    Ok(())
}

pub fn backup(db: &Database) -> Result<()> {
    let target = db.backup()?;
    println!("backup written to {}", target.display());
    Ok(())
}

pub fn restore(db: &Database, args: RestoreArgs) -> Result<()> {
    let manifest = db.restore(&args.backup_dir)?;
    println!(
        "restored {} collection(s) from backup taken {}",
        manifest.collections.len(),
        manifest.timestamp
    );
    Ok(())
}

fn parse_json(label: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{label} is not valid JSON: {raw}"))
}
