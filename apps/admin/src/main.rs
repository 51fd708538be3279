//! Thin operator CLI for the instance registry: configure an instance or
//! print its cursor, over a plain `--flag value` argument loop.

use anyhow::{Context, Result, bail};
use alloy_primitives::Address;
use sqlx::postgres::PgPoolOptions;
use std::str::FromStr;
use untron_projection::registry::{ensure_instance, genesis_tip_for};
use untron_projection::store::postgres::PostgresStore;
use untron_projection::{EventStore, InstanceKey, Stream};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1) else {
        print_help();
        return Ok(());
    };

    match command.as_str() {
        "configure-instance" => configure_instance(&args[2..]).await,
        "show-cursor" => show_cursor(&args[2..]).await,
        "genesis-tip" => genesis_tip_cmd(&args[2..]),
        "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => bail!("unknown command: {other}"),
    }
}

fn print_help() {
    println!("untron-projection-admin <command> [flags]");
    println!();
    println!("commands:");
    println!("  configure-instance --stream <pool|forwarder> --chain-id <N> --contract <0xaddr>");
    println!("  show-cursor        --stream <pool|forwarder> --chain-id <N> --contract <0xaddr>");
    println!("  genesis-tip        --stream <pool|forwarder>");
    println!();
    println!("common flags:");
    println!("  --db-url <URL>   Postgres URL (fallback: PROJECTION_DB_URL env)");
}

fn parse_stream_flag(args: &[String]) -> Result<Stream> {
    let mut stream = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--stream" => {
                i += 1;
                let v = args.get(i).context("missing value for --stream")?;
                stream = Some(match v.as_str() {
                    "pool" => Stream::Pool,
                    "forwarder" => Stream::Forwarder,
                    other => bail!("unknown stream '{other}' (expected pool|forwarder)"),
                });
            }
            other => bail!("unknown flag: {other}"),
        }
        i += 1;
    }
    stream.context("missing --stream")
}

/// Prints the genesis tip for a stream type with no chain_id/contract_address
/// and no database connection, since `genesis_tip_for` depends on nothing else.
fn genesis_tip_cmd(args: &[String]) -> Result<()> {
    let stream = parse_stream_flag(args)?;
    let tip = genesis_tip_for(stream.index_name());
    println!("{} genesis_tip = 0x{}", stream.as_str(), hex::encode(tip));
    Ok(())
}

struct InstanceFlags {
    stream: Stream,
    chain_id: u64,
    contract: Address,
    db_url: String,
}

fn parse_instance_flags(args: &[String]) -> Result<InstanceFlags> {
    let mut stream = None;
    let mut chain_id = None;
    let mut contract = None;
    let mut db_url = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--stream" => {
                i += 1;
                let v = args.get(i).context("missing value for --stream")?;
                stream = Some(match v.as_str() {
                    "pool" => Stream::Pool,
                    "forwarder" => Stream::Forwarder,
                    other => bail!("unknown stream '{other}' (expected pool|forwarder)"),
                });
            }
            "--chain-id" => {
                i += 1;
                let v = args.get(i).context("missing value for --chain-id")?;
                chain_id = Some(v.parse::<u64>().context("parse --chain-id")?);
            }
            "--contract" => {
                i += 1;
                let v = args.get(i).context("missing value for --contract")?;
                contract = Some(Address::from_str(v).context("parse --contract")?);
            }
            "--db-url" => {
                i += 1;
                let v = args.get(i).context("missing value for --db-url")?;
                db_url = Some(v.clone());
            }
            other => bail!("unknown flag: {other}"),
        }
        i += 1;
    }

    Ok(InstanceFlags {
        stream: stream.context("missing --stream")?,
        chain_id: chain_id.context("missing --chain-id")?,
        contract: contract.context("missing --contract")?,
        db_url: db_url
            .or_else(|| std::env::var("PROJECTION_DB_URL").ok())
            .context("missing db url: pass --db-url or set PROJECTION_DB_URL")?,
    })
}

async fn configure_instance(args: &[String]) -> Result<()> {
    let flags = parse_instance_flags(args)?;
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&flags.db_url)
        .await
        .context("connect db")?;
    let store = PostgresStore::from_pool(pool);

    let key = InstanceKey::new(flags.stream, flags.chain_id, flags.contract);
    let instance = ensure_instance(&store, key)
        .await
        .context("configure instance")?;

    println!("configured {key}");
    println!("  genesis_tip = 0x{}", hex::encode(instance.genesis_tip));
    Ok(())
}

async fn show_cursor(args: &[String]) -> Result<()> {
    let flags = parse_instance_flags(args)?;
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&flags.db_url)
        .await
        .context("connect db")?;
    let store = PostgresStore::from_pool(pool);

    let key = InstanceKey::new(flags.stream, flags.chain_id, flags.contract);
    let instance = store
        .get_instance(key)
        .await
        .context("load instance")?
        .with_context(|| {
            format!(
                "instance not configured: {key} (run configure-instance first, expected genesis_tip 0x{})",
                hex::encode(genesis_tip_for(key.stream.index_name()))
            )
        })?;

    println!("{key}");
    println!("  genesis_tip = 0x{}", hex::encode(instance.genesis_tip));
    Ok(())
}
