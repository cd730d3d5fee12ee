use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use dualkey_core::materials::DATA_KEY_LEN;
use dualkey_core::{Action, CustodyConfig, RedundantFetcher};
use dualkey_dev::DevKeyStore;
use std::path::PathBuf;
use std::process;
use tokio::net::TcpListener;

mod telemetry;

#[derive(Parser)]
#[command(
    name = "dualkey",
    version,
    about = "Fetch, wrap and unwrap keys through two redundant key-custody endpoints"
)]
struct Cli {
    /// Config file (TOML, or JSON with a .json extension). DUALKEY_* variables override it.
    #[arg(long, global = true, env = "DUALKEY_CONFIG")]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Race a getKey request across both endpoints and print the key
    GetKey,
    /// Wrap a 32-byte key (random if omitted) and print the token
    Wrap(WrapArgs),
    /// Resolve a token back into its key
    Unwrap(UnwrapArgs),
    /// Run a development key store
    ServeDev(ServeDevArgs),
}

#[derive(Args)]
struct WrapArgs {
    /// Key to wrap, hex encoded
    #[arg(long)]
    key_hex: Option<String>,
}

#[derive(Args)]
struct UnwrapArgs {
    /// Token produced by `wrap`, hex encoded
    #[arg(long)]
    token_hex: String,
}

#[derive(Args)]
struct ServeDevArgs {
    #[arg(long, default_value = "127.0.0.1:6123")]
    bind: String,
    /// Comma separated store ids to host
    #[arg(long, default_value = "40,41", value_delimiter = ',')]
    stores: Vec<u8>,
    /// Seed for slot key derivation
    #[arg(long, env = "DUALKEY_DEV_SEED", default_value = "")]
    seed: String,
}

#[tokio::main]
async fn main() {
    if let Err(err) = real_main().await {
        eprintln!("dualkey: {err:#}");
        process::exit(1);
    }
}

async fn real_main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_json)?;

    match cli.command {
        Command::GetKey => {
            let fetcher = fetcher(cli.config.as_ref())?;
            let key = fetcher.race_fetch(Action::GetKey, &[]).await?;
            println!("{}", hex::encode(key));
        }
        Command::Wrap(args) => {
            let key = match args.key_hex {
                Some(value) => decode_hex("key", &value)?,
                None => random_key(),
            };
            if key.len() != DATA_KEY_LEN {
                bail!("key must be {DATA_KEY_LEN} bytes, got {}", key.len());
            }
            let fetcher = fetcher(cli.config.as_ref())?;
            let token = fetcher.race_fetch(Action::WrapKey, &key).await?;
            println!("key   {}", hex::encode(&key));
            println!("token {}", hex::encode(token));
        }
        Command::Unwrap(args) => {
            let token = decode_hex("token", &args.token_hex)?;
            let fetcher = fetcher(cli.config.as_ref())?;
            let key = fetcher.race_fetch(Action::UnwrapKey, &token).await?;
            println!("{}", hex::encode(key));
        }
        Command::ServeDev(args) => {
            let listener = TcpListener::bind(&args.bind)
                .await
                .with_context(|| format!("failed to bind {}", args.bind))?;
            eprintln!("development key store listening on {}", args.bind);
            DevKeyStore::new(args.seed.as_bytes(), args.stores)
                .serve(listener)
                .await?;
        }
    }
    Ok(())
}

fn fetcher(path: Option<&PathBuf>) -> Result<RedundantFetcher> {
    let config = match path {
        Some(path) => CustodyConfig::load(path),
        None => CustodyConfig::from_env(),
    }
    .context("failed to load key-custody configuration")?;
    Ok(config.fetcher())
}

fn decode_hex(what: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value.trim()).with_context(|| format!("{what} is not valid hex"))
}

fn random_key() -> Vec<u8> {
    use rand::RngCore;
    let mut key = vec![0u8; DATA_KEY_LEN];
    rand::rng().fill_bytes(&mut key);
    key
}
