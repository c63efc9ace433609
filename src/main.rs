use bizdash::api::{ApiClient, DashboardClient};
use bizdash::cache::{BatchResult, CacheLayer, CacheResult, TransportError};
use bizdash::config::Config;
use bizdash::logging;
use bizdash::resources::{ListFilter, ResourceKind};
use clap::{Parser, Subcommand};
use color_eyre::Result;
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bizdash")]
#[command(about = "Command-line client for the business dashboard API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/bizdash/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List resources of a kind
  List {
    kind: ResourceKind,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    page: Option<u32>,
    #[arg(long)]
    per_page: Option<u32>,
  },
  /// Show one resource
  Show { kind: ResourceKind, id: u64 },
  /// Aggregate totals for a kind
  Stats { kind: ResourceKind },
  /// Delete one or more resources
  Delete {
    kind: ResourceKind,
    #[arg(required = true)]
    ids: Vec<u64>,
  },
  /// Set the status of one or more resources
  UpdateStatus {
    kind: ResourceKind,
    status: String,
    #[arg(required = true)]
    ids: Vec<u64>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let api = ApiClient::new(&config.api, Config::get_api_token())?;
  let cache = CacheLayer::new(config.cache.layer_config());
  let janitor = cache.spawn_janitor(config.cache.gc_interval());
  let client = DashboardClient::new(api, cache, config.cache.clone());

  let output = run(&client, args.command).await;
  janitor.abort();

  println!("{}", serde_json::to_string_pretty(&output?)?);
  Ok(())
}

async fn run(client: &DashboardClient<ApiClient>, command: Command) -> Result<Value> {
  let output = match command {
    Command::List {
      kind,
      status,
      search,
      page,
      per_page,
    } => {
      let filter = ListFilter {
        status,
        search,
        page,
        per_page,
        ..ListFilter::default()
      };
      read_output(client.list(kind, &filter).await?)
    }
    Command::Show { kind, id } => read_output(client.detail(kind, id).await?),
    Command::Stats { kind } => read_output(client.stats(kind).await?),
    Command::Delete { kind, ids } => {
      if let [id] = ids.as_slice() {
        client.delete(kind, *id).await?;
        json!({ "deleted": id })
      } else {
        batch_output(&client.bulk_delete(kind, ids).await)
      }
    }
    Command::UpdateStatus { kind, status, ids } => {
      let changes = json!({ "status": status });
      if let [id] = ids.as_slice() {
        client.update(kind, *id, changes).await?
      } else {
        batch_output(&client.bulk_update(kind, ids, changes).await)
      }
    }
  };
  Ok(output)
}

fn read_output(result: CacheResult<Value>) -> Value {
  json!({
    "source": format!("{:?}", result.source),
    "cached_at": result.cached_at,
    "data": result.data,
  })
}

fn batch_output(result: &BatchResult<u64, Value, TransportError>) -> Value {
  json!({
    "outcome": format!("{:?}", result.outcome()),
    "succeeded": result.succeeded.iter().map(|s| s.item).collect::<Vec<_>>(),
    "failed": result
      .failed
      .iter()
      .map(|f| json!({ "id": f.item, "error": f.error.to_string() }))
      .collect::<Vec<_>>(),
  })
}
