use snet_sdk::{Config, Sdk, StrategyKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: snet-call <org_id> <service_id> <method> <json> \
[--group NAME] [--strategy free|escrow|prepaid] [--count N]";

struct Args {
    org_id: String,
    service_id: String,
    method: String,
    json: String,
    group: String,
    strategy: Option<StrategyKind>,
    count: u64,
}

fn parse_args() -> Result<Args, String> {
    let mut positional = Vec::new();
    let mut group = "default_group".to_string();
    let mut strategy = None;
    let mut count = 1;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--group" => group = args.next().ok_or("--group needs a value")?,
            "--strategy" => {
                let value = args.next().ok_or("--strategy needs a value")?;
                strategy = Some(value.parse::<StrategyKind>().map_err(|e| e.to_string())?);
            }
            "--count" => {
                let value = args.next().ok_or("--count needs a value")?;
                count = value.parse().map_err(|_| format!("invalid --count {value:?}"))?;
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            _ => positional.push(arg),
        }
    }

    let [org_id, service_id, method, json]: [String; 4] = positional
        .try_into()
        .map_err(|_| USAGE.to_string())?;
    Ok(Args {
        org_id,
        service_id,
        method,
        json,
        group,
        strategy,
        count,
    })
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(config, args).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config, args: Args) -> snet_sdk::Result<()> {
    let sdk = Sdk::new(config).await?;
    let client = sdk
        .service_client(&args.org_id, &args.service_id, &args.group)
        .await?;

    match args.strategy {
        Some(StrategyKind::FreeCall) => client.set_free_strategy().await?,
        Some(StrategyKind::Escrow) => client.set_escrow_strategy().await?,
        Some(StrategyKind::Prepaid) => client.set_prepaid_strategy(args.count).await?,
        None => {}
    }

    let reply = client.call_with_json(&args.method, args.json.as_bytes()).await?;
    let pretty = serde_json::from_slice::<serde_json::Value>(&reply)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| String::from_utf8_lossy(&reply).into_owned());
    println!("{pretty}");

    client.close().await;
    Ok(())
}
