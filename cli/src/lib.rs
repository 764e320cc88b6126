mod args;

pub use args::{Args, Commands, PollArgs};
use clap::Parser;
use common::poller::{PollOutcome, PollPolicy, poll_until_terminal};
use common::{Database, PaymentStatus, PaymentStatusView, Product, Sale};
use std::time::Duration;

/// Runs the CLI command parser and executes the selected command.
/// Returns true if a CLI command was handled, false otherwise.
pub async fn run_cli() -> bool {
    let args = Args::parse();
    match &args.command {
        Some(Commands::SeedProducts(seed_args)) => {
            match seed_products(&seed_args.file).await {
                Ok(count) => println!("Loaded {} product(s) from {}", count, seed_args.file),
                Err(e) => eprintln!("Failed to load products: {e:#}"),
            }
            true
        }
        Some(Commands::ExpireStale) => {
            match expire_stale().await {
                Ok((stk, manual)) => println!(
                    "Expired {} STK and {} manual/QR payment(s)",
                    stk, manual
                ),
                Err(e) => eprintln!("Failed to expire payments: {e:#}"),
            }
            true
        }
        Some(Commands::ExportSales(export_args)) => {
            match export_sales(&export_args.out).await {
                Ok(count) => println!("Exported {} sale(s) to: {}", count, export_args.out),
                Err(e) => eprintln!("Failed to export sales: {e:#}"),
            }
            true
        }
        Some(Commands::ListPending(list_args)) => {
            if let Err(e) = list_pending(list_args.status.as_deref()).await {
                eprintln!("Failed to list payments: {e:#}");
            }
            true
        }
        Some(Commands::Poll(poll_args)) => {
            match poll_payment(poll_args).await {
                Ok(PollOutcome::Terminal { status, attempts }) => {
                    println!("Payment {} is {} (after {} read(s))", poll_args.id, status, attempts)
                }
                Ok(PollOutcome::TimedOut {
                    attempts,
                    last_status,
                }) => println!(
                    "Gave up after {} read(s); last known status: {}",
                    attempts,
                    last_status.map_or("unknown", PaymentStatus::as_str)
                ),
                Err(e) => eprintln!("Failed to poll payment: {e:#}"),
            }
            true
        }
        None => {
            println!("No CLI command provided. Use --help to see available commands.");
            false
        }
    }
}

async fn connect() -> anyhow::Result<Database> {
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL not set"))?;
    Database::new(&database_url).await
}

async fn seed_products(path: &str) -> anyhow::Result<usize> {
    let products = Product::from_yaml_file(path).await?;
    let db = connect().await?;
    let now = chrono::Utc::now().naive_utc();
    for product in &products {
        let saved = db.upsert_product(product, now).await?;
        log::debug!("Saved product id={} sku={}", saved.id, saved.sku);
    }
    Ok(products.len())
}

async fn expire_stale() -> anyhow::Result<(u64, u64)> {
    let now = chrono::Utc::now().naive_utc();
    connect().await?.expire_overdue_payments(now).await
}

async fn export_sales(out: &str) -> anyhow::Result<usize> {
    let db = connect().await?;
    Sale::export_csv(&db, out).await
}

async fn list_pending(status: Option<&str>) -> anyhow::Result<()> {
    let status = status.map(str::parse::<PaymentStatus>).transpose()?;
    let db = connect().await?;
    let transactions = db.get_pending_transactions(status).await?;
    if transactions.is_empty() {
        println!("No payments found.");
        return Ok(());
    }
    for tx in transactions {
        println!(
            "{}  {:<22} {:>8}  {}  expires {}  receipt {}",
            tx.id,
            tx.status.as_str(),
            tx.amount,
            tx.phone,
            tx.expires_at,
            tx.receipt_number.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn status_url(args: &PollArgs) -> anyhow::Result<String> {
    let base = args.server.trim_end_matches('/');
    match args.channel.as_str() {
        "stk" => Ok(format!(
            "{}/payments/stk/{}?refresh={}",
            base, args.id, args.refresh
        )),
        "manual" | "qr" => Ok(format!("{}/payments/{}/{}", base, args.channel, args.id)),
        other => Err(anyhow::anyhow!(
            "Unknown channel '{}'. Expected stk, manual or qr",
            other
        )),
    }
}

async fn poll_payment(args: &PollArgs) -> anyhow::Result<PollOutcome> {
    let url = status_url(args)?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let policy = PollPolicy {
        max_attempts: args.max_attempts.max(1),
        initial_delay: Duration::from_millis(args.initial_delay_ms),
        ..PollPolicy::default()
    };

    let outcome = poll_until_terminal(&policy, |_attempt| {
        let client = client.clone();
        let url = url.clone();
        async move {
            let view = client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json::<PaymentStatusView>()
                .await?;
            Ok::<_, anyhow::Error>(view.status)
        }
    })
    .await;
    Ok(outcome)
}
