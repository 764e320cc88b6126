use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "M-Pesa POS CLI - catalog, payment maintenance and reports")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load or update products from a YAML file
    SeedProducts(SeedProductsArgs),

    /// Expire every payment that passed its confirmation deadline
    ///
    /// The server does this periodically; this command runs one sweep immediately.
    ExpireStale,

    /// Write all finalized sales to a CSV file
    ExportSales(ExportSalesArgs),

    /// List STK payments, optionally filtered by status
    ListPending(ListPendingArgs),

    /// Poll a running server until a payment reaches a final status
    ///
    /// Uses bounded exponential backoff and gives up after the configured attempts.
    Poll(PollArgs),
}

#[derive(ClapArgs, Debug)]
pub struct SeedProductsArgs {
    /// Path to the products YAML file
    #[arg(short, long, help = "Path to the products YAML file")]
    pub file: String,
}

#[derive(ClapArgs, Debug)]
pub struct ExportSalesArgs {
    /// Output CSV file path
    #[arg(short, long, help = "Output CSV file path")]
    pub out: String,
}

#[derive(ClapArgs, Debug)]
pub struct ListPendingArgs {
    /// created, awaiting_confirmation, confirmed, failed or expired
    #[arg(short, long, help = "Only show payments in this status")]
    pub status: Option<String>,
}

#[derive(ClapArgs, Debug)]
pub struct PollArgs {
    /// Payment id returned when the payment was started
    #[arg(short, long, help = "Payment id")]
    pub id: String,

    /// stk, manual or qr
    #[arg(short, long, default_value = "stk", help = "Payment channel")]
    pub channel: String,

    /// Base URL of the running server
    #[arg(short, long, default_value = "http://127.0.0.1:8080", help = "Server base URL")]
    pub server: String,

    #[arg(long, default_value_t = 10, help = "Give up after this many status reads")]
    pub max_attempts: u32,

    #[arg(long, default_value_t = 2000, help = "Delay before the second read, in milliseconds")]
    pub initial_delay_ms: u64,

    /// Ask the server to query the provider when the callback has not arrived yet
    #[arg(long, help = "Request a provider status query on each read (STK only)")]
    pub refresh: bool,
}
