use chrono::{DateTime, NaiveDate, NaiveDateTime};
use clap::{Args, Parser, Subcommand, ValueEnum};
use csv::ReaderBuilder;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransactionType {
    Receive,
    Convert,
    Send,
}

/// A single row of the export's transaction table, as written by Coinbase.
/// Everything is read as a string and converted afterwards so that parse
/// failures can name the row and field.
#[derive(Debug, Clone, Deserialize)]
struct RawRow {
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "Transaction Type")]
    transaction_type: String,
    #[serde(rename = "Asset")]
    asset: String,
    #[serde(rename = "Quantity Transacted")]
    quantity: String,
    #[serde(rename = "ZAR Spot Price at Transaction")]
    spot_price: String,
    #[serde(rename = "Notes", default)]
    notes: String,
}

/// A normalized transaction. Quantity is stored positive; direction is
/// carried by the type. `Convert` only exists between parsing and splitting.
#[derive(Debug, Clone)]
struct Transaction {
    timestamp: NaiveDateTime,
    transaction_type: TransactionType,
    asset: String,
    quantity: Decimal,
    spot_price: Decimal,
    notes: String,
}

#[derive(Debug, Error)]
enum LedgerError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed transaction table: {0}")]
    Csv(#[from] csv::Error),
    #[error("no line starting with \"Transactions\" found in {path:?}")]
    MissingPreamble { path: PathBuf },
    #[error("row {row}: cannot parse {field} from {value:?}")]
    RecordParse {
        row: usize,
        field: &'static str,
        value: String,
    },
    #[error("row {row}: unknown transaction type {value:?}")]
    UnknownTransactionType { row: usize, value: String },
    #[error("malformed conversion note for {asset}: {notes:?}")]
    MalformedConversionNote { asset: String, notes: String },
}

#[derive(Debug, Parser)]
#[command(name = "coinbase-gains", version)]
#[command(about = "Capital gains and balance reports over a Coinbase ZAR transaction export")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Total transacted value (spot price x quantity) across the ledger
    Sum {
        /// Path to the Coinbase CSV export
        file: PathBuf,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Per-asset realized capital gains, last-observed-price method
    Cg {
        /// Path to the Coinbase CSV export
        file: PathBuf,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Per-asset balance valued at the last-seen spot price
    View {
        /// Path to the Coinbase CSV export
        file: PathBuf,
        #[command(flatten)]
        filters: FilterArgs,
    },
}

#[derive(Debug, Args)]
struct FilterArgs {
    /// Keep only rows of this type, matched before conversion splitting
    #[arg(long = "type", value_enum)]
    transaction_type: Option<TransactionType>,

    /// Keep only rows for this asset symbol
    #[arg(long)]
    asset: Option<String>,

    /// Keep only rows dated on or before this day (YYYY-MM-DD, inclusive)
    #[arg(long)]
    end_date: Option<NaiveDate>,
}

fn parse_time(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.naive_utc());
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(t);
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok()
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    Decimal::from_str(s.trim()).ok()
}

fn parse_transaction_type(s: &str) -> Option<TransactionType> {
    match s.trim() {
        "Receive" => Some(TransactionType::Receive),
        "Convert" => Some(TransactionType::Convert),
        "Send" => Some(TransactionType::Send),
        _ => None,
    }
}

fn q2(x: Decimal) -> Decimal {
    x.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

impl RawRow {
    fn into_transaction(self, row: usize) -> Result<Transaction, LedgerError> {
        let timestamp = parse_time(&self.timestamp).ok_or_else(|| LedgerError::RecordParse {
            row,
            field: "Timestamp",
            value: self.timestamp.clone(),
        })?;
        let transaction_type = parse_transaction_type(&self.transaction_type).ok_or_else(|| {
            LedgerError::UnknownTransactionType {
                row,
                value: self.transaction_type.clone(),
            }
        })?;
        let quantity = parse_decimal(&self.quantity).ok_or_else(|| LedgerError::RecordParse {
            row,
            field: "Quantity Transacted",
            value: self.quantity.clone(),
        })?;
        let spot_price = parse_decimal(&self.spot_price).ok_or_else(|| LedgerError::RecordParse {
            row,
            field: "ZAR Spot Price at Transaction",
            value: self.spot_price.clone(),
        })?;

        Ok(Transaction {
            timestamp,
            transaction_type,
            asset: self.asset.trim().to_string(),
            quantity,
            spot_price,
            notes: self.notes,
        })
    }
}

/// Loads the transaction table from a Coinbase export. The export opens with
/// a free-text preamble; the table starts after a marker line beginning with
/// "Transactions" and the two account-detail lines that follow it.
fn read_transactions(path: &Path) -> Result<Vec<Transaction>, LedgerError> {
    let content = fs::read_to_string(path).map_err(|source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut lines = content.lines();
    loop {
        match lines.next() {
            Some(line) if line.starts_with("Transactions") => break,
            Some(_) => continue,
            None => {
                return Err(LedgerError::MissingPreamble {
                    path: path.to_path_buf(),
                });
            }
        }
    }
    lines.next();
    lines.next();

    let body = lines.collect::<Vec<_>>().join("\n");
    let mut rdr = ReaderBuilder::new()
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut out = Vec::new();
    for (i, row) in rdr.deserialize::<RawRow>().enumerate() {
        let row = row?;
        out.push(row.into_transaction(i + 1)?);
    }
    Ok(out)
}

/// Parses the destination leg out of a conversion note of the form
/// `Converted <qty> <asset> to <dest_qty> <dest_asset>`. The textual source
/// quantity is not checked against the record's quantity, since the export's
/// display formatting is not guaranteed to round-trip.
fn parse_conversion_note(asset: &str, notes: &str) -> Option<(Decimal, String)> {
    let tokens: Vec<&str> = notes.split_whitespace().collect();
    if tokens.len() != 6 || tokens[0] != "Converted" || tokens[3] != "to" || tokens[2] != asset {
        return None;
    }
    let dest_quantity = Decimal::from_str(tokens[4]).ok()?;
    if dest_quantity <= dec!(0) {
        return None;
    }
    Some((dest_quantity, tokens[5].to_string()))
}

/// Expands a `Convert` record into a disposal of the source asset and an
/// acquisition of the destination asset. The destination spot price is
/// derived so both halves carry the same transacted value. Non-`Convert`
/// records pass through unchanged.
fn split_conversion(tx: &Transaction) -> Result<Vec<Transaction>, LedgerError> {
    if tx.transaction_type != TransactionType::Convert {
        return Ok(vec![tx.clone()]);
    }

    let (dest_quantity, dest_asset) =
        parse_conversion_note(&tx.asset, &tx.notes).ok_or_else(|| {
            LedgerError::MalformedConversionNote {
                asset: tx.asset.clone(),
                notes: tx.notes.clone(),
            }
        })?;

    let value_transacted = tx.spot_price * tx.quantity;
    let send = Transaction {
        transaction_type: TransactionType::Send,
        ..tx.clone()
    };
    let receive = Transaction {
        timestamp: tx.timestamp,
        transaction_type: TransactionType::Receive,
        asset: dest_asset,
        quantity: dest_quantity,
        spot_price: value_transacted / dest_quantity,
        notes: tx.notes.clone(),
    };
    Ok(vec![send, receive])
}

fn filter_end_date(txns: Vec<Transaction>, end_date: Option<NaiveDate>) -> Vec<Transaction> {
    match end_date {
        Some(end) => txns
            .into_iter()
            .filter(|tx| tx.timestamp.date() <= end)
            .collect(),
        None => txns,
    }
}

fn filter_type(
    txns: Vec<Transaction>,
    transaction_type: Option<TransactionType>,
) -> Vec<Transaction> {
    match transaction_type {
        Some(t) => txns
            .into_iter()
            .filter(|tx| tx.transaction_type == t)
            .collect(),
        None => txns,
    }
}

fn filter_asset(txns: Vec<Transaction>, asset: Option<&str>) -> Vec<Transaction> {
    match asset {
        Some(a) => txns.into_iter().filter(|tx| tx.asset == a).collect(),
        None => txns,
    }
}

/// Builds the canonical ledger: filter, split conversions, then a stable
/// chronological sort. The type filter runs before splitting so that it
/// matches the raw `Convert` rows as they appear in the export.
fn assemble(
    raw: Vec<Transaction>,
    transaction_type: Option<TransactionType>,
    asset: Option<&str>,
    end_date: Option<NaiveDate>,
) -> Result<Vec<Transaction>, LedgerError> {
    let txns = filter_end_date(raw, end_date);
    let txns = filter_type(txns, transaction_type);
    let txns = filter_asset(txns, asset);

    let mut ledger = Vec::with_capacity(txns.len());
    for tx in &txns {
        ledger.extend(split_conversion(tx)?);
    }
    ledger.sort_by_key(|tx| tx.timestamp);
    Ok(ledger)
}

/// Realized gain per asset by the last-observed-price method: the first
/// record for an asset sets the baseline with zero gain, and every later
/// record adds `(spot - last_seen) * quantity`, whatever its direction.
/// This is a price-drift approximation, not cost-basis lot matching.
fn capital_gains(ledger: &[Transaction]) -> HashMap<String, Decimal> {
    let mut gains: HashMap<String, Decimal> = HashMap::new();
    let mut last_price: HashMap<String, Decimal> = HashMap::new();

    for tx in ledger {
        let gain = gains.entry(tx.asset.clone()).or_insert(dec!(0));
        if let Some(prev) = last_price.get(&tx.asset) {
            *gain += (tx.spot_price - *prev) * tx.quantity;
        }
        last_price.insert(tx.asset.clone(), tx.spot_price);
    }
    gains
}

/// Net holdings per asset, marked to the last-seen spot price. A negative
/// balance (sends exceeding recorded receives) is reported as-is.
fn balances(ledger: &[Transaction]) -> HashMap<String, Decimal> {
    let mut net_quantity: HashMap<String, Decimal> = HashMap::new();
    let mut last_price: HashMap<String, Decimal> = HashMap::new();
    let mut balance = HashMap::new();

    for tx in ledger {
        last_price.insert(tx.asset.clone(), tx.spot_price);
        let signed = match tx.transaction_type {
            TransactionType::Receive => tx.quantity,
            // Convert never survives assembly; a stray one counts as an outflow.
            TransactionType::Send | TransactionType::Convert => -tx.quantity,
        };
        let total = net_quantity.entry(tx.asset.clone()).or_insert(dec!(0));
        *total += signed;
        balance.insert(tx.asset.clone(), *total * last_price[&tx.asset]);
    }
    balance
}

fn total_value(ledger: &[Transaction]) -> Decimal {
    ledger.iter().map(|tx| tx.spot_price * tx.quantity).sum()
}

fn load_ledger(path: &Path, filters: &FilterArgs) -> Result<Vec<Transaction>, LedgerError> {
    let raw = read_transactions(path)?;
    info!(rows = raw.len(), "loaded transaction rows");
    let ledger = assemble(
        raw,
        filters.transaction_type,
        filters.asset.as_deref(),
        filters.end_date,
    )?;
    info!(records = ledger.len(), "assembled ledger");
    Ok(ledger)
}

fn print_per_asset(map: &HashMap<String, Decimal>) {
    let mut assets: Vec<_> = map.keys().cloned().collect();
    assets.sort();
    for asset in assets {
        println!("{}: {}", asset, q2(map[&asset]));
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sum { file, filters } => {
            let ledger = load_ledger(&file, &filters)?;
            println!("{}", total_value(&ledger));
        }
        Commands::Cg { file, filters } => {
            let ledger = load_ledger(&file, &filters)?;
            let gains = capital_gains(&ledger);
            print_per_asset(&gains);
            let total: Decimal = gains.values().copied().sum();
            println!("Total Capital Gains: {}", q2(total));
        }
        Commands::View { file, filters } => {
            let ledger = load_ledger(&file, &filters)?;
            print_per_asset(&balances(&ledger));
        }
    }
    Ok(())
}
