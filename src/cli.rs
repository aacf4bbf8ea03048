use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::signal;
use tokio::time::sleep;

use crate::domain::{normalize_symbol, Priority, Quote, TickerRecord};
use crate::error::Result;
use crate::services::{Hub, UpdateKind};

#[derive(Parser)]
#[command(name = "tickerhub")]
#[command(version)]
#[command(about = "Shared market-data cache and streaming coordinator", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory (default.toml, then $TICKERHUB_ENV)
    #[arg(short, long, default_value = "config", env = "TICKERHUB_CONFIG_DIR")]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch quotes for one or more symbols
    Quote {
        #[arg(required = true)]
        symbols: Vec<String>,
        /// Scheduling priority (high, medium, low)
        #[arg(short, long, default_value = "high")]
        priority: Priority,
    },
    /// Fetch a company profile
    Profile { symbol: String },
    /// Print updates for symbols as they arrive
    Watch {
        #[arg(required = true)]
        symbols: Vec<String>,
        /// Also subscribe to live trades
        #[arg(short, long)]
        stream: bool,
        /// Stop after this many seconds (runs until Ctrl+C otherwise)
        #[arg(short, long)]
        duration_secs: Option<u64>,
    },
    /// Show market session and connection status
    Status,
}

pub async fn show_quotes(hub: &Hub, symbols: &[String], priority: Priority) -> Result<()> {
    let requests = symbols.iter().map(|s| hub.request_quote(s, priority));
    let quotes = futures_util::future::join_all(requests).await;

    println!("{:<8} {:>12} {:>10} {:>9}", "SYMBOL", "PRICE", "CHANGE", "CHG%");
    for (symbol, quote) in symbols.iter().zip(quotes) {
        match quote {
            Some(q) => println!("{}", format_quote(&q)),
            None => println!("{:<8} {:>12}", normalize_symbol(symbol), "unavailable"),
        }
    }
    Ok(())
}

pub async fn show_profile(hub: &Hub, symbol: &str) -> Result<()> {
    let Some(p) = hub.request_profile(symbol, Priority::High).await else {
        println!("{}: profile unavailable", normalize_symbol(symbol));
        return Ok(());
    };

    println!("{} ({})", p.name, p.symbol);
    let rows = [
        ("Exchange", p.exchange.clone()),
        ("Industry", p.industry.clone()),
        ("Country", p.country.clone()),
        ("Currency", p.currency.clone()),
        ("Website", p.website.clone()),
        ("Market cap (M)", p.market_cap.map(|m| format!("{:.0}", m))),
    ];
    for (label, value) in rows {
        if let Some(value) = value {
            println!("  {:<15} {}", label, value);
        }
    }
    Ok(())
}

pub async fn watch(hub: &Hub, symbols: &[String], stream: bool, duration: Option<Duration>) -> Result<()> {
    let mut sub = hub.subscribe(symbols);
    hub.prefetch(symbols, Priority::Medium);
    if stream {
        hub.stream_subscribe(symbols);
    }

    let deadline = sleep(duration.unwrap_or(Duration::MAX));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            update = sub.recv() => {
                let Some(update) = update else { break };
                let tag = match update.kind {
                    UpdateKind::Snapshot => "cached",
                    UpdateKind::Quote => "quote",
                    UpdateKind::Profile => "profile",
                    UpdateKind::Tick => "tick",
                };
                println!("[{:<7}] {}", tag, format_record(&update.record));
            }
            _ = &mut deadline => break,
            _ = signal::ctrl_c() => break,
        }
    }

    if stream {
        hub.stream_unsubscribe(symbols);
    }
    sub.unsubscribe();
    Ok(())
}

pub async fn show_status(hub: &Hub) -> Result<()> {
    match hub.market_status().await {
        Some(s) => {
            let session = s.session.as_deref().unwrap_or("-");
            println!(
                "{}: {} (session: {})",
                s.exchange,
                if s.is_open { "OPEN" } else { "CLOSED" },
                session
            );
            if let Some(holiday) = s.holiday {
                println!("  holiday: {}", holiday);
            }
        }
        None => println!("market status unavailable"),
    }
    println!("stream: {}", hub.connection_state());
    println!("queue: {} pending, {} in flight", hub.pending(), hub.in_flight());
    Ok(())
}

fn format_quote(q: &Quote) -> String {
    format!(
        "{:<8} {:>12} {:>10} {:>8}%",
        q.symbol,
        q.price.round_dp(2),
        signed(q.change.round_dp(2)),
        signed(q.change_percent.round_dp(2)),
    )
}

fn format_record(r: &TickerRecord) -> String {
    match &r.quote {
        Some(q) => format!("{} {}", format_quote(q), r.display_name()),
        None => format!("{:<8} {}", r.symbol, r.display_name()),
    }
}

fn signed(d: Decimal) -> String {
    if d.is_sign_negative() {
        d.to_string()
    } else {
        format!("+{}", d)
    }
}
