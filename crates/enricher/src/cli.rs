use crate::store::{self, SignalSnapshotRow};
use anyhow::Result;
use common::db::AsyncDb;

const DEFAULT_SIGNAL_LIMIT: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Signals { window_hours: Option<u32> },
    Wallet { address: String },
}

/// Pull `--config <path>` out of argv, returning the path and the rest.
pub fn take_config_flag(args: Vec<String>) -> std::result::Result<(Option<String>, Vec<String>), String> {
    let mut path = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        if arg == "--config" {
            path = Some(it.next().ok_or_else(|| "--config requires a path".to_string())?);
        } else if let Some(p) = arg.strip_prefix("--config=") {
            path = Some(p.to_string());
        } else {
            rest.push(arg);
        }
    }
    Ok((path, rest))
}

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "signals" => {
            let window_hours = args
                .next()
                .map(|w| {
                    w.trim_end_matches('h')
                        .parse::<u32>()
                        .map_err(|_| format!("invalid window: {w} (expected hours, e.g. 24)"))
                })
                .transpose()?;
            Ok(Command::Signals { window_hours })
        }
        "wallet" => {
            let address = args
                .next()
                .ok_or_else(|| "usage: enricher wallet <address>".to_string())?;
            Ok(Command::Wallet { address })
        }
        other => Err(format!("unknown command: {other}")),
    }
}

pub async fn run_command(db: &AsyncDb, cmd: Command, windows: &[u32]) -> Result<()> {
    match cmd {
        Command::Run => Ok(()),
        Command::Signals { window_hours } => {
            let selected: Vec<u32> = match window_hours {
                Some(w) => vec![w],
                None => windows.to_vec(),
            };
            for w in selected {
                show_signals(db, w).await?;
            }
            Ok(())
        }
        Command::Wallet { address } => show_wallet(db, &address).await,
    }
}

pub fn format_signal_row(r: &SignalSnapshotRow) -> String {
    let m = &r.metrics;
    format!(
        "{pct:>3}  {conf:>6.3}  {quality:<8}  {side:<4}  ${vol:>12.0}  {cid}  {outcome}",
        pct = m.percentile,
        conf = m.raw_confidence,
        quality = m.signal_quality.as_str(),
        side = m.dominant_side.as_str(),
        vol = r.total_volume,
        cid = r.condition_id,
        outcome = r.outcome,
    )
}

async fn show_signals(db: &AsyncDb, window_hours: u32) -> Result<()> {
    let rows = store::latest_signals(db, window_hours, DEFAULT_SIGNAL_LIMIT).await?;
    println!("Top signals ({window_hours}h window):");
    if rows.is_empty() {
        println!("  (none)");
    }
    for r in &rows {
        println!("{}", format_signal_row(r));
    }
    Ok(())
}

async fn show_wallet(db: &AsyncDb, address: &str) -> Result<()> {
    let address = address.to_lowercase();
    let Some(p) = store::load_wallet_profile(db, address.clone()).await? else {
        println!("Wallet {address} not seen");
        return Ok(());
    };
    println!("Wallet {}", p.address);
    println!("  trades observed:  {}", p.tx_count);
    println!("  trades reported:  {}", p.external_trade_count);
    println!("  activity:         {}", p.activity_level.as_str());
    println!("  fresh:            {}", p.is_fresh);
    println!("  total pnl:        {:.2}", p.total_pnl);
    println!("  win rate:         {:.1}%", p.win_rate * 100.0);
    println!("  max trade value:  {:.2}", p.max_trade_value);
    println!("  smart money:      {}", p.is_smart_money);
    println!("  whale:            {}", p.is_whale);
    Ok(())
}
