//! intrinsiq: Compute intrinsic values for one or more tickers.
//!
//! Usage:
//!   cargo run -p valuation-orchestrator -- INFY.NS
//!   cargo run -p valuation-orchestrator -- --model dcf AAPL MSFT
//!   cargo run -p valuation-orchestrator -- --json --mos 0.30 TCS.NS
//!   cargo run -p valuation-orchestrator -- --trace RELIANCE.NS

use std::time::{Duration, Instant};

use valuation_core::{ModelKind, Ticker};
use valuation_orchestrator::{ValuationRequest, ValuationService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "intrinsiq=info,valuation_orchestrator=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let json_output = args.iter().any(|a| a == "--json");
    let show_trace = args.iter().any(|a| a == "--trace");
    let model = flag_value(&args, "--model");
    let margin_of_safety: f64 = flag_value(&args, "--mos")
        .map(|v| v.parse())
        .transpose()?
        .unwrap_or(0.25);

    let mut tickers: Vec<Ticker> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--json" | "--trace" => {}
            "--model" | "--mos" => i += 1,
            raw if raw.starts_with("--") => anyhow::bail!("unknown flag {}", raw),
            raw => tickers.push(Ticker::parse(raw)?),
        }
        i += 1;
    }
    if tickers.is_empty() {
        anyhow::bail!("no tickers given; try: intrinsiq INFY.NS");
    }

    let service = ValuationService::from_env();
    let request = ValuationRequest {
        margin_of_safety,
        deadline: Some(Instant::now() + Duration::from_secs(120)),
        ..Default::default()
    };

    let mut failed = false;
    for ticker in &tickers {
        let outcome = match model.as_deref() {
            Some("dcf") => service
                .valuate(ticker, ModelKind::Dcf, &request)
                .await
                .map(|r| render_result(&r, json_output)),
            Some("ddm") => service
                .valuate(ticker, ModelKind::Ddm, &request)
                .await
                .map(|r| render_result(&r, json_output)),
            Some(other) => {
                anyhow::bail!("unknown model '{}'; expected dcf or ddm", other);
            }
            None => service
                .fair_value(ticker, &request)
                .await
                .map(|s| render_summary(&s, json_output)),
        };

        match outcome {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => {
                failed = true;
                eprintln!("{ticker}: {e}");
            }
        }

        if show_trace {
            if let Some(trace) = service.last_trace(ticker) {
                for attempt in trace {
                    eprintln!(
                        "  {} -> {:?}{}",
                        attempt.provider_id,
                        attempt.outcome,
                        attempt
                            .detail
                            .map(|d| format!(" ({d})"))
                            .unwrap_or_default()
                    );
                }
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn render_result(result: &valuation_core::ValuationResult, json: bool) -> String {
    if json {
        serde_json::to_string_pretty(result).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    } else {
        format!(
            "{} {}: {:.2} {} (assumptions: {})",
            result.symbol, result.model, result.intrinsic_value, result.currency,
            result.assumptions
        )
    }
}

fn render_summary(summary: &valuation_engine::FairValueSummary, json: bool) -> String {
    if json {
        serde_json::to_string_pretty(summary).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    } else {
        let upside = summary
            .upside_percent
            .map(|u| format!(", upside {:+.1}%", u))
            .unwrap_or_default();
        format!(
            "{}: fair value {:.2} {} (DCF {:?}, DDM {:?}), buy below {:.2}{}",
            summary.symbol,
            summary.fair_value,
            summary.currency,
            summary.dcf_value,
            summary.ddm_value,
            summary.target_price,
            upside
        )
    }
}
