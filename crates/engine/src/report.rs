//! Console reports and the four-panel SVG chart for a generator run

use std::fmt::Write as _;

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::agent::{AgentReport, BestStrategy, IterationStatus, IterationSummary};
use crate::runner::BacktestRecord;
use crate::scoring::PortfolioSummary;
use crate::types::EquityPoint;

const RULE: &str = "======================================================================";
const THIN_RULE: &str = "----------------------------------------------------------------------";

/// `1234567.891` → `1,234,567.89`
pub fn format_money(value: Decimal) -> String {
    let rounded = value.round_dp(2);
    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    let text = format!("{:.2}", rounded.abs());
    let (int_part, frac) = text.split_once('.').unwrap_or((text.as_str(), "00"));

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{}{grouped}.{frac}", if negative { "-" } else { "" })
}

pub fn format_run_header(
    description: &str,
    start: NaiveDate,
    end: NaiveDate,
    symbols: usize,
    initial_cash: Decimal,
) -> String {
    format!(
        "{RULE}\nStrategy: {description}\nPeriod: {start} to {end}\nUniverse: {symbols} stocks | Capital: ${initial_cash}/stock\n{RULE}\n"
    )
}

/// Per-iteration console block
pub fn format_iteration(entry: &IterationSummary, max_iterations: u32) -> String {
    let mut out = format!(
        "{RULE}\nITERATION {}/{max_iterations}\n{RULE}\n",
        entry.iteration
    );
    match entry.status {
        IterationStatus::GenerationFailed => out.push_str("Failed to generate strategy\n"),
        IterationStatus::CompileFailed => {
            let first = entry
                .errors
                .first()
                .and_then(|e| e.lines().next())
                .unwrap_or("unknown error");
            let _ = writeln!(out, "Compilation failed: {first}");
        }
        IterationStatus::NoResults => {
            out.push_str("No successful backtests\n");
            if !entry.errors.is_empty() {
                out.push_str("\nExecution errors:\n");
                for err in entry.errors.iter().take(3) {
                    let _ = writeln!(out, "  • {err}");
                }
            }
        }
        IterationStatus::Scored => {
            let s = entry.summary.clone().unwrap_or_default();
            let score = entry.score.unwrap_or_default();
            let _ = writeln!(out, "ITERATION {} RESULTS:", entry.iteration);
            let _ = writeln!(out, "  Trades: {}", s.trades);
            let _ = writeln!(out, "  Profitable: {}/{}", s.profitable, s.total_symbols);
            let _ = writeln!(out, "  Avg Return: {}%", s.avg_return);
            let _ = writeln!(out, "  Avg Sharpe: {}", s.avg_sharpe);
            let _ = writeln!(out, "  Total P&L: ${:.2}", s.total_pnl);
            let _ = writeln!(out, "  Score: {:.2}", score);
            if entry.improved {
                let _ = writeln!(out, "  NEW BEST STRATEGY! (Score: {:.2})", score);
            }
        }
    }
    out
}

pub fn format_symbol_table(records: &[BacktestRecord]) -> String {
    let mut out = format!(
        "{:<14} {:>12} {:>16} {:>10} {:>8} {:>9} {:>7}\n",
        "Symbol", "PnL_$", "Strategy_Return_%", "BuyHold_%", "Sharpe", "Win_Rate", "Trades"
    );
    for r in records {
        let _ = writeln!(
            out,
            "{:<14} {:>12} {:>16} {:>10} {:>8} {:>9} {:>7}",
            r.symbol,
            format!("{:.2}", r.pnl),
            format!("{:.2}", r.strategy_return_pct),
            format!("{:.2}", r.buy_hold_return_pct),
            format!("{:.2}", r.sharpe),
            format!("{:.1}", r.win_rate_pct),
            r.trades
        );
    }
    out
}

/// Closing report: the winning strategy, portfolio totals and the per-symbol table
pub fn format_final_report(report: &AgentReport) -> String {
    let mut out = format!("\n{RULE}\nFINAL BEST STRATEGY\n{RULE}\n");
    let Some(best) = &report.best else {
        out.push_str("Mode: None\n\nNo successful strategy generated\n");
        return out;
    };

    let _ = writeln!(out, "Mode: {}", best.mode.to_string().to_uppercase());
    let _ = writeln!(out, "Name: {} (iteration {}, score {:.2})\n", best.name, best.iteration, best.score);
    let _ = writeln!(out, "{}", best.source);

    let s = &best.summary;
    let _ = writeln!(out, "\n{RULE}\nFINAL PERFORMANCE\n{RULE}\n");
    out.push_str("Portfolio:\n");
    let _ = writeln!(out, "  Initial Capital: ${}", format_money(s.total_start));
    let _ = writeln!(out, "  Final Value: ${}", format_money(s.total_end));
    let _ = writeln!(out, "  Total P&L: ${}", format_money(s.total_pnl));
    let _ = writeln!(out, "  Return: {:.2}%", s.portfolio_return_pct());
    out.push_str("\nStatistics:\n");
    let _ = writeln!(
        out,
        "  Profitable Symbols: {}/{} ({:.1}%)",
        s.profitable,
        s.total_symbols,
        s.success_rate_pct()
    );
    let _ = writeln!(out, "  Total Trades: {}", s.trades);
    let _ = writeln!(out, "  Avg Sharpe: {:.2}", s.avg_sharpe);
    let _ = writeln!(out, "  Avg Win Rate: {:.1}%", s.avg_win_rate);

    let _ = writeln!(out, "\n{THIN_RULE}\nDETAILED RESULTS BY SYMBOL\n{THIN_RULE}");
    out.push_str(&format_symbol_table(&best.run.records));
    out
}

// ============================================================================
// SVG chart
// ============================================================================

const PANEL_W: f64 = 600.0;
const PANEL_H: f64 = 400.0;
const PAD: f64 = 50.0;
const PALETTE: [&str; 8] = [
    "#1f77b4", "#ff7f0e", "#2ca02c", "#d62728", "#9467bd", "#8c564b", "#e377c2", "#17becf",
];

fn f(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Maps values in `[min, max]` onto a panel's plot height
struct YScale {
    min: f64,
    max: f64,
    top: f64,
    bottom: f64,
}

impl YScale {
    fn new(values: impl Iterator<Item = f64>, include_zero: bool, top: f64, bottom: f64) -> Self {
        let (mut min, mut max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
        if !min.is_finite() || !max.is_finite() {
            min = 0.0;
            max = 1.0;
        }
        if include_zero {
            min = min.min(0.0);
            max = max.max(0.0);
        }
        if (max - min).abs() < f64::EPSILON {
            max = min + 1.0;
        }
        Self { min, max, top, bottom }
    }

    fn y(&self, value: f64) -> f64 {
        self.bottom - (value - self.min) / (self.max - self.min) * (self.bottom - self.top)
    }
}

fn panel_frame(out: &mut String, x0: f64, y0: f64, title: &str, y_label: &str) {
    let _ = writeln!(
        out,
        r##"<rect x="{x0:.1}" y="{y0:.1}" width="{PANEL_W:.0}" height="{PANEL_H:.0}" fill="white" stroke="#cccccc"/>"##
    );
    let _ = writeln!(
        out,
        r#"<text x="{:.1}" y="{:.1}" text-anchor="middle" font-weight="bold" font-size="14">{}</text>"#,
        x0 + PANEL_W / 2.0,
        y0 + 22.0,
        escape(title)
    );
    let _ = writeln!(
        out,
        r#"<text x="{:.1}" y="{:.1}" font-size="11" transform="rotate(-90 {:.1} {:.1})" text-anchor="middle">{}</text>"#,
        x0 + 14.0,
        y0 + PANEL_H / 2.0,
        x0 + 14.0,
        y0 + PANEL_H / 2.0,
        escape(y_label)
    );
}

fn zero_line(out: &mut String, x0: f64, scale: &YScale, y_value: f64, dashed: bool) {
    let y = scale.y(y_value);
    let dash = if dashed { r#" stroke-dasharray="6,4""# } else { "" };
    let _ = writeln!(
        out,
        r#"<line x1="{:.1}" y1="{y:.1}" x2="{:.1}" y2="{y:.1}" stroke="black" stroke-width="0.8"{dash}/>"#,
        x0 + PAD,
        x0 + PANEL_W - PAD / 2.0
    );
}

fn symbol_labels(out: &mut String, x0: f64, y0: f64, symbols: &[&str], slot: f64) {
    for (i, sym) in symbols.iter().enumerate() {
        let cx = x0 + PAD + slot * (i as f64 + 0.5);
        let cy = y0 + PANEL_H - PAD / 2.0;
        let _ = writeln!(
            out,
            r#"<text x="{cx:.1}" y="{cy:.1}" font-size="10" text-anchor="end" transform="rotate(-45 {cx:.1} {cy:.1})">{}</text>"#,
            escape(sym)
        );
    }
}

fn pnl_panel(out: &mut String, records: &[BacktestRecord], x0: f64, y0: f64) {
    panel_frame(out, x0, y0, "P&L by Symbol", "PnL ($)");
    let scale = YScale::new(records.iter().map(|r| f(r.pnl)), true, y0 + 40.0, y0 + PANEL_H - PAD);
    let slot = (PANEL_W - 1.5 * PAD) / records.len().max(1) as f64;

    for (i, r) in records.iter().enumerate() {
        let v = f(r.pnl);
        let (top, bottom) = (scale.y(v.max(0.0)), scale.y(v.min(0.0)));
        let color = if r.is_profitable() { "green" } else { "red" };
        let _ = writeln!(
            out,
            r#"<rect x="{:.1}" y="{top:.1}" width="{:.1}" height="{:.1}" fill="{color}" fill-opacity="0.7"/>"#,
            x0 + PAD + slot * i as f64 + slot * 0.15,
            slot * 0.7,
            (bottom - top).max(0.5)
        );
    }
    zero_line(out, x0, &scale, 0.0, false);
    let symbols: Vec<&str> = records.iter().map(|r| r.symbol.as_str()).collect();
    symbol_labels(out, x0, y0, &symbols, slot);
}

fn returns_panel(out: &mut String, records: &[BacktestRecord], x0: f64, y0: f64) {
    panel_frame(out, x0, y0, "Returns Comparison", "Return (%)");
    let values = records
        .iter()
        .flat_map(|r| [f(r.strategy_return_pct), f(r.buy_hold_return_pct)]);
    let scale = YScale::new(values, true, y0 + 40.0, y0 + PANEL_H - PAD);
    let slot = (PANEL_W - 1.5 * PAD) / records.len().max(1) as f64;
    let bar = slot * 0.35;

    for (i, r) in records.iter().enumerate() {
        let left = x0 + PAD + slot * i as f64 + slot * 0.15;
        for (offset, value, color) in [
            (0.0, f(r.strategy_return_pct), "blue"),
            (bar, f(r.buy_hold_return_pct), "orange"),
        ] {
            let (top, bottom) = (scale.y(value.max(0.0)), scale.y(value.min(0.0)));
            let _ = writeln!(
                out,
                r#"<rect x="{:.1}" y="{top:.1}" width="{bar:.1}" height="{:.1}" fill="{color}" fill-opacity="0.8"/>"#,
                left + offset,
                (bottom - top).max(0.5)
            );
        }
    }
    zero_line(out, x0, &scale, 0.0, false);
    let symbols: Vec<&str> = records.iter().map(|r| r.symbol.as_str()).collect();
    symbol_labels(out, x0, y0, &symbols, slot);

    let lx = x0 + PANEL_W - 130.0;
    let _ = writeln!(
        out,
        r#"<rect x="{lx:.1}" y="{:.1}" width="10" height="10" fill="blue"/><text x="{:.1}" y="{:.1}" font-size="10">Strategy</text>"#,
        y0 + 36.0,
        lx + 14.0,
        y0 + 45.0
    );
    let _ = writeln!(
        out,
        r#"<rect x="{lx:.1}" y="{:.1}" width="10" height="10" fill="orange"/><text x="{:.1}" y="{:.1}" font-size="10">Buy &amp; Hold</text>"#,
        y0 + 52.0,
        lx + 14.0,
        y0 + 61.0
    );
}

fn equity_panel(
    out: &mut String,
    curves: &[(&str, &[EquityPoint])],
    initial_cash: Decimal,
    x0: f64,
    y0: f64,
) {
    panel_frame(out, x0, y0, "Equity Curves", "Account Value ($)");
    let values = curves
        .iter()
        .flat_map(|(_, c)| c.iter().map(|p| f(p.equity)))
        .chain(std::iter::once(f(initial_cash)));
    let scale = YScale::new(values, false, y0 + 40.0, y0 + PANEL_H - PAD);

    let t_min = curves.iter().filter_map(|(_, c)| c.first()).map(|p| p.time).min();
    let t_max = curves.iter().filter_map(|(_, c)| c.last()).map(|p| p.time).max();
    let (t_min, t_max) = match (t_min, t_max) {
        (Some(lo), Some(hi)) if hi > lo => (lo as f64, hi as f64),
        _ => (0.0, 1.0),
    };
    let plot_w = PANEL_W - 1.5 * PAD;

    for (i, (symbol, curve)) in curves.iter().enumerate() {
        let color = PALETTE[i % PALETTE.len()];
        let points: Vec<String> = curve
            .iter()
            .map(|p| {
                let x = x0 + PAD + (p.time as f64 - t_min) / (t_max - t_min) * plot_w;
                format!("{:.1},{:.1}", x, scale.y(f(p.equity)))
            })
            .collect();
        let _ = writeln!(
            out,
            r#"<polyline points="{}" fill="none" stroke="{color}" stroke-width="2" stroke-opacity="0.7"/>"#,
            points.join(" ")
        );
        let _ = writeln!(
            out,
            r#"<text x="{:.1}" y="{:.1}" font-size="9" fill="{color}">{}</text>"#,
            x0 + PAD + 6.0,
            y0 + 40.0 + 11.0 * i as f64,
            escape(symbol)
        );
    }
    zero_line(out, x0, &scale, f(initial_cash), true);
}

fn metrics_panel(out: &mut String, summary: &PortfolioSummary, x0: f64, y0: f64) {
    let _ = writeln!(
        out,
        r##"<rect x="{:.1}" y="{:.1}" width="{:.0}" height="{:.0}" rx="12" fill="#add8e6" fill-opacity="0.3"/>"##,
        x0 + 20.0,
        y0 + 20.0,
        PANEL_W - 40.0,
        PANEL_H - 40.0
    );
    let lines = [
        "PORTFOLIO METRICS".to_string(),
        "=".repeat(45),
        String::new(),
        "Capital".to_string(),
        format!("  Initial:              ${:>12}", format_money(summary.total_start)),
        format!("  Final:                ${:>12}", format_money(summary.total_end)),
        format!("  Total P&L:            ${:>12}", format_money(summary.total_pnl)),
        format!("  Portfolio Return:     {:>12.2}%", summary.portfolio_return_pct()),
        String::new(),
        "Performance".to_string(),
        format!("  Avg Strategy Return:  {:>12.2}%", summary.avg_return),
        format!("  Avg Buy & Hold:       {:>12.2}%", summary.avg_buy_hold),
        format!("  Avg Sharpe Ratio:     {:>12.2}", summary.avg_sharpe),
        format!("  Avg Win Rate:         {:>12.1}%", summary.avg_win_rate),
        String::new(),
        "Trading Activity".to_string(),
        format!("  Total Trades:         {:>12}", summary.trades),
        format!(
            "  Profitable Assets:    {:>12}/{}",
            summary.profitable, summary.total_symbols
        ),
        format!("  Success Rate:         {:>12.1}%", summary.success_rate_pct()),
    ];
    for (i, line) in lines.iter().enumerate() {
        let _ = writeln!(
            out,
            r#"<text x="{:.1}" y="{:.1}" font-family="monospace" font-size="12" xml:space="preserve">{}</text>"#,
            x0 + 40.0,
            y0 + 50.0 + 17.0 * i as f64,
            escape(line)
        );
    }
}

/// Render the best strategy's results as a 2×2 SVG figure
pub fn render_chart_svg(best: &BestStrategy, initial_cash: Decimal) -> String {
    let records = &best.run.records;
    let curves: Vec<(&str, &[EquityPoint])> = best
        .run
        .equity_curves
        .iter()
        .map(|(symbol, curve)| (symbol.as_str(), curve.as_slice()))
        .collect();

    let mut out = format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{:.0}" height="{:.0}" font-family="sans-serif">"#,
        PANEL_W * 2.0,
        PANEL_H * 2.0
    );
    out.push('\n');
    pnl_panel(&mut out, records, 0.0, 0.0);
    returns_panel(&mut out, records, PANEL_W, 0.0);
    equity_panel(&mut out, &curves, initial_cash, 0.0, PANEL_H);
    metrics_panel(&mut out, &best.summary, PANEL_W, PANEL_H);
    out.push_str("</svg>\n");
    out
}
