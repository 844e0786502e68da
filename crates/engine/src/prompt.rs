//! Prompt construction for the strategy generator. Pure string building, no I/O.

use crate::scoring::PortfolioSummary;

pub const SYSTEM_PROMPT: &str = r#"You are an elite quantitative trading strategist with expertise in technical analysis, signal processing, and market microstructure. You output a single JSON strategy document with no formatting, comments or text explanation.

STRATEGY DOCUMENT (schema version 1):
{
  "version": 1,
  "name": "<short name>",
  "mode": "long_only" | "long_short",
  "entry_long": "<rule>",
  "exit_long": "<rule>",
  "entry_short": "<rule, required for long_short>",
  "exit_short": "<rule, required for long_short>",
  "stop_loss_pct": <optional number, percent of entry price>,
  "take_profit_pct": <optional number, percent of entry price>,
  "warmup_bars": <optional integer, no entries before this bar>
}

POSITION MODES:
1. long_only: buys and closes longs only. Short rules are ignored.
2. long_short: may also open shorts. entry_short and exit_short are required.
Only one position is open at a time. Entries and signal exits fill at the bar close;
stops and targets fill inside the bar.

RULE LANGUAGE (keywords are case-insensitive):
- Comparisons: CROSS_ABOVE(a, b), CROSS_BELOW(a, b), ABOVE(a, b), BELOW(a, b), BETWEEN(a, low, high)
- Composites: AND(r1, r2, ...), OR(r1, r2, ...), NOT(r)
- Temporal: CONSECUTIVE(r, n) true for the last n bars; ANY_OF(r, n) true at least once in the last n bars
- Operands: open, high, low, close, volume, numbers,
  SMA(n), EMA(n), RSI(n), ATR(n), ROC(n), STDDEV(n), STOCH_K(n), OBV,
  MACD_LINE(fast,slow,signal), MACD_SIGNAL(fast,slow,signal), MACD_HIST(fast,slow,signal),
  BB_UPPER(n,k), BB_MIDDLE(n,k), BB_LOWER(n,k)
- Crossovers compare the current bar with the previous bar. Indicators have no value during
  their warmup, and any comparison with a missing value is false.

CHOOSE THE RIGHT MODE:
- Use long_only for: simple trend following or dip buying
- Use long_short for: strategies that also profit from falling prices

TECHNICAL ANALYSIS PRINCIPLES:
1. Signal Quality: Combine multiple indicators to reduce false signals
2. Trend Alignment: Trade with the prevailing trend
3. Risk Management: Use stop_loss_pct and take_profit_pct
4. Entry Confirmation: Wait for multiple conditions to align
5. Exit Strategy: Clear exit rules, don't just rely on stops

INDICATOR REFERENCE:
- MACD: EMA(12) - EMA(26), Signal: EMA(MACD, 9)
- RSI: Momentum indicator, overbought >70, oversold <30
- ATR: Volatility measure
- Bollinger Bands: Volatility bands for mean reversion
- Volume and OBV: Confirm price movements

You will iteratively analyze results and improve strategies based on:
- Trade frequency (too many/too few signals)
- Win rate (signal quality)
- Risk-adjusted returns (Sharpe ratio)
- Maximum drawdown (risk management)"#;

pub const FEW_SHOT_EXAMPLES: &str = r#"Example 1 - MACD crossover with trend filter (long_only):
{
  "version": 1,
  "name": "MACD trend follower",
  "mode": "long_only",
  "entry_long": "AND(CROSS_ABOVE(MACD_LINE(12,26,9), MACD_SIGNAL(12,26,9)), ABOVE(close, EMA(50)))",
  "exit_long": "CROSS_BELOW(MACD_LINE(12,26,9), MACD_SIGNAL(12,26,9))",
  "stop_loss_pct": 5
}

Example 2 - RSI mean reversion with volatility stop (long_only):
{
  "version": 1,
  "name": "RSI dip buyer",
  "mode": "long_only",
  "entry_long": "AND(CROSS_ABOVE(RSI(14), 30), ABOVE(close, SMA(200)))",
  "exit_long": "OR(ABOVE(RSI(14), 70), CROSS_BELOW(close, SMA(50)))",
  "stop_loss_pct": 4,
  "take_profit_pct": 10
}

Example 3 - Bollinger breakout with volume confirmation (long_only):
{
  "version": 1,
  "name": "Band breakout",
  "mode": "long_only",
  "entry_long": "AND(CROSS_ABOVE(close, BB_UPPER(20,2)), ABOVE(volume, 0), ABOVE(ROC(10), 0))",
  "exit_long": "CROSS_BELOW(close, BB_MIDDLE(20,2))"
}

Example 4 - MACD zero-line with EMA filter, both directions (long_short):
{
  "version": 1,
  "name": "MACD zero cross",
  "mode": "long_short",
  "entry_long": "AND(CROSS_ABOVE(MACD_LINE(12,26,9), 0), ABOVE(close, EMA(50)))",
  "exit_long": "OR(BELOW(MACD_LINE(12,26,9), 0), BELOW(close, EMA(50)))",
  "entry_short": "AND(CROSS_BELOW(MACD_LINE(12,26,9), 0), BELOW(close, EMA(50)))",
  "exit_short": "OR(ABOVE(MACD_LINE(12,26,9), 0), ABOVE(close, EMA(50)))"
}"#;

const ERROR_FIX_GUIDANCE: &str = r#"CRITICAL ERROR FIXES:
- "invalid strategy JSON": output exactly one JSON object, no prose, no code, no markdown
- "missing rule": entry_long and exit_long are always required; long_short also needs entry_short and exit_short
- "parse error at position N": the caret marks the failing character
  * every rule must be one of the listed keywords with balanced parentheses
  * operands are price fields, numbers or the listed indicators only
  * AND/OR need at least two rules; BETWEEN bounds are plain numbers
- "invalid indicator": periods must be at least 1, MACD fast must be below slow
- "invalid stop_loss_pct/take_profit_pct": use a number between 0 and 100
- "insufficient data" or upstream errors: keep the rules, these are data problems

SCHEMA RULES:
- version must be 1
- Use mode long_short only when short rules are provided"#;

const DIAGNOSTIC_RUBRIC: &str = r#"DIAGNOSTIC ANALYSIS:

1. TRADE FREQUENCY DIAGNOSIS:
   - If 0 trades: Entry conditions never triggered
     * Check if crossover direction is inverted
     * Verify indicator parameters are sensible for daily bars
     * Ensure conditions combined with AND can be true at the same time
     * Check warmup_bars is not longer than the data

   - If <5 trades/symbol: Too restrictive
     * Relax confirmation requirements
     * Check if multiple filters are conflicting
     * Consider ANY_OF to widen the entry window

   - If >100 trades/symbol: Too many signals
     * Add trend filters
     * Increase confirmation requirements
     * Use CONSECUTIVE to require persistent conditions

2. PROFITABILITY DIAGNOSIS:
   - If negative returns: Poor signal quality
     * Add trend alignment filter
     * Increase confirmation requirements
     * Improve entry timing (wait for pullbacks)
     * Review stop_loss_pct placement

   - If low win rate (<40%): False signals
     * Combine multiple indicators
     * Use momentum confirmation
     * Add volume filters

3. TECHNICAL FIXES:
   - Review indicator parameters
   - Check crossover direction (current vs previous bar)
   - Verify mode choice (need long_short for shorts?)
   - Check exits can actually trigger after entries"#;

/// Everything a prompt can depend on
#[derive(Debug, Clone, Default)]
pub struct PromptContext<'a> {
    pub description: &'a str,
    pub iteration: u32,
    /// Source of the best strategy so far
    pub previous_source: Option<&'a str>,
    pub previous_summary: Option<&'a PortfolioSummary>,
    /// Verbatim errors from the previous iteration
    pub previous_errors: &'a [String],
}

pub fn build_prompt(ctx: &PromptContext<'_>) -> String {
    match ctx.previous_source {
        Some(source) if ctx.iteration > 1 => improvement_prompt(ctx, source),
        _ => {
            let mut prompt = design_prompt(ctx.description);
            if ctx.iteration > 1 {
                prompt.push_str(&error_block(ctx.previous_errors));
            }
            prompt
        }
    }
}

fn design_prompt(description: &str) -> String {
    format!(
        r#"Design a robust trading strategy for: "{description}"

ANALYSIS PHASE:
1. Identify entry signals (what conditions trigger a buy/sell?)
2. Identify exit signals (when to close positions?)
3. Determine if short-selling is needed (choose mode accordingly)
4. Select appropriate indicators
5. Define risk management (stop loss, take profit)

TECHNICAL DESIGN:
- Break down the strategy into clear logical components
- Use multiple indicator confirmations to avoid false signals
- Consider trend filters for better signal quality
- Use CROSS_ABOVE/CROSS_BELOW for crossover detection
- Set warmup_bars when long indicators need history

FEW-SHOT EXAMPLES:
{FEW_SHOT_EXAMPLES}

IMPLEMENTATION:
Generate one complete strategy document. Think step-by-step:
1. Which mode is best suited? (long_only or long_short?)
2. What indicators are needed?
3. How to detect crossovers/signals correctly?
4. What confirmations improve signal quality?

Output: A single JSON strategy document following the examples. You must not generate any text, your output should be directly the JSON. No formatting strictly."#
    )
}

fn error_block(errors: &[String]) -> String {
    if errors.is_empty() {
        return String::new();
    }
    format!(
        "\n\nEXECUTION ERRORS FROM PREVIOUS ITERATION:\n{}\n\n{ERROR_FIX_GUIDANCE}\n",
        errors.join("\n")
    )
}

fn improvement_prompt(ctx: &PromptContext<'_>, source: &str) -> String {
    let default_summary = PortfolioSummary::default();
    let s = ctx.previous_summary.unwrap_or(&default_summary);
    format!(
        r#"ITERATION {iteration}: Analyze and improve the strategy.

ORIGINAL GOAL: {goal}

PREVIOUS STRATEGY:
```json
{source}
```

BACKTEST RESULTS:
- Total Trades: {trades}
- Profitable Symbols: {profitable}/{total}
- Avg Return: {avg_return}%
- Avg Sharpe: {avg_sharpe}
- Avg Win Rate: {avg_win_rate}%
{errors}

FEW-SHOT EXAMPLES:
{FEW_SHOT_EXAMPLES}

{DIAGNOSTIC_RUBRIC}

IMPROVEMENT STRATEGY:
Based on the diagnosis above, generate an IMPROVED strategy document that addresses the specific issues.
Consider switching mode if the current approach has limitations.
Add more sophisticated filters and confirmations.

Output: The enhanced JSON strategy document. No explanation, just the JSON. No formatting. "#,
        iteration = ctx.iteration,
        goal = ctx.description,
        trades = s.trades,
        profitable = s.profitable,
        total = s.total_symbols,
        avg_return = s.avg_return,
        avg_sharpe = s.avg_sharpe,
        avg_win_rate = s.avg_win_rate,
        errors = error_block(ctx.previous_errors),
    )
}
