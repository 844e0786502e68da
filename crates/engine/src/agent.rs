//! Iterative strategy generator: Generate → Compile → Backtest → Score, keeping the best
//!
//! The loop state is a value. Each iteration produces an [`IterationOutcome`] and
//! [`AgentState::apply`] folds it into the next state; all I/O lives in [`run_agent`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::{CompletionClient, MarketDataProvider};
use crate::completion::generate_strategy;
use crate::prompt::PromptContext;
use crate::runner::{run_universe, UniverseRun};
use crate::scoring::{score, PortfolioSummary};
use crate::settings::AgentSettings;
use crate::strategy::{compile, render_compile_error, CompiledStrategy, PositionMode};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    #[default]
    Generate,
    Compile,
    Backtest,
    Score,
    Done,
}

/// What one iteration produced
#[derive(Debug, Clone)]
pub enum IterationOutcome {
    GenerationFailed,
    CompileFailed {
        source: String,
        error_text: String,
    },
    /// Compiled, but no symbol produced a backtest
    NoResults { errors: Vec<String> },
    Backtested {
        strategy: Box<CompiledStrategy>,
        run: UniverseRun,
        summary: PortfolioSummary,
        score: Decimal,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    GenerationFailed,
    CompileFailed,
    NoResults,
    Scored,
}

/// One line of iteration history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: u32,
    pub status: IterationStatus,
    pub summary: Option<PortfolioSummary>,
    pub score: Option<Decimal>,
    pub improved: bool,
    pub errors: Vec<String>,
}

/// The retained best strategy and everything needed to report on it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestStrategy {
    pub iteration: u32,
    pub name: String,
    pub mode: PositionMode,
    pub source: String,
    pub fingerprint: String,
    pub summary: PortfolioSummary,
    pub score: Decimal,
    pub run: UniverseRun,
}

#[derive(Debug, Clone)]
pub struct AgentState {
    pub phase: AgentPhase,
    /// Completed iterations
    pub iteration: u32,
    pub max_iterations: u32,
    pub best: Option<BestStrategy>,
    /// Errors from the most recent iteration that reported any
    pub last_errors: Vec<String>,
    pub history: Vec<IterationSummary>,
}

impl AgentState {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            phase: if max_iterations == 0 {
                AgentPhase::Done
            } else {
                AgentPhase::Generate
            },
            iteration: 0,
            max_iterations,
            best: None,
            last_errors: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == AgentPhase::Done
    }

    /// Prompt inputs for the next iteration
    pub fn prompt_context<'a>(&'a self, description: &'a str) -> PromptContext<'a> {
        PromptContext {
            description,
            iteration: self.iteration + 1,
            previous_source: self.best.as_ref().map(|b| b.source.as_str()),
            previous_summary: self.best.as_ref().map(|b| &b.summary),
            previous_errors: &self.last_errors,
        }
    }

    /// Fold one iteration's outcome into the next state
    pub fn apply(mut self, outcome: IterationOutcome) -> Self {
        let iteration = self.iteration + 1;
        let entry = match outcome {
            IterationOutcome::GenerationFailed => IterationSummary {
                iteration,
                status: IterationStatus::GenerationFailed,
                summary: None,
                score: None,
                improved: false,
                errors: Vec::new(),
            },
            IterationOutcome::CompileFailed { error_text, .. } => {
                self.last_errors = vec![error_text.clone()];
                IterationSummary {
                    iteration,
                    status: IterationStatus::CompileFailed,
                    summary: None,
                    score: None,
                    improved: false,
                    errors: vec![error_text],
                }
            }
            IterationOutcome::NoResults { errors } => {
                self.last_errors = errors.clone();
                IterationSummary {
                    iteration,
                    status: IterationStatus::NoResults,
                    summary: None,
                    score: None,
                    improved: false,
                    errors,
                }
            }
            IterationOutcome::Backtested {
                strategy,
                run,
                summary,
                score,
            } => {
                self.last_errors = run.errors.clone();
                let improved = self.best.as_ref().map_or(true, |b| score > b.score);
                let entry = IterationSummary {
                    iteration,
                    status: IterationStatus::Scored,
                    summary: Some(summary.clone()),
                    score: Some(score),
                    improved,
                    errors: run.errors.clone(),
                };
                if improved {
                    self.best = Some(BestStrategy {
                        iteration,
                        name: strategy.name,
                        mode: strategy.mode,
                        source: strategy.source,
                        fingerprint: strategy.fingerprint,
                        summary,
                        score,
                        run,
                    });
                }
                entry
            }
        };

        self.history.push(entry);
        self.iteration = iteration;
        self.phase = if iteration >= self.max_iterations {
            AgentPhase::Done
        } else {
            AgentPhase::Generate
        };
        self
    }

    pub fn into_report(self, description: &str, settings: &AgentSettings) -> AgentReport {
        AgentReport {
            description: description.to_string(),
            symbols: settings.symbols.clone(),
            initial_cash: settings.initial_cash,
            iterations: self.history,
            best: self.best,
        }
    }
}

/// Final result of a generator run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub description: String,
    pub symbols: Vec<String>,
    /// Per symbol
    pub initial_cash: Decimal,
    pub iterations: Vec<IterationSummary>,
    pub best: Option<BestStrategy>,
}

// ============================================================================
// Progress
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    Completed,
    Error,
}

/// Shared view of a run for polling from the HTTP surface
pub struct AgentProgress {
    pub status: RwLock<AgentStatus>,
    pub phase: RwLock<AgentPhase>,
    pub iteration: AtomicU32,
    pub max_iterations: AtomicU32,
    pub best_score: RwLock<Option<Decimal>>,
    pub description: RwLock<Option<String>>,
    pub history: RwLock<Vec<IterationSummary>>,
    pub report: RwLock<Option<AgentReport>>,
    pub error_message: RwLock<Option<String>>,
}

/// Serializable snapshot of [`AgentProgress`]
#[derive(Debug, Clone, Serialize)]
pub struct AgentProgressView {
    pub status: AgentStatus,
    pub phase: AgentPhase,
    pub iteration: u32,
    pub max_iterations: u32,
    pub best_score: Option<Decimal>,
    pub description: Option<String>,
    pub history: Vec<IterationSummary>,
    pub report: Option<AgentReport>,
    pub error_message: Option<String>,
}

impl AgentProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(AgentStatus::Idle),
            phase: RwLock::new(AgentPhase::Generate),
            iteration: AtomicU32::new(0),
            max_iterations: AtomicU32::new(0),
            best_score: RwLock::new(None),
            description: RwLock::new(None),
            history: RwLock::new(Vec::new()),
            report: RwLock::new(None),
            error_message: RwLock::new(None),
        }
    }

    /// Claim the tracker for a new run and reset it. Returns `false` when a run is already
    /// in progress; the check and the claim happen under one lock.
    pub fn try_start(&self, description: &str, max_iterations: u32) -> bool {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if *status == AgentStatus::Running {
            return false;
        }
        *status = AgentStatus::Running;
        *self.phase.write().unwrap_or_else(PoisonError::into_inner) = AgentPhase::Generate;
        self.iteration.store(0, Ordering::Relaxed);
        self.max_iterations.store(max_iterations, Ordering::Relaxed);
        *self.best_score.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.description.write().unwrap_or_else(PoisonError::into_inner) =
            Some(description.to_string());
        self.history.write().unwrap_or_else(PoisonError::into_inner).clear();
        *self.report.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.error_message.write().unwrap_or_else(PoisonError::into_inner) = None;
        true
    }

    pub fn is_running(&self) -> bool {
        matches!(
            *self.status.read().unwrap_or_else(PoisonError::into_inner),
            AgentStatus::Running
        )
    }

    fn set_phase(&self, phase: AgentPhase) {
        *self.phase.write().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    fn record(&self, state: &AgentState) {
        self.iteration.store(state.iteration, Ordering::Relaxed);
        *self.best_score.write().unwrap_or_else(PoisonError::into_inner) =
            state.best.as_ref().map(|b| b.score);
        *self.history.write().unwrap_or_else(PoisonError::into_inner) = state.history.clone();
        self.set_phase(state.phase);
    }

    pub fn finish(&self, report: AgentReport) {
        *self.report.write().unwrap_or_else(PoisonError::into_inner) = Some(report);
        self.set_phase(AgentPhase::Done);
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = AgentStatus::Completed;
    }

    pub fn fail(&self, message: impl Into<String>) {
        *self.error_message.write().unwrap_or_else(PoisonError::into_inner) = Some(message.into());
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = AgentStatus::Error;
    }

    pub fn snapshot(&self) -> AgentProgressView {
        AgentProgressView {
            status: *self.status.read().unwrap_or_else(PoisonError::into_inner),
            phase: *self.phase.read().unwrap_or_else(PoisonError::into_inner),
            iteration: self.iteration.load(Ordering::Relaxed),
            max_iterations: self.max_iterations.load(Ordering::Relaxed),
            best_score: *self.best_score.read().unwrap_or_else(PoisonError::into_inner),
            description: self
                .description
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            history: self.history.read().unwrap_or_else(PoisonError::into_inner).clone(),
            report: self.report.read().unwrap_or_else(PoisonError::into_inner).clone(),
            error_message: self
                .error_message
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

impl Default for AgentProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Loop
// ============================================================================

/// Run the generator for `settings.max_iterations` iterations against data ending at `as_of`.
/// Never fails: every error is logged and folded into the report.
pub async fn run_agent(
    settings: &AgentSettings,
    description: &str,
    llm: &dyn CompletionClient,
    provider: &dyn MarketDataProvider,
    progress: Option<&AgentProgress>,
    as_of: NaiveDate,
) -> AgentReport {
    let mut state = AgentState::new(settings.max_iterations);
    let mut cache: HashMap<String, UniverseRun> = HashMap::new();
    let set_phase = |phase| {
        if let Some(p) = progress {
            p.set_phase(phase);
        }
    };

    info!(
        iterations = settings.max_iterations,
        symbols = settings.symbols.len(),
        "Strategy generation started"
    );

    while !state.is_done() {
        let iteration = state.iteration + 1;
        set_phase(AgentPhase::Generate);
        let generated = generate_strategy(llm, &state.prompt_context(description)).await;

        let outcome = match generated {
            None => IterationOutcome::GenerationFailed,
            Some((mode, source)) => {
                set_phase(AgentPhase::Compile);
                match compile(&source) {
                    Err(e) => {
                        warn!(iteration, error = %e, "Strategy failed to compile");
                        IterationOutcome::CompileFailed {
                            error_text: render_compile_error(&e, &source),
                            source,
                        }
                    }
                    Ok(strategy) => {
                        if strategy.mode != mode {
                            warn!(iteration, detected = %mode, declared = %strategy.mode, "Mode mismatch");
                        }
                        set_phase(AgentPhase::Backtest);
                        let run = match cache.get(&strategy.fingerprint) {
                            Some(run) => {
                                info!(iteration, fingerprint = %strategy.fingerprint, "Reusing cached universe run");
                                run.clone()
                            }
                            None => {
                                let run = run_universe(provider, &strategy, settings, as_of).await;
                                cache.insert(strategy.fingerprint.clone(), run.clone());
                                run
                            }
                        };

                        if run.records.is_empty() {
                            warn!(iteration, errors = run.errors.len(), "No successful backtests");
                            IterationOutcome::NoResults { errors: run.errors }
                        } else {
                            set_phase(AgentPhase::Score);
                            let summary = PortfolioSummary::from_records(&run.records);
                            let score = score(&summary).round_dp(2);
                            IterationOutcome::Backtested {
                                strategy: Box::new(strategy),
                                run,
                                summary,
                                score,
                            }
                        }
                    }
                }
            }
        };

        state = state.apply(outcome);
        if let Some(entry) = state.history.last() {
            info!(
                iteration,
                status = ?entry.status,
                score = ?entry.score,
                improved = entry.improved,
                "Iteration finished"
            );
        }
        if let Some(p) = progress {
            p.record(&state);
        }
    }

    match &state.best {
        Some(best) => info!(score = %best.score, iteration = best.iteration, "Best strategy selected"),
        None => warn!("No successful strategy generated"),
    }
    state.into_report(description, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::tests::ScriptedLlm;
    use crate::market::tests::{daily_history, StubProvider};
    use crate::runner::BacktestRecord;
    use rust_decimal_macros::dec;

    const SMA_CROSS: &str = r#"{"version":1,"name":"SMA cross","entry_long":"CROSS_ABOVE(close, SMA(5))","exit_long":"CROSS_BELOW(close, SMA(5))"}"#;
    const EMA_CROSS: &str = r#"{"version":1,"name":"EMA cross","entry_long":"CROSS_ABOVE(close, EMA(3))","exit_long":"CROSS_BELOW(close, EMA(8))"}"#;

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 30).unwrap()
    }

    fn wave(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + 10.0 * (i as f64 / 6.0).sin() + i as f64 * 0.1)
            .collect()
    }

    fn settings(iterations: u32) -> AgentSettings {
        AgentSettings {
            symbols: vec!["RELIANCE.NS".to_string(), "TCS.NS".to_string()],
            max_iterations: iterations,
            ..Default::default()
        }
    }

    fn provider() -> StubProvider {
        StubProvider::default()
            .with_history(daily_history("RELIANCE.NS", &wave(200)))
            .with_history(daily_history("TCS.NS", &wave(160)))
    }

    fn backtested(score: Decimal, source: &str) -> IterationOutcome {
        let strategy = compile(source).unwrap();
        let record = BacktestRecord {
            symbol: "A".to_string(),
            strategy_return_pct: dec!(1),
            buy_hold_return_pct: dec!(0),
            sharpe: dec!(0.5),
            win_rate_pct: dec!(50),
            max_drawdown_pct: dec!(-2),
            trades: 4,
            start_balance: dec!(10000),
            end_balance: dec!(10100),
            pnl: dec!(100),
        };
        let run = UniverseRun {
            records: vec![record.clone()],
            ..Default::default()
        };
        IterationOutcome::Backtested {
            strategy: Box::new(strategy),
            summary: PortfolioSummary::from_records(&run.records),
            run,
            score,
        }
    }

    #[test]
    fn test_reducer_keeps_strictly_better() {
        let state = AgentState::new(4)
            .apply(backtested(dec!(10), SMA_CROSS))
            .apply(backtested(dec!(10), EMA_CROSS))
            .apply(backtested(dec!(5), EMA_CROSS));
        let best = state.best.as_ref().unwrap();
        assert_eq!(best.iteration, 1);
        assert_eq!(best.name, "SMA cross");
        assert_eq!(state.phase, AgentPhase::Generate);

        let state = state.apply(backtested(dec!(12), EMA_CROSS));
        let best = state.best.as_ref().unwrap();
        assert_eq!(best.iteration, 4);
        assert_eq!(best.score, dec!(12));
        assert!(state.is_done());
        let improved: Vec<bool> = state.history.iter().map(|h| h.improved).collect();
        assert_eq!(improved, vec![true, false, false, true]);
    }

    #[test]
    fn test_reducer_error_bookkeeping() {
        let state = AgentState::new(3).apply(IterationOutcome::CompileFailed {
            source: "nope".to_string(),
            error_text: "Compilation error: bad".to_string(),
        });
        assert_eq!(state.last_errors, vec!["Compilation error: bad"]);

        // generation failures leave previous errors in place
        let state = state.apply(IterationOutcome::GenerationFailed);
        assert_eq!(state.last_errors, vec!["Compilation error: bad"]);
        assert!(state.best.is_none());

        let ctx = state.prompt_context("goal");
        assert_eq!(ctx.iteration, 3);
        assert!(ctx.previous_source.is_none());

        let state = state.apply(IterationOutcome::NoResults {
            errors: vec!["A: boom".to_string()],
        });
        assert_eq!(state.last_errors, vec!["A: boom"]);
        assert!(state.is_done());
    }

    #[test]
    fn test_progress_start_is_exclusive() {
        let progress = AgentProgress::new();
        assert!(progress.try_start("first", 3));
        assert!(!progress.try_start("second", 5));
        assert_eq!(progress.snapshot().description.as_deref(), Some("first"));
        assert_eq!(progress.max_iterations.load(Ordering::Relaxed), 3);

        progress.fail("generator task panicked");
        let view = progress.snapshot();
        assert_eq!(view.status, AgentStatus::Error);
        assert_eq!(view.error_message.as_deref(), Some("generator task panicked"));

        assert!(progress.try_start("second", 5));
        let view = progress.snapshot();
        assert_eq!(view.status, AgentStatus::Running);
        assert!(view.error_message.is_none());
    }

    #[test]
    fn test_zero_iterations_is_done() {
        assert!(AgentState::new(0).is_done());
    }

    #[tokio::test]
    async fn test_invalid_strategies_every_iteration() {
        let llm = ScriptedLlm::new(vec![
            Ok("def strategy(): pass".to_string()),
            Ok("```json\n{\"version\": 1}\n```".to_string()),
            Ok("{\"version\":1,\"entry_long\":\"ABOVE(close\",\"exit_long\":\"x\"}".to_string()),
            Ok("not even close".to_string()),
        ]);
        let progress = AgentProgress::new();
        assert!(progress.try_start("anything", 4));

        let report = run_agent(&settings(4), "anything", &llm, &provider(), Some(&progress), as_of()).await;

        assert!(report.best.is_none());
        assert_eq!(report.iterations.len(), 4);
        assert!(report
            .iterations
            .iter()
            .all(|i| i.status == IterationStatus::CompileFailed));
        assert_eq!(llm.prompts.lock().unwrap().len(), 4);
        assert_eq!(progress.iteration.load(Ordering::Relaxed), 4);
        assert_eq!(progress.snapshot().history.len(), 4);
        assert_eq!(*progress.phase.read().unwrap(), AgentPhase::Done);
    }

    #[tokio::test]
    async fn test_compile_error_feeds_next_prompt() {
        let llm = ScriptedLlm::new(vec![
            Ok("{\"version\":2}".to_string()),
            Ok(SMA_CROSS.to_string()),
            Err(crate::error::CompletionError::EmptyResponse),
        ]);

        let report = run_agent(&settings(3), "sma trend", &llm, &provider(), None, as_of()).await;

        let prompts = llm.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[0].starts_with("Design a robust trading strategy"));
        assert!(prompts[1].starts_with("Design a robust trading strategy"));
        assert!(prompts[1].contains("EXECUTION ERRORS FROM PREVIOUS ITERATION:\nCompilation error"));
        assert!(prompts[2].starts_with("ITERATION 3"));
        assert!(prompts[2].contains("CROSS_ABOVE(close, SMA(5))"));

        let best = report.best.unwrap();
        assert_eq!(best.iteration, 2);
        assert_eq!(best.run.records.len(), 2);
        assert!(best.score > Decimal::ZERO);
        assert_eq!(report.iterations[2].status, IterationStatus::GenerationFailed);
    }

    #[tokio::test]
    async fn test_repeated_strategy_reuses_cached_run() {
        let llm = ScriptedLlm::new(vec![Ok(SMA_CROSS.to_string()), Ok(SMA_CROSS.to_string())]);
        let provider = provider();

        let report = run_agent(&settings(2), "sma", &llm, &provider, None, as_of()).await;

        // two symbols fetched once
        assert_eq!(provider.queries.lock().unwrap().len(), 2);
        assert_eq!(report.iterations[0].score, report.iterations[1].score);
        assert!(!report.iterations[1].improved);
    }
}
