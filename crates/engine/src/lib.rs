//! Strategy Lab engine - market data, strategy DSL, backtesting and the LLM strategy generator
//!
//! Provides:
//! - Yahoo Finance chart/quote client behind the `MarketDataProvider` trait
//! - A JSON strategy schema with a rule DSL, compiled and interpreted (never executed)
//! - One bar-by-bar backtest engine with `ta` indicators
//! - The iterative generate → compile → backtest → score loop against an OpenAI-compatible LLM

pub mod agent;
pub mod api;
pub mod commission;
pub mod completion;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod market;
pub mod prompt;
pub mod report;
pub mod runner;
pub mod scoring;
pub mod settings;
pub mod strategy;
pub mod types;

// Re-exports for convenience
pub use agent::{
    run_agent, AgentPhase, AgentProgress, AgentProgressView, AgentReport, AgentState, AgentStatus,
    BestStrategy, IterationOutcome, IterationStatus, IterationSummary,
};
pub use api::{ChatCompletionClient, CompletionClient, HistoryQuery, MarketDataProvider, YahooClient};
pub use commission::{calculate_commission, CommissionConfig};
pub use engine::BacktestEngine;
pub use error::{
    BacktestError, CompileError, CompletionError, ConfigError, MarketDataError, ParseError,
};
pub use market::{multi_history, single_history, split_tickers, ticker_info, TickerHistory};
pub use runner::{run_symbol, run_universe, BacktestRecord, UniverseRun};
pub use scoring::{score, PortfolioSummary};
pub use settings::{AgentSettings, LlmSettings};
pub use strategy::{compile, CompiledStrategy, PositionMode, StrategyDocument};
pub use types::*;
