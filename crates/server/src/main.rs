//! Strategy Lab - market-data proxy and LLM strategy generator
//!
//! Usage:
//!   strategy-lab serve --port 3001          - Launch the HTTP proxy and agent endpoints
//!   strategy-lab agent --strategy "..."     - Run the strategy generator from the CLI

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use engine::market::{multi_history, single_history, split_tickers, ticker_info};
use engine::report::{format_final_report, format_iteration, format_run_header, render_chart_svg};
use engine::settings::{parse_symbol_list, DEFAULT_STRATEGY, MAX_ITERATIONS};
use engine::{
    run_agent, AgentProgress, AgentSettings, AgentStatus, ChatCompletionClient, CompletionClient,
    LlmSettings, MarketDataError, MarketDataProvider, YahooClient,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Write as _;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "strategy-lab")]
#[command(about = "Market-data proxy and iterative LLM strategy generator", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the HTTP server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    /// Generate, backtest and refine a strategy from the CLI
    Agent {
        /// Strategy description (prompted for when absent)
        #[arg(long)]
        strategy: Option<String>,
        /// Symbols to backtest (comma-separated, prompted for when absent)
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        /// Number of generate/backtest iterations
        #[arg(long)]
        iterations: Option<u32>,
        /// Starting capital per symbol
        #[arg(long)]
        cash: Option<Decimal>,
        /// Days of history to backtest over
        #[arg(long)]
        days: Option<i64>,
        /// Write the result chart as SVG to this path
        #[arg(long)]
        chart: Option<String>,
    },
}

#[derive(Clone)]
struct AppState {
    provider: Arc<dyn MarketDataProvider>,
    /// `None` when no API key is configured
    llm: Option<Arc<dyn CompletionClient>>,
    agent_settings: AgentSettings,
    agent_progress: Arc<AgentProgress>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("info,engine=debug,strategy_lab=debug")
    } else {
        EnvFilter::new("warn,engine=info,strategy_lab=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Serve { host, port } => {
            cmd_serve(&host, port).await?;
        }
        Commands::Agent {
            strategy,
            symbols,
            iterations,
            cash,
            days,
            chart,
        } => {
            let mut settings = AgentSettings::from_env();
            if let Some(n) = iterations {
                settings.max_iterations = n;
            }
            if let Some(c) = cash {
                settings.initial_cash = c;
            }
            if let Some(d) = days {
                settings.lookback_days = d;
            }
            cmd_agent(settings, strategy, symbols, chart).await?;
        }
    }

    Ok(())
}

fn llm_client(settings: LlmSettings) -> Option<Arc<dyn CompletionClient>> {
    if settings.has_api_key() {
        Some(Arc::new(ChatCompletionClient::new(settings)))
    } else {
        None
    }
}

// ============================================================================
// Serve command - Axum web server
// ============================================================================

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/agent/run", post(api_start_agent))
        .route("/agent/status", get(api_agent_status));

    Router::new()
        .route("/stock/:ticker/info", get(get_ticker_info))
        .route("/stock/:ticker/history", get(get_history))
        .route("/stocks/history", get(get_multi_history))
        .nest("/api", api_routes)
        .with_state(state)
        .layer(cors)
}

async fn cmd_serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("Strategy Lab v{} starting...", APP_VERSION);

    let llm_settings = LlmSettings::from_env();
    if !llm_settings.has_api_key() {
        warn!("No LLM_API_KEY configured, agent endpoints will refuse to start runs");
    }

    let agent_settings = AgentSettings::from_env();
    agent_settings.validate()?;

    let state = AppState {
        provider: Arc::new(YahooClient::new()),
        llm: llm_client(llm_settings),
        agent_settings,
        agent_progress: Arc::new(AgentProgress::new()),
    };
    let app = build_router(state);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Strategy Lab v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /stock/:ticker/info      - Ticker fundamentals");
    println!("  GET  /stock/:ticker/history   - OHLCV history (?period=&interval=)");
    println!("  GET  /stocks/history          - Multi-ticker history (?tickers=A,B&period=&interval=)");
    println!("  GET  /api/health              - Health check");
    println!("  POST /api/agent/run           - Start the strategy generator");
    println!("  GET  /api/agent/status        - Poll generator progress");
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Agent command - CLI mode
// ============================================================================

fn prompt_line(label: &str) -> anyhow::Result<String> {
    print!("{label}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn cmd_agent(
    mut settings: AgentSettings,
    strategy: Option<String>,
    symbols: Vec<String>,
    chart: Option<String>,
) -> anyhow::Result<()> {
    let llm_settings = LlmSettings::from_env();
    let Some(llm) = llm_client(llm_settings) else {
        anyhow::bail!("No LLM API key configured (set LLM_API_KEY or GROQ_API_KEY)");
    };

    let description = match strategy {
        Some(s) if !s.trim().is_empty() => s,
        _ => {
            let line = prompt_line("Enter your trading strategy: ")?;
            if line.is_empty() {
                DEFAULT_STRATEGY.to_string()
            } else {
                line
            }
        }
    };

    let symbols = if symbols.is_empty() {
        let line = prompt_line(&format!(
            "Symbols (Enter for {} NSE stocks): ",
            settings.symbols.len()
        ))?;
        parse_symbol_list(&line)
    } else {
        parse_symbol_list(&symbols.join(","))
    };
    if !symbols.is_empty() {
        settings.symbols = symbols;
    }

    settings.validate()?;
    let end = Utc::now().date_naive();
    let start = settings.window_start(end)?;
    println!(
        "\n{}",
        format_run_header(&description, start, end, settings.symbols.len(), settings.initial_cash)
    );

    let provider: Arc<dyn MarketDataProvider> = Arc::new(YahooClient::new());
    let progress = Arc::new(AgentProgress::new());
    if !progress.try_start(&description, settings.max_iterations) {
        anyhow::bail!("Strategy generator already running");
    }

    let handle = spawn_agent(
        settings.clone(),
        description.clone(),
        llm,
        provider,
        progress.clone(),
        end,
    );

    // Progress display loop
    let mut printed = 0;
    loop {
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        let snapshot = progress.snapshot();
        for entry in snapshot.history.iter().skip(printed) {
            println!("{}", format_iteration(entry, settings.max_iterations));
        }
        printed = snapshot.history.len();

        if snapshot.status != AgentStatus::Running || handle.is_finished() {
            break;
        }
    }
    handle.await?;

    let snapshot = progress.snapshot();
    let Some(report) = snapshot.report else {
        let reason = snapshot
            .error_message
            .unwrap_or_else(|| "stopped without a report".to_string());
        anyhow::bail!("Strategy generator failed: {reason}");
    };
    println!("{}", format_final_report(&report));

    if let Some(path) = chart {
        match &report.best {
            Some(best) => {
                std::fs::write(&path, render_chart_svg(best, report.initial_cash))?;
                println!("Chart written to {}", path);
            }
            None => warn!("No successful strategy, chart not written"),
        }
    }

    Ok(())
}

// ============================================================================
// Market data handlers
// ============================================================================

#[derive(Debug, Deserialize)]
struct HistoryParams {
    period: Option<String>,
    interval: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MultiHistoryParams {
    tickers: Option<String>,
    period: Option<String>,
    interval: Option<String>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "status": "error",
            "message": message.into(),
        })),
    )
        .into_response()
}

/// GET /stock/:ticker/info
async fn get_ticker_info(State(state): State<AppState>, Path(ticker): Path<String>) -> Response {
    match ticker_info(state.provider.as_ref(), &ticker).await {
        Ok(data) => Json(serde_json::json!({
            "status": "success",
            "data": data,
        }))
        .into_response(),
        Err(e) => {
            error!(ticker = %ticker, error = %e, "Ticker info failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /stock/:ticker/history?period=&interval=
async fn get_history(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let result = single_history(
        state.provider.as_ref(),
        &ticker,
        params.period.as_deref(),
        params.interval.as_deref(),
    )
    .await;

    match result {
        Ok(rows) => Json(serde_json::json!({
            "status": "success",
            "data": rows,
        }))
        .into_response(),
        Err(MarketDataError::NotFound { .. }) => {
            error_response(StatusCode::NOT_FOUND, "No data found")
        }
        Err(e) => {
            error!(ticker = %ticker, error = %e, "History fetch failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /stocks/history?tickers=A,B&period=&interval=
async fn get_multi_history(
    State(state): State<AppState>,
    Query(params): Query<MultiHistoryParams>,
) -> Response {
    let tickers = params
        .tickers
        .as_deref()
        .map(split_tickers)
        .unwrap_or_default();
    if tickers.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Tickers parameter is required");
    }

    let data = multi_history(
        state.provider.as_ref(),
        &tickers,
        params.period.as_deref(),
        params.interval.as_deref(),
    )
    .await;
    info!(requested = tickers.len(), returned = data.len(), "Multi-ticker history");

    Json(serde_json::json!({
        "status": "success",
        "data": data,
    }))
    .into_response()
}

// ============================================================================
// API handlers - health and agent
// ============================================================================

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "strategy-lab",
        "version": APP_VERSION,
    }))
}

#[derive(Debug, Deserialize)]
struct AgentRunRequest {
    strategy: Option<String>,
    symbols: Option<Vec<String>>,
    max_iterations: Option<u32>,
    initial_cash: Option<Decimal>,
}

/// POST /api/agent/run - start the generator in the background
async fn api_start_agent(
    State(state): State<AppState>,
    Json(request): Json<AgentRunRequest>,
) -> Json<serde_json::Value> {
    let Some(llm) = state.llm.clone() else {
        return Json(serde_json::json!({
            "success": false,
            "message": "LLM API key not configured",
        }));
    };

    let mut settings = state.agent_settings.clone();
    if let Some(symbols) = request.symbols.filter(|s| !s.is_empty()) {
        settings.symbols = parse_symbol_list(&symbols.join(","));
    }
    if let Some(n) = request.max_iterations {
        settings.max_iterations = n.clamp(1, MAX_ITERATIONS);
    }
    if let Some(cash) = request.initial_cash {
        settings.initial_cash = cash;
    }
    if let Err(e) = settings.validate() {
        return Json(serde_json::json!({
            "success": false,
            "message": e.to_string(),
        }));
    }
    let description = request
        .strategy
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_STRATEGY.to_string());

    if !state
        .agent_progress
        .try_start(&description, settings.max_iterations)
    {
        let iteration = state
            .agent_progress
            .iteration
            .load(std::sync::atomic::Ordering::Relaxed);
        return Json(serde_json::json!({
            "success": false,
            "message": format!("Strategy generator already running (iteration {})", iteration),
        }));
    }

    info!(
        strategy = %description,
        symbols = ?settings.symbols,
        iterations = settings.max_iterations,
        "Starting strategy generator"
    );

    let iterations = settings.max_iterations;
    spawn_agent(
        settings,
        description,
        llm,
        state.provider.clone(),
        state.agent_progress.clone(),
        Utc::now().date_naive(),
    );

    Json(serde_json::json!({
        "success": true,
        "message": "Strategy generator started",
        "max_iterations": iterations,
    }))
}

/// Run the generator in a background task. The progress tracker is always released: a
/// panicking run is recorded as an error instead of staying `Running`.
fn spawn_agent(
    settings: AgentSettings,
    description: String,
    llm: Arc<dyn CompletionClient>,
    provider: Arc<dyn MarketDataProvider>,
    progress: Arc<AgentProgress>,
    as_of: chrono::NaiveDate,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let run = {
            let progress = progress.clone();
            tokio::spawn(async move {
                run_agent(
                    &settings,
                    &description,
                    llm.as_ref(),
                    provider.as_ref(),
                    Some(progress.as_ref()),
                    as_of,
                )
                .await
            })
        };
        match run.await {
            Ok(report) => progress.finish(report),
            Err(e) => {
                error!(error = %e, "Strategy generator task failed");
                progress.fail(format!("Strategy generator failed: {e}"));
            }
        }
    })
}

/// GET /api/agent/status - poll generator progress
async fn api_agent_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.agent_progress.snapshot()).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use engine::{CompletionError, HistoryQuery, HistoryRow, PriceHistory, TickerInfo};
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use tower::ServiceExt;

    #[derive(Default)]
    struct StubProvider {
        histories: HashMap<String, PriceHistory>,
        infos: HashMap<String, TickerInfo>,
    }

    impl StubProvider {
        fn with_rows(mut self, symbol: &str, rows: usize) -> Self {
            let rows = (0..rows)
                .map(|i| HistoryRow {
                    timestamp: 1_704_153_600 + i as i64 * 86_400,
                    open: Some(100.0 + i as f64),
                    high: Some(101.0 + i as f64),
                    low: Some(99.0 + i as f64),
                    close: Some(100.5 + i as f64),
                    volume: Some(1_000_000),
                })
                .collect();
            self.histories.insert(
                symbol.to_string(),
                PriceHistory {
                    symbol: symbol.to_string(),
                    currency: Some("USD".to_string()),
                    rows,
                },
            );
            self
        }
    }

    #[async_trait]
    impl MarketDataProvider for StubProvider {
        async fn ticker_info(&self, symbol: &str) -> Result<TickerInfo, MarketDataError> {
            self.infos
                .get(symbol)
                .cloned()
                .ok_or_else(|| MarketDataError::NotFound {
                    symbol: symbol.to_string(),
                })
        }

        async fn history(
            &self,
            symbol: &str,
            _query: &HistoryQuery,
        ) -> Result<PriceHistory, MarketDataError> {
            self.histories
                .get(symbol)
                .cloned()
                .ok_or_else(|| MarketDataError::Upstream {
                    status: 500,
                    body: "boom".to_string(),
                })
        }
    }

    struct NeverLlm;

    #[async_trait]
    impl CompletionClient for NeverLlm {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, CompletionError> {
            Err(CompletionError::EmptyResponse)
        }
    }

    struct PanickingLlm;

    #[async_trait]
    impl CompletionClient for PanickingLlm {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, CompletionError> {
            panic!("completion client blew up");
        }
    }

    async fn post_run(app: Router, body: &'static str) -> serde_json::Value {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/agent/run")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    async fn wait_until_stopped(progress: &AgentProgress) {
        for _ in 0..200 {
            if !progress.is_running() {
                return;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }
        panic!("generator still running");
    }

    fn app(provider: StubProvider, llm: Option<Arc<dyn CompletionClient>>) -> Router {
        build_router(AppState {
            provider: Arc::new(provider),
            llm,
            agent_settings: AgentSettings::default(),
            agent_progress: Arc::new(AgentProgress::new()),
        })
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_history_returns_rows_with_wire_keys() {
        let app = app(StubProvider::default().with_rows("AAPL", 22), None);
        let (status, body) = get_json(app, "/stock/AAPL/history?period=1mo&interval=1d").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        let rows = body["data"].as_array().unwrap();
        assert_eq!(rows.len(), 22);
        for row in rows {
            let mut keys: Vec<&str> = row.as_object().unwrap().keys().map(String::as_str).collect();
            keys.sort();
            assert_eq!(keys, vec!["Close", "Date", "High", "Low", "Open", "Volume"]);
        }
        let dates: Vec<&str> = rows.iter().map(|r| r["Date"].as_str().unwrap()).collect();
        assert!(dates.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_empty_history_is_404() {
        let app = app(StubProvider::default().with_rows("EMPTY", 0), None);
        let (status, body) = get_json(app, "/stock/EMPTY/history").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "No data found");
    }

    #[tokio::test]
    async fn test_history_upstream_failure_is_500() {
        let app = app(StubProvider::default(), None);
        let (status, body) = get_json(app, "/stock/BAD/history").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_info_success_and_failure() {
        let mut provider = StubProvider::default();
        let mut info = TickerInfo::new();
        info.insert("currency".to_string(), serde_json::json!("USD"));
        provider.infos.insert("AAPL".to_string(), info);
        let app = app(provider, None);

        let (status, body) = get_json(app.clone(), "/stock/AAPL/info").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["currency"], "USD");

        let (status, body) = get_json(app, "/stock/NOPE/info").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_multi_history_skips_failing_ticker() {
        let app = app(StubProvider::default().with_rows("AAPL", 5), None);
        let (status, body) = get_json(app, "/stocks/history?tickers=AAPL,BADTICKER").await;

        assert_eq!(status, StatusCode::OK);
        let data = body["data"].as_object().unwrap();
        assert_eq!(data.keys().collect::<Vec<_>>(), vec!["AAPL"]);
        assert_eq!(data["AAPL"]["currency"], "USD");
        assert_eq!(data["AAPL"]["data"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_multi_history_requires_tickers() {
        let app = app(StubProvider::default(), None);
        let (status, body) = get_json(app.clone(), "/stocks/history").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Tickers parameter is required");

        let (status, _) = get_json(app, "/stocks/history?tickers=,%20").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json(app(StubProvider::default(), None), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "strategy-lab");
    }

    #[tokio::test]
    async fn test_agent_run_without_key_is_refused() {
        let app = app(StubProvider::default(), None);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/agent/run")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"strategy":"rsi dip"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_agent_status_reports_finished_run() {
        let provider = StubProvider::default();
        let progress = Arc::new(AgentProgress::new());
        let state = AppState {
            provider: Arc::new(provider),
            llm: Some(Arc::new(NeverLlm)),
            agent_settings: AgentSettings {
                max_iterations: 2,
                ..Default::default()
            },
            agent_progress: progress.clone(),
        };
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/agent/run")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"strategy":"rsi dip"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        for _ in 0..100 {
            if !progress.is_running() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }

        let (status, body) = get_json(app, "/api/agent/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["iteration"], 2);
        assert!(body["report"]["best"].is_null());
    }

    #[tokio::test]
    async fn test_panicking_run_is_reported_as_error() {
        let progress = Arc::new(AgentProgress::new());
        let app = build_router(AppState {
            provider: Arc::new(StubProvider::default()),
            llm: Some(Arc::new(PanickingLlm)),
            agent_settings: AgentSettings::default(),
            agent_progress: progress.clone(),
        });

        let body = post_run(app.clone(), r#"{"strategy":"rsi dip"}"#).await;
        assert_eq!(body["success"], true);
        wait_until_stopped(&progress).await;

        let (_, body) = get_json(app.clone(), "/api/agent/status").await;
        assert_eq!(body["status"], "error");
        assert!(body["error_message"]
            .as_str()
            .unwrap()
            .contains("Strategy generator failed"));

        // the tracker is free again
        let body = post_run(app, r#"{"strategy":"rsi dip"}"#).await;
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn test_agent_run_limits_request_settings() {
        let progress = Arc::new(AgentProgress::new());
        let app = build_router(AppState {
            provider: Arc::new(StubProvider::default()),
            llm: Some(Arc::new(NeverLlm)),
            agent_settings: AgentSettings::default(),
            agent_progress: progress.clone(),
        });

        let body = post_run(app.clone(), r#"{"initial_cash":-100}"#).await;
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("initial_cash"));
        assert!(!progress.is_running());

        let body = post_run(app, r#"{"max_iterations":4000000000}"#).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["max_iterations"], MAX_ITERATIONS);
        wait_until_stopped(&progress).await;
    }

    #[tokio::test]
    async fn test_second_run_is_refused_while_running() {
        let progress = Arc::new(AgentProgress::new());
        assert!(progress.try_start("held", 3));
        let app = build_router(AppState {
            provider: Arc::new(StubProvider::default()),
            llm: Some(Arc::new(NeverLlm)),
            agent_settings: AgentSettings::default(),
            agent_progress: progress.clone(),
        });

        let body = post_run(app, r#"{"strategy":"rsi dip"}"#).await;
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("already running"));
        assert_eq!(progress.snapshot().description.as_deref(), Some("held"));
    }
}
