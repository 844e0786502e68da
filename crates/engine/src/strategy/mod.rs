//! Strategy documents: the versioned JSON schema the LLM answers with, and its compiler
//!
//! A strategy is data. The document names a position mode, entry/exit rules written in the
//! rule DSL (see [`parser`]) and optional risk settings. Compiling parses every rule and
//! validates indicator parameters; nothing from the document is ever executed.

pub mod eval;
pub mod parser;
pub mod rule;

use std::collections::HashSet;
use std::fmt;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CompileError;
use crate::indicators::IndicatorType;

pub use eval::EvalContext;
pub use parser::parse_rule;
pub use rule::{IndicatorField, IndicatorRef, Operand, Rule};

pub const SCHEMA_VERSION: u32 = 1;

/// Which sides the strategy may trade
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionMode {
    #[default]
    LongOnly,
    LongShort,
}

impl fmt::Display for PositionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionMode::LongOnly => write!(f, "long_only"),
            PositionMode::LongShort => write!(f, "long_short"),
        }
    }
}

/// Wire form of a strategy, schema version 1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDocument {
    pub version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mode: PositionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub entry_long: Option<String>,
    pub exit_long: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_short: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_short: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup_bars: Option<usize>,
}

/// A parsed and validated strategy, ready for the backtest engine
#[derive(Debug, Clone)]
pub struct CompiledStrategy {
    pub name: String,
    pub mode: PositionMode,
    pub entry_long: Rule,
    pub exit_long: Rule,
    pub entry_short: Option<Rule>,
    pub exit_short: Option<Rule>,
    /// Percent of entry price, e.g. 5 = 5%
    pub stop_loss_pct: Option<Decimal>,
    pub take_profit_pct: Option<Decimal>,
    /// No entries before this bar index
    pub warmup_bars: usize,
    pub source: String,
    /// SHA-256 over the canonical rule text; equal strategies share a fingerprint
    pub fingerprint: String,
}

impl CompiledStrategy {
    pub fn indicators(&self) -> HashSet<IndicatorType> {
        let mut out = HashSet::new();
        for rule in self.rules() {
            rule.collect_indicators(&mut out);
        }
        out
    }

    fn rules(&self) -> impl Iterator<Item = &Rule> {
        [Some(&self.entry_long), Some(&self.exit_long)]
            .into_iter()
            .chain([self.entry_short.as_ref(), self.exit_short.as_ref()])
            .flatten()
    }

    pub fn allows_short(&self) -> bool {
        self.mode == PositionMode::LongShort && self.entry_short.is_some()
    }

    fn canonical(&self) -> String {
        let opt = |r: &Option<Rule>| r.as_ref().map(Rule::to_string).unwrap_or_default();
        let dec = |d: &Option<Decimal>| d.map(|v| v.normalize().to_string()).unwrap_or_default();
        format!(
            "mode={}\nentry_long={}\nexit_long={}\nentry_short={}\nexit_short={}\nsl={}\ntp={}\nwarmup={}",
            self.mode,
            self.entry_long,
            self.exit_long,
            opt(&self.entry_short),
            opt(&self.exit_short),
            dec(&self.stop_loss_pct),
            dec(&self.take_profit_pct),
            self.warmup_bars,
        )
    }
}

/// Compile generated strategy text. `source` must be a bare JSON document (fences already stripped).
pub fn compile(source: &str) -> Result<CompiledStrategy, CompileError> {
    let source = source.trim();
    if source.is_empty() {
        return Err(CompileError::Empty);
    }

    let doc: StrategyDocument = serde_json::from_str(source)?;
    if doc.version != SCHEMA_VERSION {
        return Err(CompileError::UnsupportedVersion {
            found: doc.version,
            expected: SCHEMA_VERSION,
        });
    }

    let entry_long = required_rule("entry_long", doc.entry_long.as_deref())?;
    let exit_long = required_rule("exit_long", doc.exit_long.as_deref())?;
    let (entry_short, exit_short) = match doc.mode {
        PositionMode::LongShort => (
            Some(required_rule("entry_short", doc.entry_short.as_deref())?),
            Some(required_rule("exit_short", doc.exit_short.as_deref())?),
        ),
        PositionMode::LongOnly => (None, None),
    };

    let mut strategy = CompiledStrategy {
        name: if doc.name.trim().is_empty() {
            "Generated Strategy".to_string()
        } else {
            doc.name.trim().to_string()
        },
        mode: doc.mode,
        entry_long,
        exit_long,
        entry_short,
        exit_short,
        stop_loss_pct: risk_pct("stop_loss_pct", doc.stop_loss_pct)?,
        take_profit_pct: risk_pct("take_profit_pct", doc.take_profit_pct)?,
        warmup_bars: doc.warmup_bars.unwrap_or(0),
        source: source.to_string(),
        fingerprint: String::new(),
    };

    let mut kinds: Vec<IndicatorType> = strategy.indicators().into_iter().collect();
    kinds.sort();
    for kind in kinds {
        kind.validate()
            .map_err(|reason| CompileError::InvalidIndicator {
                indicator: kind.to_string(),
                reason,
            })?;
    }

    strategy.fingerprint = format!("{:x}", Sha256::digest(strategy.canonical().as_bytes()));
    Ok(strategy)
}

fn required_rule(field: &'static str, text: Option<&str>) -> Result<Rule, CompileError> {
    let text = text
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(CompileError::MissingRule { field })?;
    parse_rule(text).map_err(|error| CompileError::Rule {
        field,
        context: error.display_with_context(text),
        error,
    })
}

fn risk_pct(field: &'static str, value: Option<f64>) -> Result<Option<Decimal>, CompileError> {
    match value {
        None => Ok(None),
        Some(v) if v > 0.0 && v < 100.0 => Ok(Decimal::from_f64(v)),
        Some(v) => Err(CompileError::InvalidRisk { field, value: v }),
    }
}

/// Text fed back to the LLM after a failed compile
pub fn render_compile_error(err: &CompileError, source: &str) -> String {
    format!("Compilation error: {err}\nCode:\n{source}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const MACD_EMA: &str = r#"{
        "version": 1,
        "name": "MACD trend",
        "mode": "long_only",
        "entry_long": "AND(CROSS_ABOVE(MACD_LINE(12,26,9), MACD_SIGNAL(12,26,9)), ABOVE(close, EMA(50)))",
        "exit_long": "CROSS_BELOW(MACD_LINE(12,26,9), MACD_SIGNAL(12,26,9))",
        "stop_loss_pct": 5
    }"#;

    #[test]
    fn test_compile_long_only() {
        let s = compile(MACD_EMA).unwrap();
        assert_eq!(s.name, "MACD trend");
        assert_eq!(s.mode, PositionMode::LongOnly);
        assert_eq!(s.stop_loss_pct, Some(dec!(5)));
        assert!(s.take_profit_pct.is_none());
        assert!(!s.allows_short());
        assert_eq!(s.indicators().len(), 2);
        assert_eq!(s.fingerprint.len(), 64);
    }

    #[test]
    fn test_fingerprint_ignores_formatting() {
        let a = compile(MACD_EMA).unwrap();
        let reformatted = MACD_EMA
            .replace("MACD_LINE(12,26,9)", "macd_line( 12, 26, 9 )")
            .replace("\n", " ");
        let b = compile(&reformatted).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);

        let c = compile(&MACD_EMA.replace("EMA(50)", "EMA(20)")).unwrap();
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[test]
    fn test_long_short_requires_short_rules() {
        let doc = r#"{"version":1,"mode":"long_short",
            "entry_long":"BELOW(RSI(14), 30)","exit_long":"ABOVE(RSI(14), 50)",
            "entry_short":"ABOVE(RSI(14), 70)"}"#;
        let err = compile(doc).unwrap_err();
        assert!(matches!(err, CompileError::MissingRule { field: "exit_short" }));

        let doc = doc.replace(
            r#""entry_short":"ABOVE(RSI(14), 70)""#,
            r#""entry_short":"ABOVE(RSI(14), 70)","exit_short":"BELOW(RSI(14), 50)""#,
        );
        let s = compile(&doc).unwrap();
        assert!(s.allows_short());
        assert_eq!(s.name, "Generated Strategy");
    }

    #[test]
    fn test_compile_errors() {
        assert!(matches!(compile("   "), Err(CompileError::Empty)));
        assert!(matches!(
            compile("class MyStrategy(Strategy): pass"),
            Err(CompileError::Json(_))
        ));
        assert!(matches!(
            compile(r#"{"version":2,"entry_long":"ABOVE(close,1)","exit_long":"BELOW(close,1)"}"#),
            Err(CompileError::UnsupportedVersion { found: 2, expected: 1 })
        ));
        assert!(matches!(
            compile(r#"{"version":1,"exit_long":"BELOW(close,1)"}"#),
            Err(CompileError::MissingRule { field: "entry_long" })
        ));
        assert!(matches!(
            compile(r#"{"version":1,"entry_long":"ABOVE(close,SMA(0))","exit_long":"BELOW(close,1)"}"#),
            Err(CompileError::InvalidIndicator { .. })
        ));
        assert!(matches!(
            compile(r#"{"version":1,"entry_long":"ABOVE(close,1)","exit_long":"BELOW(close,1)","take_profit_pct":150}"#),
            Err(CompileError::InvalidRisk { field: "take_profit_pct", .. })
        ));
    }

    #[test]
    fn test_oversized_indicator_period_is_rejected() {
        let src = r#"{"version":1,"entry_long":"ABOVE(close, SMA(100000000000))","exit_long":"BELOW(close, 1)"}"#;
        match compile(src) {
            Err(CompileError::InvalidIndicator { indicator, reason }) => {
                assert_eq!(indicator, "SMA(100000000000)");
                assert!(reason.contains("maximum"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rule_error_carries_context() {
        let src = r#"{"version":1,"entry_long":"ABOVE(close, SMA(20)","exit_long":"BELOW(close,1)"}"#;
        let err = compile(src).unwrap_err();
        match &err {
            CompileError::Rule {
                field,
                error,
                context,
            } => {
                assert_eq!(*field, "entry_long");
                assert_eq!(error.position, 20);
                assert!(context.contains('^'));
            }
            other => panic!("unexpected {other:?}"),
        }

        let rendered = render_compile_error(&err, src);
        assert!(rendered.starts_with("Compilation error: rule `entry_long`"));
        assert!(rendered.ends_with(&format!("Code:\n{src}")));
    }
}
