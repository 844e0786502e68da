//! Turning a raw LLM reply into strategy source

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, error, info};

use crate::api::CompletionClient;
use crate::prompt::{build_prompt, PromptContext, SYSTEM_PROMPT};
use crate::strategy::{PositionMode, StrategyDocument};

macro_rules! re {
    ($pat:expr) => {
        LazyLock::new(|| Regex::new($pat).unwrap())
    };
}

static RE_JSON_FENCE: LazyLock<Regex> = re!(r"```json\n");
static RE_PLAIN_FENCE: LazyLock<Regex> = re!(r"```\n");
static RE_ANY_FENCE: LazyLock<Regex> = re!(r"(?m)^```.*\n?");

/// Strip markdown code fences and surrounding whitespace
pub fn extract_strategy_source(raw: &str) -> String {
    let text = RE_JSON_FENCE.replace_all(raw, "");
    let text = RE_PLAIN_FENCE.replace_all(&text, "");
    let text = RE_ANY_FENCE.replace_all(&text, "");
    text.trim().to_string()
}

/// Position mode of a generated document.
/// Reads the `mode` field when the text is valid JSON, otherwise looks for short-side rules.
pub fn detect_mode(source: &str) -> PositionMode {
    if let Ok(doc) = serde_json::from_str::<StrategyDocument>(source) {
        return doc.mode;
    }
    if source.contains("long_short") || source.contains("entry_short") {
        PositionMode::LongShort
    } else {
        PositionMode::LongOnly
    }
}

/// Ask the model for the next strategy. Failures are logged and yield `None`.
pub async fn generate_strategy(
    client: &dyn CompletionClient,
    ctx: &PromptContext<'_>,
) -> Option<(PositionMode, String)> {
    let prompt = build_prompt(ctx);
    debug!(iteration = ctx.iteration, chars = prompt.len(), "Prompt built");

    match client.complete(SYSTEM_PROMPT, &prompt).await {
        Ok(raw) => {
            let source = extract_strategy_source(&raw);
            if source.is_empty() {
                error!(iteration = ctx.iteration, "LLM returned no strategy text");
                return None;
            }
            let mode = detect_mode(&source);
            info!(iteration = ctx.iteration, mode = %mode, "Strategy generated");
            Some((mode, source))
        }
        Err(e) => {
            error!(iteration = ctx.iteration, error = %e, "LLM generation failed");
            None
        }
    }
}
