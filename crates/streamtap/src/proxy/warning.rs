//! Context-budget warnings
//!
//! Maps prompt usage against a model's budget to a warning level and renders
//! the level as a chunk appended after the model's own output.

use super::models::ModelLimits;
use super::sse::StreamingChunk;

/// Severity of context usage, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WarningLevel {
    None,
    Info,
    Warning,
    Critical,
}

/// Lower bounds, in percent, for each level (inclusive)
const INFO_PERCENT: u128 = 25;
const WARNING_PERCENT: u128 = 40;
const CRITICAL_PERCENT: u128 = 50;

impl WarningLevel {
    /// Level for `prompt_tokens` out of `max_context_tokens`.
    ///
    /// Thresholds are compared in integer arithmetic so that exact
    /// boundaries land on the higher level.
    pub fn from_usage(prompt_tokens: u64, max_context_tokens: u64) -> Self {
        if max_context_tokens == 0 {
            return WarningLevel::None;
        }
        let scaled = prompt_tokens as u128 * 100;
        let max = max_context_tokens as u128;

        if scaled >= max * CRITICAL_PERCENT {
            WarningLevel::Critical
        } else if scaled >= max * WARNING_PERCENT {
            WarningLevel::Warning
        } else if scaled >= max * INFO_PERCENT {
            WarningLevel::Info
        } else {
            WarningLevel::None
        }
    }

    pub fn for_limits(prompt_tokens: u64, limits: &ModelLimits) -> Self {
        Self::from_usage(prompt_tokens, limits.max_context_tokens)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WarningLevel::None => "none",
            WarningLevel::Info => "info",
            WarningLevel::Warning => "warning",
            WarningLevel::Critical => "critical",
        }
    }
}

/// Abbreviate a token count: 950, 1.5k, 200k, 1M, 1.2M
pub fn format_tokens(tokens: u64) -> String {
    fn rounded(tokens: u64, unit: f64) -> f64 {
        (tokens as f64 / unit * 10.0).round() / 10.0
    }

    fn scaled(value: f64, suffix: &str) -> String {
        if value.fract() == 0.0 {
            format!("{}{suffix}", value as u64)
        } else {
            format!("{value:.1}{suffix}")
        }
    }

    if tokens < 1_000 {
        return tokens.to_string();
    }
    // Pick the suffix after rounding so 999_999 reads 1M, not 1000k
    let thousands = rounded(tokens, 1_000.0);
    if thousands < 1_000.0 {
        scaled(thousands, "k")
    } else {
        scaled(rounded(tokens, 1_000_000.0), "M")
    }
}

/// Whole percentage of the budget used, rounded down
pub fn usage_percent(prompt_tokens: u64, max_context_tokens: u64) -> u64 {
    if max_context_tokens == 0 {
        return 0;
    }
    (prompt_tokens as u128 * 100 / max_context_tokens as u128) as u64
}

/// User-facing text for a level, or `None` when nothing should be shown
pub fn render_warning(level: WarningLevel, prompt_tokens: u64, max_context_tokens: u64) -> Option<String> {
    let usage = format!(
        "{}% of context used ({} / {} tokens)",
        usage_percent(prompt_tokens, max_context_tokens),
        format_tokens(prompt_tokens),
        format_tokens(max_context_tokens)
    );

    let text = match level {
        WarningLevel::None => return None,
        WarningLevel::Info => format!("ℹ️ {usage}."),
        WarningLevel::Warning => format!(
            "⚠️ {usage}. Consider starting a new conversation soon."
        ),
        WarningLevel::Critical => format!(
            "🚨 {usage}. Start a new conversation to keep responses accurate and costs down."
        ),
    };
    Some(text)
}

/// Warning chunk for the given usage, or `None` below the first threshold
pub fn warning_chunk(
    prompt_tokens: u64,
    limits: &ModelLimits,
    id: &str,
    model: &str,
    created: i64,
) -> Option<StreamingChunk> {
    let level = WarningLevel::for_limits(prompt_tokens, limits);
    let text = render_warning(level, prompt_tokens, limits.max_context_tokens)?;
    Some(StreamingChunk::synthetic(id, model, created, format!("\n\n{text}")))
}
