//! Adaptive token budgeting and truncation detection.

use crate::types::TokenUsage;

/// Clamp bounds for any completion ceiling.
pub const MIN_TOKENS: u32 = 512;
pub const MAX_TOKENS: u32 = 8_192;

/// Extra budget per sub-query result fed into synthesis.
pub const TOKENS_PER_SUBQUERY: u32 = 256;
/// Extra budget per attached document fed into synthesis.
pub const TOKENS_PER_DOC: u32 = 128;

/// Rough token estimate for prompt sizing (4 chars ≈ 1 token).
pub fn estimate_tokens(text_chars: usize) -> u32 {
    (text_chars / 4) as u32
}

/// Completion ceiling for a research call: the model's advertised context
/// window minus a margin for the prompt, clamped to `[MIN, MAX]`.
pub fn adaptive_max_tokens(context_window: u32, prompt_chars: usize) -> u32 {
    let prompt_tokens = estimate_tokens(prompt_chars);
    let margin = prompt_tokens + prompt_tokens / 4 + 256;
    context_window
        .saturating_sub(margin)
        .clamp(MIN_TOKENS, MAX_TOKENS)
}

/// Synthesis ceiling: the adaptive ceiling plus per-sub-query and per-doc
/// allowances, still clamped to the global maximum.
pub fn synthesis_max_tokens(
    context_window: u32,
    prompt_chars: usize,
    sub_query_count: usize,
    doc_count: usize,
) -> u32 {
    let base = adaptive_max_tokens(context_window, prompt_chars);
    let extra =
        TOKENS_PER_SUBQUERY * sub_query_count as u32 + TOKENS_PER_DOC * doc_count as u32;
    (base + extra).clamp(MIN_TOKENS, MAX_TOKENS)
}

/// Flag a response that looks cut off: its last non-whitespace character is
/// not sentence-terminal and completion usage is at ≥ 95% of the requested
/// ceiling. Flagged responses are annotated in metadata, never re-run.
pub fn detect_truncation(text: &str, usage: Option<&TokenUsage>, requested_max: u32) -> bool {
    let Some(last) = text.trim_end().chars().last() else {
        return false;
    };
    if matches!(last, '.' | '!' | '?' | ':' | '"' | '\'' | ')' | ']' | '`') {
        return false;
    }
    let Some(usage) = usage else {
        return false;
    };
    usage.completion_tokens as f64 >= 0.95 * requested_max as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_respects_clamp_bounds() {
        // Tiny window clamps up to the minimum.
        assert_eq!(adaptive_max_tokens(1_000, 10_000), MIN_TOKENS);
        // Huge window clamps down to the maximum.
        assert_eq!(adaptive_max_tokens(1_000_000, 1_000), MAX_TOKENS);
    }

    #[test]
    fn larger_prompts_shrink_the_ceiling() {
        let small = adaptive_max_tokens(16_000, 1_000);
        let large = adaptive_max_tokens(16_000, 40_000);
        assert!(large <= small);
    }

    #[test]
    fn synthesis_budget_grows_with_inputs() {
        let bare = synthesis_max_tokens(16_000, 1_000, 0, 0);
        let loaded = synthesis_max_tokens(16_000, 1_000, 4, 2);
        assert_eq!(
            loaded,
            (bare + 4 * TOKENS_PER_SUBQUERY + 2 * TOKENS_PER_DOC).min(MAX_TOKENS)
        );
    }

    #[test]
    fn truncation_requires_both_signals() {
        let usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 980,
            total_tokens: 990,
        };
        // Mid-sentence ending at the ceiling: flagged.
        assert!(detect_truncation("the results show th", Some(&usage), 1000));
        // Sentence-terminal ending: not flagged even at the ceiling.
        assert!(!detect_truncation("the results are clear.", Some(&usage), 1000));
        // Mid-sentence but well under the ceiling: not flagged.
        let light = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 100,
            total_tokens: 110,
        };
        assert!(!detect_truncation("the results show th", Some(&light), 1000));
        // Missing usage: not flagged.
        assert!(!detect_truncation("the results show th", None, 1000));
    }
}
