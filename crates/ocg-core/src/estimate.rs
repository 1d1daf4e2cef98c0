//! Token estimation.
//!
//! The agent never tokenizes with a real vocabulary — context budgeting only
//! needs a stable, conservative estimate. The declared formula is
//! `ceil(chars / 4)` per text plus a flat 4-token framing overhead per
//! message. Every consumer (overflow precheck, pruning, compaction keep
//! budget, session meta accounting) uses these two functions so the numbers
//! always agree.

/// Flat per-message overhead covering role and framing tokens.
pub const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

/// Estimate tokens for a bare text fragment.
pub fn estimate_text(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}

/// Estimate tokens for one message including framing overhead.
pub fn estimate_message(content: &str) -> u64 {
    estimate_text(content) + MESSAGE_OVERHEAD_TOKENS
}

/// Estimate tokens for a whole rendered context.
pub fn estimate_messages<'a, I>(contents: I) -> u64
where
    I: IntoIterator<Item = &'a str>,
{
    contents.into_iter().map(estimate_message).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(estimate_text(""), 0);
        assert_eq!(estimate_message(""), MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn four_chars_per_token_rounds_up() {
        assert_eq!(estimate_text("abcd"), 1);
        assert_eq!(estimate_text("abcde"), 2);
    }

    #[test]
    fn multibyte_counts_chars_not_bytes() {
        // Four 3-byte chars are still one token.
        assert_eq!(estimate_text("€€€€"), 1);
    }

    #[test]
    fn context_sum_matches_parts() {
        let msgs = ["hello", "world!"];
        let total = estimate_messages(msgs.iter().copied());
        assert_eq!(total, estimate_message("hello") + estimate_message("world!"));
    }
}
