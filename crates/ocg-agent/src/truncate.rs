//! Tool-result truncation.
//!
//! Oversize results keep their head and tail around an explicit marker, so
//! the model sees both the beginning (what ran) and the end (how it ended).
//! Splits land on UTF-8 character boundaries.

/// Truncate `output` to roughly `max_bytes`, preserving head and tail.
pub fn truncate_result(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_owned();
    }

    let half = max_bytes / 2;
    let head_end = floor_char_boundary(output, half);
    let tail_start = ceil_char_boundary(output, output.len() - half);
    let omitted = tail_start - head_end;

    format!(
        "{}\n\n... [RESULT TRUNCATED: {} bytes omitted] ...\n\n{}",
        &output[..head_end],
        omitted,
        &output[tail_start..]
    )
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_passes_through() {
        assert_eq!(truncate_result("ok", 64), "ok");
    }

    #[test]
    fn exact_boundary_is_not_truncated() {
        let s = "x".repeat(64);
        assert_eq!(truncate_result(&s, 64), s);
    }

    #[test]
    fn oversize_keeps_head_and_tail() {
        let input = format!("{}{}{}", "A".repeat(100), "B".repeat(1000), "C".repeat(100));
        let out = truncate_result(&input, 200);
        assert!(out.starts_with('A'));
        assert!(out.ends_with('C'));
        assert!(out.contains("RESULT TRUNCATED"));
        assert!(out.contains("bytes omitted"));
    }

    #[test]
    fn multibyte_input_never_splits_a_char() {
        let input = "é".repeat(10_000); // 2 bytes each
        let out = truncate_result(&input, 101); // odd half forces a boundary fix
        assert!(out.contains("RESULT TRUNCATED"));
        // would panic above on a bad boundary; also must stay valid UTF-8
        assert!(out.chars().all(|c| c == 'é' || c.is_ascii()));
    }
}
