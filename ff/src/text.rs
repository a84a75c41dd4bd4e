//! Small text helpers for backend and verification output

/// Keep at most `max` bytes of `text`, cut on a char boundary
pub fn truncate_output(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let cut = floor_boundary(text, max);
    format!("{}...\n[truncated, {} chars total]", &text[..cut], text.len())
}

/// Keep the last `max` bytes of `text`, cut on a char boundary
///
/// Test and lint failures usually report the useful part at the end.
pub fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Combine stdout and stderr the way the user would read them
pub fn combine_streams(stdout: &str, stderr: &str) -> String {
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (true, _) => stderr.to_string(),
        (_, true) => stdout.to_string(),
        _ => format!("{}\n\nSTDERR:\n{}", stdout, stderr),
    }
}

fn floor_boundary(text: &str, mut index: usize) -> usize {
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_text_unchanged() {
        assert_eq!(truncate_output("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_long_text() {
        let out = truncate_output("abcdefghij", 4);
        assert_eq!(out, "abcd...\n[truncated, 10 chars total]");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        // each 'é' is two bytes
        let out = truncate_output("éééé", 3);
        assert!(out.starts_with("é..."));
        assert_eq!(tail("éééé", 3), "é");
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("line1\nline2\nline3", 5), "line3");
        assert_eq!(tail("abc", 10), "abc");
    }

    #[test]
    fn test_combine_streams() {
        assert_eq!(combine_streams("out", ""), "out");
        assert_eq!(combine_streams("", "err"), "err");
        assert_eq!(combine_streams("out", "err"), "out\n\nSTDERR:\nerr");
    }
}
