//! Text rendering of JavaScript exceptions.
//!
//! The format is
//!
//! ```text
//! <filename>:<line>
//! <offending source line>
//! <stack trace, or the exception itself when there is no stack>
//! ```
//!
//! Source lines longer than [`MAX_SOURCE_LINE`] (minified plugins) are cut
//! down to [`SOURCE_CONTEXT`] characters on each side of the error.

use std::fmt::Write;

use deno_core::v8;

pub const MAX_SOURCE_LINE: usize = 4096;
pub const SOURCE_CONTEXT: usize = 1024;

/// Format the exception caught by `tc`.
pub(crate) fn format_exception(tc: &mut v8::TryCatch<v8::HandleScope>) -> String {
    if tc.has_terminated() {
        return "Terminated\n".to_string();
    }

    let mut out = String::new();
    if let Some(message) = tc.message() {
        let filename = message
            .get_script_resource_name(tc)
            .map(|name| name.to_rust_string_lossy(tc))
            .unwrap_or_else(|| "<anonymous>".to_string());
        let line = message.get_line_number(tc).unwrap_or(0);
        let _ = writeln!(out, "{}:{}", filename, line);

        if let Some(source_line) = message.get_source_line(tc) {
            let source_line = source_line.to_rust_string_lossy(tc);
            let window = source_line_window(
                &source_line,
                message.get_start_column(),
                message.get_end_column(),
            );
            let _ = writeln!(out, "{}", window);
        }
    }

    let stack = tc.stack_trace().filter(|stack| {
        v8::Local::<v8::String>::try_from(*stack).is_ok_and(|stack| stack.length() > 0)
    });
    let detail = match stack.or_else(|| tc.exception()) {
        Some(value) => value.to_rust_string_lossy(tc),
        None => String::from("Unknown exception"),
    };
    let _ = writeln!(out, "{}", detail);
    out
}

/// Slice of `line` kept around the error columns.
pub fn source_line_window(line: &str, start_column: usize, end_column: usize) -> &str {
    if line.len() <= MAX_SOURCE_LINE {
        return line;
    }
    let from = start_column.saturating_sub(SOURCE_CONTEXT);
    let to = end_column.max(start_column).saturating_add(SOURCE_CONTEXT);
    let begin = char_to_byte(line, from);
    let end = char_to_byte(line, to);
    &line[begin..end]
}

fn char_to_byte(line: &str, chars: usize) -> usize {
    line.char_indices()
        .nth(chars)
        .map(|(byte, _)| byte)
        .unwrap_or(line.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_line_is_kept() {
        let line = "throw new Error('2333')";
        assert_eq!(source_line_window(line, 0, 5), line);
    }

    #[test]
    fn test_long_line_is_cut_around_error() {
        let mut line = "a".repeat(6000);
        line.replace_range(3000..3001, "X");

        let window = source_line_window(&line, 3000, 3001);
        assert_eq!(window.chars().count(), 2 * SOURCE_CONTEXT + 1);
        assert!(window.contains('X'));
    }

    #[test]
    fn test_window_clamps_at_line_edges() {
        let line = "b".repeat(5000);
        assert_eq!(source_line_window(&line, 10, 12).len(), 12 + SOURCE_CONTEXT);
        assert_eq!(
            source_line_window(&line, 4990, 4995).len(),
            5000 - (4990 - SOURCE_CONTEXT)
        );
    }

    #[test]
    fn test_window_respects_char_boundaries() {
        let line = "é".repeat(5000);
        let window = source_line_window(&line, 2000, 2001);
        assert_eq!(window.chars().count(), 2 * SOURCE_CONTEXT + 1);
    }
}
