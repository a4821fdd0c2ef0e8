/// Join the last `keep` lines of captured output into a single summary,
/// bounded to `max_chars`. Used to turn an agent's stderr into a readable
/// failure message on an execution row.
pub fn tail_summary(lines: &[String], keep: usize, max_chars: usize) -> String {
    let start = lines.len().saturating_sub(keep);
    let mut summary = lines[start..].join("\n");
    if summary.len() > max_chars {
        // cut on a char boundary from the end, the tail is the useful part
        let cut = summary.len() - max_chars;
        let boundary = (cut..summary.len())
            .find(|i| summary.is_char_boundary(*i))
            .unwrap_or(summary.len());
        summary = summary[boundary..].to_string();
    }
    summary
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn keeps_only_the_tail() {
        let lines: Vec<String> = (1..=10).map(|i| format!("line {i}")).collect();
        let s = tail_summary(&lines, 3, 1000);
        assert_eq!(s, "line 8\nline 9\nline 10");
    }

    #[test]
    fn bounds_total_length() {
        let lines = vec!["x".repeat(500), "y".repeat(500)];
        let s = tail_summary(&lines, 10, 100);
        assert_eq!(s.len(), 100);
        assert!(s.ends_with('y'));
    }

    #[test]
    fn empty_input_yields_empty_summary() {
        assert_eq!(tail_summary(&[], 5, 100), "");
    }
}
