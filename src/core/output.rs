//! Compact output rendering helpers for the report surfaces.

/// Collapse whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// Render `label: count` pairs as a single summary line, largest first.
pub fn counted_summary(counts: &[(String, usize)]) -> String {
    let mut sorted: Vec<&(String, usize)> = counts.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    sorted
        .iter()
        .map(|(label, count)| format!("{} x{}", label, count))
        .collect::<Vec<_>>()
        .join(", ")
}
