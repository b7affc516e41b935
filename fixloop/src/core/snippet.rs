//! Line-numbered source windows.

/// Render `window` lines above and below `line` (1-based), clamped to the
/// file bounds. A missing line centers on line 1.
///
/// Each rendered line is `{number:>5}  {text}`.
pub fn render_window(contents: &str, line: Option<u32>, window: usize) -> String {
    let lines: Vec<&str> = contents.lines().collect();
    if lines.is_empty() {
        return String::new();
    }

    let center = (line.unwrap_or(1).max(1) as usize).min(lines.len()) - 1;
    let start = center.saturating_sub(window);
    let end = (center + window).min(lines.len() - 1);

    lines[start..=end]
        .iter()
        .enumerate()
        .map(|(offset, text)| format!("{:>5}  {}", start + offset + 1, text))
        .collect::<Vec<_>>()
        .join("\n")
}
