// src/utils/log.rs

//! Operator-facing banners on top of the `log` facade.
//!
//! Timestamps and level filtering come from whatever logger the binary
//! installs; this module only shapes the lines.

const RULE_WIDTH: usize = 60;

fn header_lines(title: &str) -> [String; 3] {
    let border = "═".repeat(RULE_WIDTH);
    [border.clone(), format!("  {title}"), border]
}

fn summary_lines(title: &str, items: &[(&str, String)]) -> Vec<String> {
    let width = items.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    std::iter::once(format!("[SUMMARY] {title}"))
        .chain(
            items
                .iter()
                .map(|(key, value)| format!("    {key:<width$} : {value}")),
        )
        .collect()
}

/// Log a header
pub fn header(title: &str) {
    for line in header_lines(title) {
        ::log::info!("{line}");
    }
}

/// Log a sub-item (indented)
pub fn sub_item(message: &str) {
    ::log::info!("    {message}");
}

/// Log a summary section with aligned keys
pub fn summary(title: &str, items: &[(&str, String)]) {
    for line in summary_lines(title, items) {
        ::log::info!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_framed() {
        let [top, title, bottom] = header_lines("Harvest");
        assert_eq!(top, bottom);
        assert_eq!(top.chars().count(), RULE_WIDTH);
        assert_eq!(title, "  Harvest");
    }

    #[test]
    fn test_summary_aligns_keys() {
        let lines = summary_lines(
            "Run",
            &[("attempted", "12".to_string()), ("failed", "1".to_string())],
        );
        assert_eq!(lines[0], "[SUMMARY] Run");
        assert_eq!(lines[1], "    attempted : 12");
        assert_eq!(lines[2], "    failed    : 1");
    }
}
