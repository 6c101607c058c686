//! Line-annotated source excerpts for errors and suspensions

const CARETS: &str = "^^^^^^^^^^";

fn render_line(out: &mut Vec<String>, number: usize, text: &str, marked: bool) {
    let marker = if marked { ">" } else { " " };
    out.push(format!("{} {:03} | {}", marker, number, text));
}

/// Whole script with the failing line marked and a caret under `column`
pub fn error_excerpt(source: &str, line: u32, column: Option<u32>) -> String {
    let mut out = Vec::new();
    for (idx, text) in source.lines().enumerate() {
        let number = idx + 1;
        let marked = number == line as usize;
        render_line(&mut out, number, text, marked);
        if marked {
            let column = column.unwrap_or(1).max(1) as usize;
            out.push(format!("{}{}", " ".repeat(8 + column - 1), CARETS));
        }
    }
    out.join("\n")
}

/// Script up to and including the line where execution paused
pub fn signal_excerpt(source: &str, line: u32) -> String {
    let mut out = Vec::new();
    for (idx, text) in source.lines().enumerate().take(line.max(1) as usize) {
        let number = idx + 1;
        render_line(&mut out, number, text, number == line as usize);
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "let a = 1;\nlet b = boom();\nlet c = 3;";

    #[test]
    fn test_error_excerpt_marks_line_and_column() {
        let excerpt = error_excerpt(SOURCE, 2, Some(9));
        let lines: Vec<&str> = excerpt.lines().collect();
        assert_eq!(lines[0], "  001 | let a = 1;");
        assert_eq!(lines[1], "> 002 | let b = boom();");
        assert_eq!(lines[2], "                ^^^^^^^^^^");
        assert_eq!(lines[3], "  003 | let c = 3;");
        assert_eq!(lines[2].find('^'), Some(16));
        assert_eq!(&lines[1][16..20], "boom");
    }

    #[test]
    fn test_error_excerpt_without_column() {
        let excerpt = error_excerpt(SOURCE, 1, None);
        assert_eq!(excerpt.lines().nth(1), Some("        ^^^^^^^^^^"));
    }

    #[test]
    fn test_signal_excerpt_truncates_after_line() {
        let excerpt = signal_excerpt(SOURCE, 2);
        assert_eq!(excerpt, "  001 | let a = 1;\n> 002 | let b = boom();");
    }
}
