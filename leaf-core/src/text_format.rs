//! Plain and best-effort formatted text built from positioned text runs.
//!
//! The formatted pass clusters runs into lines by baseline, orders them top to
//! bottom and left to right, then glues lines into paragraphs. The paragraph
//! rules are heuristics and are expected to misjudge unusual layouts.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::document::TextRun;

const LINE_TOLERANCE: f32 = 5.0;
const WIDE_GAP: f32 = 8.0;
const NARROW_GAP: f32 = 2.0;

static SECTION_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][a-z]+ \d+").expect("valid heading pattern"));
static NUMBERED_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.").expect("valid list pattern"));
static EXTRA_NEWLINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("valid newline pattern"));
static EXTRA_SPACES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]{2,}").expect("valid space pattern"));

pub fn plain_text(runs: &[TextRun]) -> String {
    runs.iter()
        .flat_map(|run| run.text.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

struct Line<'a> {
    y: f32,
    runs: Vec<&'a TextRun>,
}

pub fn formatted_text(runs: &[TextRun]) -> String {
    let mut lines: Vec<Line<'_>> = Vec::new();
    for run in runs {
        let y = run.y.round();
        match lines
            .iter_mut()
            .find(|line| (line.y - y).abs() < LINE_TOLERANCE)
        {
            Some(line) => line.runs.push(run),
            None => lines.push(Line { y, runs: vec![run] }),
        }
    }

    lines.sort_by(|a, b| b.y.total_cmp(&a.y));

    let rendered: Vec<String> = lines
        .into_iter()
        .map(render_line)
        .filter(|line| !line.is_empty())
        .collect();

    join_paragraphs(&rendered)
}

pub fn tidy_for_display(text: &str) -> String {
    let text = EXTRA_NEWLINES.replace_all(text, "\n\n");
    EXTRA_SPACES.replace_all(&text, " ").trim().to_owned()
}

fn render_line(mut line: Line<'_>) -> String {
    line.runs.sort_by(|a, b| a.x.total_cmp(&b.x));

    let mut out = String::new();
    let mut last: Option<&TextRun> = None;
    for run in line.runs {
        let text = run.text.trim();
        if text.is_empty() {
            continue;
        }
        if let Some(prev) = last {
            let gap = run.x - (prev.x + prev.width);
            if needs_space(prev, run, gap) {
                out.push(' ');
            }
        }
        out.push_str(text);
        last = Some(run);
    }
    out.trim().to_owned()
}

fn needs_space(prev: &TextRun, current: &TextRun, gap: f32) -> bool {
    if gap > WIDE_GAP {
        return true;
    }
    if prev.text.ends_with(' ') || prev.text.ends_with('-') {
        return false;
    }
    if current
        .text
        .starts_with(|c: char| c.is_whitespace() || ".,;:!?)".contains(c))
    {
        return false;
    }
    if prev.text.ends_with(|c: char| c == '(' || c == '[') {
        return false;
    }

    let font_changed = prev.font_name != current.font_name;
    let size_changed = (prev.font_size - current.font_size).abs() > 1.0;
    if (font_changed || size_changed) && gap > NARROW_GAP {
        return true;
    }

    gap > NARROW_GAP
        && prev.text.ends_with(|c: char| c.is_ascii_alphabetic())
        && current.text.starts_with(|c: char| c.is_ascii_alphabetic())
}

fn join_paragraphs(lines: &[String]) -> String {
    let mut paragraphs = Vec::new();
    let mut current = String::new();

    for (idx, line) in lines.iter().enumerate() {
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(line);

        let next = lines.get(idx + 1).map(String::as_str);
        if ends_paragraph(line, next) {
            paragraphs.push(current.trim().to_owned());
            current.clear();
        }
    }

    paragraphs.join("\n\n")
}

fn ends_paragraph(line: &str, next: Option<&str>) -> bool {
    let Some(next) = next else {
        return true;
    };
    if line.ends_with(|c: char| matches!(c, '.' | '!' | '?' | ':')) {
        return true;
    }
    let len = line.chars().count();
    if len < 40 || (len < 60 && next.chars().count() < 60) {
        return true;
    }
    next.starts_with('"') || SECTION_HEADING.is_match(next) || NUMBERED_ITEM.is_match(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(text: &str, x: f32, y: f32, width: f32) -> TextRun {
        TextRun {
            text: text.to_owned(),
            x,
            y,
            width,
            font_size: 12.0,
            font_name: Some("Times".to_owned()),
        }
    }

    #[test]
    fn plain_text_collapses_whitespace() {
        let runs = vec![run("  The  quick ", 0.0, 0.0, 10.0), run("brown\nfox ", 0.0, 0.0, 10.0)];
        assert_eq!(plain_text(&runs), "The quick brown fox");
        assert_eq!(plain_text(&[]), "");
    }

    #[test]
    fn lines_are_ordered_top_to_bottom_and_left_to_right() {
        let runs = vec![
            run("second", 10.0, 100.0, 30.0),
            run("Heading", 10.0, 700.0, 40.0),
            run("line", 60.0, 102.0, 20.0),
        ];
        assert_eq!(formatted_text(&runs), "Heading\n\nsecond line");
    }

    #[test]
    fn hyphenated_runs_are_joined_without_space() {
        let runs = vec![run("co-", 0.0, 10.0, 15.0), run("operate", 20.0, 10.0, 30.0)];
        assert_eq!(formatted_text(&runs), "co-operate");
    }

    #[test]
    fn long_lines_flow_into_one_paragraph() {
        let first = "This line is deliberately long enough to avoid the short rule";
        let second = "and this one continues the very same sentence until the end.";
        let runs = vec![run(first, 0.0, 200.0, 300.0), run(second, 0.0, 180.0, 300.0)];
        assert_eq!(formatted_text(&runs), format!("{first} {second}"));
    }

    #[test]
    fn numbered_item_starts_a_new_paragraph() {
        let first = "Before the list there is a long introduction line that keeps going";
        let runs = vec![
            run(first, 0.0, 200.0, 300.0),
            run("1. first item of the list that is also fairly long to read", 0.0, 180.0, 300.0),
        ];
        let text = formatted_text(&runs);
        assert!(text.contains("\n\n1. first item"));
    }

    #[test]
    fn display_tidy_collapses_runs_of_blank_lines() {
        assert_eq!(tidy_for_display("a\n\n\n\nb   c"), "a\n\nb c");
    }
}
