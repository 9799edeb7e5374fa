//! Rendering of log streams and the interactive build watch.

use chrono::SecondsFormat;
use dialoguer::console::{measure_text_width, Style, Term};
use std::collections::VecDeque;
use std::io::{self, Write};

use crate::api::{Build, LogConsumer, LogEntry, LogSource, LogStage};
use crate::ValarError;

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const FALLBACK_WIDTH: usize = 80;

/// The remote side of a build watch.
pub(crate) trait BuildLogSource {
    fn inspect_build(&self, project: &str, service: &str, id: &str) -> Result<Build, ValarError>;

    fn build_logs(
        &self,
        project: &str,
        service: &str,
        id: &str,
        follow: bool,
        consumer: &mut LogConsumer<'_>,
    ) -> Result<(), ValarError>;
}

/// A progress display with a one-line description and a scrolling detail panel.
pub(crate) trait WatchDisplay {
    fn describe(&mut self, message: &str) -> Result<(), ValarError>;
    fn add_detail(&mut self, line: &str) -> Result<(), ValarError>;
    fn finish(&mut self, message: &str) -> Result<(), ValarError>;
}

#[derive(Debug, Clone)]
pub(crate) struct LogFormatter {
    width: usize,
    color: bool,
}

impl LogFormatter {
    pub(crate) fn new(width: usize, color: bool) -> Self {
        LogFormatter { width, color }
    }

    pub(crate) fn for_terminal(term: &Term) -> Self {
        let width = if term.is_term() {
            usize::from(term.size().1)
        } else {
            FALLBACK_WIDTH
        };
        LogFormatter::new(width, term.is_term() && dialoguer::console::colors_enabled())
    }

    fn style(&self, style: Style) -> Style {
        style.force_styling(self.color)
    }

    pub(crate) fn success(&self, text: &str) -> String {
        self.style(Style::new().green()).apply_to(text).to_string()
    }

    pub(crate) fn failure(&self, text: &str) -> String {
        self.style(Style::new().red()).apply_to(text).to_string()
    }

    /// Renders `entry` into physical terminal lines of at most `width` columns.
    pub(crate) fn format(&self, entry: &LogEntry) -> Vec<String> {
        let prefix = format!(
            "│ {} │ ",
            entry.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let (label, content_style) = match (entry.source, entry.stage) {
            (LogSource::Wrapper, LogStage::Unspecified) => ("→ ", Style::new().white()),
            (LogSource::Wrapper, LogStage::Setup) => ("setup ↗ ", Style::new().green()),
            (LogSource::Wrapper, LogStage::Turndown) => ("turndown ↘ ", Style::new().yellow()),
            _ => ("", Style::new()),
        };
        let prefix_style = self.style(Style::new().black().bright());
        let content_style = self.style(content_style);
        let label_width = measure_text_width(label);
        let block = self
            .width
            .saturating_sub(measure_text_width(&prefix) + label_width)
            .max(1);

        let mut lines = Vec::new();
        for chunk in wrap(&entry.content, block) {
            let lead = if lines.is_empty() {
                content_style.apply_to(label).to_string()
            } else {
                " ".repeat(label_width)
            };
            lines.push(format!(
                "{}{}{}",
                prefix_style.apply_to(&prefix),
                lead,
                content_style.apply_to(chunk)
            ));
        }
        lines
    }
}

// Splits on embedded newlines, then into chunks of at most `block` columns.
// A single char wider than `block` still gets a chunk of its own.
fn wrap(content: &str, block: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut buf = [0u8; 4];
    for segment in content.split('\n') {
        let segment = segment.trim_end_matches('\r');
        if segment.is_empty() {
            chunks.push(String::new());
            continue;
        }
        let mut chunk = String::new();
        let mut used = 0;
        for c in segment.chars() {
            let width = measure_text_width(c.encode_utf8(&mut buf));
            if used + width > block && !chunk.is_empty() {
                chunks.push(std::mem::take(&mut chunk));
                used = 0;
            }
            chunk.push(c);
            used += width;
        }
        chunks.push(chunk);
    }
    chunks
}

fn stage_description(stage: LogStage) -> &'static str {
    match stage {
        LogStage::Unspecified => "Processing ...",
        LogStage::Setup => "Setting up build environment ...",
        LogStage::Turndown => "Turning down build environment ...",
    }
}

/// Prints log entries to stdout as they arrive, either formatted or raw.
pub(crate) struct LogPrinter {
    formatter: LogFormatter,
    raw: bool,
}

impl LogPrinter {
    pub(crate) fn new(formatter: LogFormatter, raw: bool) -> Self {
        LogPrinter { formatter, raw }
    }

    pub(crate) fn print(&self, entry: &LogEntry) -> Result<(), ValarError> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        if self.raw {
            writeln!(out, "{}", entry.content)?;
        } else {
            for line in self.formatter.format(entry) {
                writeln!(out, "{line}")?;
            }
        }
        out.flush()?;
        Ok(())
    }
}

/// Follows the build log until the server closes the stream and reports the final status.
pub(crate) fn watch_build<S, D>(
    source: &S,
    display: &mut D,
    formatter: &LogFormatter,
    project: &str,
    service: &str,
    id: &str,
) -> Result<Build, ValarError>
where
    S: BuildLogSource + ?Sized,
    D: WatchDisplay + ?Sized,
{
    let build = source.inspect_build(project, service, id)?;
    if build.status == "scheduled" {
        display.describe("Scheduling build onto worker ...")?;
    }

    source.build_logs(project, service, id, true, &mut |entry| {
        display.describe(stage_description(entry.stage))?;
        for line in formatter.format(&entry) {
            display.add_detail(&line)?;
        }
        Ok(())
    })?;

    let build = source.inspect_build(project, service, id)?;
    let message = match build.status.as_str() {
        "done" => formatter.success("Build has succeeded."),
        "failed" => formatter.failure("Build has failed."),
        other => format!("Build finished with status {other}."),
    };
    display.finish(&message)?;
    Ok(build)
}

/// Spinner plus detail panel on a terminal, redrawn in place. Falls back to
/// plain line output when stdout is not a terminal.
pub(crate) struct TermWatchDisplay {
    term: Term,
    interactive: bool,
    description: String,
    details: VecDeque<String>,
    max_details: usize,
    drawn: usize,
    frame: usize,
}

impl TermWatchDisplay {
    pub(crate) fn new(term: Term) -> Self {
        let interactive = term.is_term();
        let max_details = if interactive {
            usize::from(term.size().0).saturating_sub(2).max(1)
        } else {
            0
        };
        TermWatchDisplay {
            term,
            interactive,
            description: String::new(),
            details: VecDeque::new(),
            max_details,
            drawn: 0,
            frame: 0,
        }
    }

    fn redraw(&mut self, spinner: bool) -> Result<(), ValarError> {
        if self.drawn > 0 {
            self.term.clear_last_lines(self.drawn)?;
        }
        let mut drawn = 0;
        if spinner {
            let frame = SPINNER_FRAMES[self.frame % SPINNER_FRAMES.len()];
            self.frame += 1;
            self.term
                .write_line(&format!("{frame} {}", self.description))?;
            drawn += 1;
        }
        for line in &self.details {
            self.term.write_line(line)?;
            drawn += 1;
        }
        if !spinner {
            self.term.write_line(&self.description)?;
            drawn += 1;
        }
        self.drawn = drawn;
        Ok(())
    }
}

impl WatchDisplay for TermWatchDisplay {
    fn describe(&mut self, message: &str) -> Result<(), ValarError> {
        if !self.interactive {
            if self.description != message {
                self.term.write_line(message)?;
            }
            self.description = message.to_string();
            return Ok(());
        }
        self.description = message.to_string();
        self.redraw(true)
    }

    fn add_detail(&mut self, line: &str) -> Result<(), ValarError> {
        if !self.interactive {
            self.term.write_line(line)?;
            return Ok(());
        }
        self.details.push_back(line.to_string());
        while self.details.len() > self.max_details {
            self.details.pop_front();
        }
        self.redraw(true)
    }

    fn finish(&mut self, message: &str) -> Result<(), ValarError> {
        self.description = message.to_string();
        if !self.interactive {
            self.term.write_line(message)?;
            return Ok(());
        }
        self.redraw(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::cell::RefCell;

    fn entry(source: LogSource, stage: LogStage, content: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            source,
            stage,
            content: content.to_string(),
        }
    }

    const PREFIX: &str = "│ 2024-01-01T00:00:00Z │ ";

    #[test]
    fn wraps_long_content_with_continuation_prefix() {
        let formatter = LogFormatter::new(40, false);
        let lines = formatter.format(&entry(LogSource::Process, LogStage::Unspecified, &"x".repeat(30)));

        assert_eq!(measure_text_width(PREFIX), 25);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], format!("{PREFIX}{}", "x".repeat(15)));
        assert_eq!(lines[1], format!("{PREFIX}{}", "x".repeat(15)));
    }

    #[test]
    fn wrapper_setup_gets_label_and_blank_continuation() {
        let formatter = LogFormatter::new(40, false);
        let lines = formatter.format(&entry(LogSource::Wrapper, LogStage::Setup, "abcdefghij"));

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], format!("{PREFIX}setup ↗ abcdefg"));
        assert_eq!(lines[1], format!("{PREFIX}        hij"));
        for line in &lines {
            assert!(measure_text_width(line) <= 40);
        }
    }

    #[test]
    fn labels_follow_source_and_stage() {
        let formatter = LogFormatter::new(120, false);
        let wrapper = formatter.format(&entry(LogSource::Wrapper, LogStage::Unspecified, "a"));
        let turndown = formatter.format(&entry(LogSource::Wrapper, LogStage::Turndown, "a"));
        let process = formatter.format(&entry(LogSource::Process, LogStage::Setup, "a"));
        assert_eq!(wrapper[0], format!("{PREFIX}→ a"));
        assert_eq!(turndown[0], format!("{PREFIX}turndown ↘ a"));
        assert_eq!(process[0], format!("{PREFIX}a"));
    }

    #[test]
    fn empty_content_still_renders_one_line() {
        let formatter = LogFormatter::new(40, false);
        let lines = formatter.format(&entry(LogSource::Unspecified, LogStage::Unspecified, ""));
        assert_eq!(lines, vec![PREFIX.to_string()]);
    }

    #[test]
    fn narrow_terminal_still_makes_progress() {
        let formatter = LogFormatter::new(10, false);
        let lines = formatter.format(&entry(LogSource::Process, LogStage::Unspecified, "abc"));
        assert_eq!(lines.len(), 3);
        assert!(lines[2].ends_with('c'));
    }

    #[test]
    fn embedded_newlines_start_continuation_lines() {
        let formatter = LogFormatter::new(80, false);
        let lines = formatter.format(&entry(LogSource::Wrapper, LogStage::Unspecified, "one\ntwo"));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], format!("{PREFIX}  two"));
    }

    #[test]
    fn colored_output_measures_like_plain() {
        let formatter = LogFormatter::new(40, true);
        let lines = formatter.format(&entry(LogSource::Wrapper, LogStage::Setup, "abcdefghij"));
        assert!(lines[0].contains('\u{1b}'));
        assert_eq!(measure_text_width(&lines[0]), 40);
    }

    #[test]
    fn wide_characters_wrap_by_columns() {
        let formatter = LogFormatter::new(40, false);
        let lines = formatter.format(&entry(LogSource::Process, LogStage::Unspecified, &"日本語".repeat(10)));

        // 15 columns of room hold seven double-width chars
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], format!("{PREFIX}日本語日本語日"));
        for line in &lines {
            assert!(measure_text_width(line) <= 40, "too wide: {line}");
        }
        let rejoined: String = lines.iter().map(|line| &line[PREFIX.len()..]).collect();
        assert_eq!(rejoined, "日本語".repeat(10));
    }

    #[test]
    fn char_wider_than_block_still_advances() {
        let formatter = LogFormatter::new(10, false);
        let lines = formatter.format(&entry(LogSource::Process, LogStage::Unspecified, "日本"));
        assert_eq!(lines, vec![format!("{PREFIX}日"), format!("{PREFIX}本")]);
    }

    #[test]
    fn continuation_lines_share_first_line_colors() {
        let formatter = LogFormatter::new(40, true);
        let lines = formatter.format(&entry(
            LogSource::Wrapper,
            LogStage::Setup,
            "abcdefghijklmnopq",
        ));
        let prefix = Style::new().black().bright().force_styling(true).apply_to(PREFIX);
        let green = Style::new().green().force_styling(true);

        assert_eq!(
            lines,
            vec![
                format!("{prefix}{}{}", green.apply_to("setup ↗ "), green.apply_to("abcdefg")),
                format!("{prefix}{}{}", " ".repeat(8), green.apply_to("hijklmn")),
                format!("{prefix}{}{}", " ".repeat(8), green.apply_to("opq")),
            ]
        );
        assert!(lines.iter().all(|line| measure_text_width(line) <= 40));
    }

    #[derive(Default)]
    struct FakeSource {
        statuses: RefCell<Vec<String>>,
        entries: Vec<LogEntry>,
        follow_requests: RefCell<Vec<bool>>,
    }

    impl BuildLogSource for FakeSource {
        fn inspect_build(&self, _project: &str, _service: &str, id: &str) -> Result<Build, ValarError> {
            let status = self.statuses.borrow_mut().remove(0);
            Ok(Build {
                id: id.to_string(),
                status,
                ..Build::default()
            })
        }

        fn build_logs(
            &self,
            _project: &str,
            _service: &str,
            _id: &str,
            follow: bool,
            consumer: &mut LogConsumer<'_>,
        ) -> Result<(), ValarError> {
            self.follow_requests.borrow_mut().push(follow);
            for entry in &self.entries {
                consumer(entry.clone())?;
            }
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum DisplayCall {
        Describe(String),
        Detail(String),
        Finish(String),
    }

    #[derive(Default)]
    struct RecordingDisplay {
        calls: Vec<DisplayCall>,
    }

    impl WatchDisplay for RecordingDisplay {
        fn describe(&mut self, message: &str) -> Result<(), ValarError> {
            self.calls.push(DisplayCall::Describe(message.to_string()));
            Ok(())
        }

        fn add_detail(&mut self, line: &str) -> Result<(), ValarError> {
            self.calls.push(DisplayCall::Detail(line.to_string()));
            Ok(())
        }

        fn finish(&mut self, message: &str) -> Result<(), ValarError> {
            self.calls.push(DisplayCall::Finish(message.to_string()));
            Ok(())
        }
    }

    fn source(statuses: &[&str], entries: Vec<LogEntry>) -> FakeSource {
        FakeSource {
            statuses: RefCell::new(statuses.iter().map(|s| s.to_string()).collect()),
            entries,
            ..FakeSource::default()
        }
    }

    #[test]
    fn watch_reports_stages_and_success() {
        let source = source(
            &["scheduled", "done"],
            vec![
                entry(LogSource::Wrapper, LogStage::Setup, "pull"),
                entry(LogSource::Process, LogStage::Unspecified, "compile"),
            ],
        );
        let formatter = LogFormatter::new(80, false);
        let mut display = RecordingDisplay::default();

        let build = watch_build(&source, &mut display, &formatter, "p", "s", "b1").unwrap();

        assert_eq!(build.status, "done");
        assert_eq!(*source.follow_requests.borrow(), vec![true]);
        assert_eq!(
            display.calls,
            vec![
                DisplayCall::Describe("Scheduling build onto worker ...".to_string()),
                DisplayCall::Describe("Setting up build environment ...".to_string()),
                DisplayCall::Detail(format!("{PREFIX}setup ↗ pull")),
                DisplayCall::Describe("Processing ...".to_string()),
                DisplayCall::Detail(format!("{PREFIX}compile")),
                DisplayCall::Finish("Build has succeeded.".to_string()),
            ]
        );
    }

    #[test]
    fn watch_reports_failure_without_scheduling_message() {
        let source = source(
            &["building", "failed"],
            vec![entry(LogSource::Wrapper, LogStage::Turndown, "cleanup")],
        );
        let formatter = LogFormatter::new(80, false);
        let mut display = RecordingDisplay::default();

        let build = watch_build(&source, &mut display, &formatter, "p", "s", "b1").unwrap();

        assert_eq!(build.status, "failed");
        assert_eq!(
            display.calls.first(),
            Some(&DisplayCall::Describe("Turning down build environment ...".to_string()))
        );
        assert_eq!(
            display.calls.last(),
            Some(&DisplayCall::Finish("Build has failed.".to_string()))
        );
    }

    #[test]
    fn watch_names_unexpected_final_status() {
        let source = source(&["building", "aborted"], Vec::new());
        let formatter = LogFormatter::new(80, false);
        let mut display = RecordingDisplay::default();

        watch_build(&source, &mut display, &formatter, "p", "s", "b1").unwrap();

        assert_eq!(
            display.calls,
            vec![DisplayCall::Finish("Build finished with status aborted.".to_string())]
        );
    }
}
