use colored::Colorize;

/// A line/column position in the source module (both 1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }

    pub fn at_line(line: u32) -> Self {
        Self { line, column: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A diagnostic accumulated on the program while compiling. Messages never
/// abort the pipeline by themselves; stages check `Program::any_errors`
/// before running.
#[derive(Debug, Clone)]
pub struct Message {
    pub loc: Option<Location>,
    pub severity: Severity,
    pub text: String,
}

impl Message {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            loc: None,
            severity: Severity::Info,
            text: text.into(),
        }
    }

    pub fn error(loc: Location, text: impl Into<String>) -> Self {
        Self {
            loc: Some(loc),
            severity: Severity::Error,
            text: text.into(),
        }
    }

    pub fn error_at_line(line: u32, text: impl Into<String>) -> Self {
        Self::error(Location::at_line(line), text)
    }

    /// The rendering used by both the JSON dump and the stdout echo.
    pub fn render(&self) -> String {
        match self.loc {
            Some(loc) => format!("Line Number {} [{}]: {}.", loc.line, self.severity, self.text),
            None => format!("[{}]: {}.", self.severity, self.text),
        }
    }

    pub fn print(&self) {
        let rendered = self.severity.to_string();
        let severity = match self.severity {
            Severity::Info => rendered.as_str().normal(),
            Severity::Warning => rendered.as_str().yellow(),
            Severity::Error => rendered.as_str().red(),
        };

        match self.loc {
            Some(loc) => println!("Line Number {} [{}]: {}.", loc.line, severity, self.text),
            None => println!("[{}]: {}.", severity, self.text),
        }
    }
}

/// Orders messages by source position; messages without a location keep
/// their relative order at the end.
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by_key(|m| m.loc.map_or((u32::MAX, u32::MAX), |l| (l.line, l.column)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_location_and_severity() {
        let message = Message::error(Location::new(3, 7), "The variable `x` is not defined");
        assert_eq!(
            message.render(),
            "Line Number 3 [Error]: The variable `x` is not defined."
        );

        let message = Message::info("Completed compilation");
        assert_eq!(message.render(), "[Info]: Completed compilation.");
    }

    #[test]
    fn sorts_by_line_then_column() {
        let mut messages = vec![
            Message::error(Location::new(2, 5), "b"),
            Message::info("end"),
            Message::error(Location::new(1, 9), "a"),
            Message::error(Location::new(2, 1), "c"),
        ];

        sort_messages(&mut messages);

        let texts: Vec<_> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["a", "c", "b", "end"]);
    }
}
