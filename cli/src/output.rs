use colored::{ColoredString, Colorize};
use std::fmt::Display;

/// One-line status message kinds. Info, warnings and errors go to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Hint,
    Info,
    Warn,
    Error,
    Success
}

impl Status {
    fn tag(self) -> ColoredString {
        match self {
            Self::Hint => "hint:".cyan().bold(),
            Self::Info => "info:".blue().bold(),
            Self::Warn => "warning:".yellow().bold(),
            Self::Error => "error:".red().bold(),
            Self::Success => "✓".green().bold()
        }
    }

    fn to_stderr(self) -> bool {
        matches!(self, Self::Info | Self::Warn | Self::Error)
    }

    fn render(self, msg: &str) -> String {
        match self {
            Self::Hint => format!("{} {}", self.tag(), msg.dimmed()),
            _ => format!("{} {}", self.tag(), msg)
        }
    }

    fn emit(self, msg: &str) {
        let line = self.render(msg);
        if self.to_stderr() {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }
}

fn render_field(label: &str, value: impl Display) -> String {
    format!("  {:<15} {}", format!("{label}:").dimmed(), value)
}

pub fn header(title: &str) {
    println!("{}", title.bold().underline());
}

pub fn subheader(title: &str) {
    println!("{}", title.bold());
}

/// Aligned `label: value` line under a (sub)header.
pub fn field(label: &str, value: impl Display) {
    println!("{}", render_field(label, value));
}

pub fn hint(msg: &str) {
    Status::Hint.emit(msg);
}

pub fn info(msg: &str) {
    Status::Info.emit(msg);
}

pub fn warn(msg: &str) {
    Status::Warn.emit(msg);
}

pub fn error(msg: &str) {
    Status::Error.emit(msg);
}

pub fn success(msg: &str) {
    Status::Success.emit(msg);
}
