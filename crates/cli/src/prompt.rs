//! Terminal confirmation for interactive sessions

use owo_colors::OwoColorize;
use rampart_core::Decision;
use rampart_journal::{ConfirmationGate, ConfirmationRequest};
use std::io::{BufRead, BufReader, Stdin, Write};

/// Shows each diff on stderr and asks before the change is written.
///
/// Anything but an explicit yes declines, including end of input.
pub struct PromptGate<R> {
    input: R,
}

impl PromptGate<BufReader<Stdin>> {
    pub fn stdin() -> Self {
        Self {
            input: BufReader::new(std::io::stdin()),
        }
    }
}

impl<R: BufRead> PromptGate<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }
}

impl<R: BufRead + Send> ConfirmationGate for PromptGate<R> {
    fn confirm(&mut self, request: &ConfirmationRequest<'_>) -> Decision {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(
            err,
            "\n{} {} {}",
            "Change".bold(),
            request.target.id.cyan(),
            format!("({}, {})", request.target.kind, request.target.criticality).dimmed()
        );
        if request.diff.is_empty() {
            let _ = writeln!(err, "  {}", "(content unchanged)".dimmed());
        }
        for line in request.diff.lines() {
            let _ = if line.starts_with("+++") || line.starts_with("---") {
                writeln!(err, "{}", line.bold())
            } else if line.starts_with('+') {
                writeln!(err, "{}", line.green())
            } else if line.starts_with('-') {
                writeln!(err, "{}", line.red())
            } else if line.starts_with("@@") {
                writeln!(err, "{}", line.cyan())
            } else {
                writeln!(err, "{line}")
            };
        }
        let _ = write!(err, "Apply this change? [y/N] ");
        let _ = err.flush();

        let mut answer = String::new();
        match self.input.read_line(&mut answer) {
            Ok(0) | Err(_) => Decision::Decline,
            Ok(_) => parse_answer(&answer),
        }
    }
}

fn parse_answer(answer: &str) -> Decision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Decision::Approve,
        _ => Decision::Decline,
    }
}
