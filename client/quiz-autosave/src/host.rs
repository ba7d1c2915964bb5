//! Line-oriented host that drives a controller from text commands.

use crate::models::SessionMetadataUpdate;
use crate::services::AutosaveController;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    Answer {
        question_id: String,
        answers: Vec<String>,
    },
    Flag {
        question_id: String,
        flagged: bool,
    },
    Page(u32),
    Answered(u32),
    Save,
    Retry,
    Status,
    Quit,
}

pub const HELP: &str = "commands: answer <q> <a1,a2> | flag <q> on|off | page <n> | \
answered <n> | save | retry | status | quit";

impl HostCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().ok_or_else(|| "empty command".to_string())?;
        let args: Vec<&str> = parts.collect();

        let command = match (verb, args.as_slice()) {
            ("answer", [question, answers]) => HostCommand::Answer {
                question_id: question.to_string(),
                answers: answers
                    .split(',')
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect(),
            },
            ("answer", [question]) => HostCommand::Answer {
                question_id: question.to_string(),
                answers: Vec::new(),
            },
            ("flag", [question, state]) => HostCommand::Flag {
                question_id: question.to_string(),
                flagged: match *state {
                    "on" | "true" | "1" => true,
                    "off" | "false" | "0" => false,
                    other => return Err(format!("expected on/off, got '{}'", other)),
                },
            },
            ("page", [n]) => HostCommand::Page(parse_number(n)?),
            ("answered", [n]) => HostCommand::Answered(parse_number(n)?),
            ("save", []) => HostCommand::Save,
            ("retry", []) => HostCommand::Retry,
            ("status", []) => HostCommand::Status,
            ("quit" | "exit", []) => HostCommand::Quit,
            _ => return Err(format!("unrecognised command '{}'", line.trim())),
        };
        Ok(command)
    }
}

fn parse_number(value: &str) -> Result<u32, String> {
    value
        .parse::<u32>()
        .map_err(|_| format!("expected a number, got '{}'", value))
}

/// Per-question edits the host remembers so that `flag` keeps the selected
/// answers and `answer` keeps the flag, as a quiz page would.
#[derive(Debug, Default)]
pub struct HostSession {
    questions: std::collections::HashMap<String, (Vec<String>, bool)>,
}

impl HostSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one command. Returns `false` when the host should stop.
    pub async fn apply(&mut self, controller: &AutosaveController, command: HostCommand) -> bool {
        match command {
            HostCommand::Answer {
                question_id,
                answers,
            } => {
                let entry = self.questions.entry(question_id.clone()).or_default();
                entry.0 = answers.clone();
                let flagged = entry.1;
                controller.add_change(question_id, answers, flagged);
                let answered = self.answered_count();
                controller.update_session(SessionMetadataUpdate::default().total_answered(answered));
            }
            HostCommand::Flag {
                question_id,
                flagged,
            } => {
                let entry = self.questions.entry(question_id.clone()).or_default();
                entry.1 = flagged;
                let answers = entry.0.clone();
                controller.add_change(question_id, answers, flagged);
                let flagged_count = self.flagged_count();
                controller
                    .update_session(SessionMetadataUpdate::default().flagged_count(flagged_count));
            }
            HostCommand::Page(page) => {
                controller.update_session(SessionMetadataUpdate::default().current_page(page));
            }
            HostCommand::Answered(n) => {
                controller.update_session(SessionMetadataUpdate::default().total_answered(n));
            }
            HostCommand::Save => match controller.force_save().await {
                Ok(()) => println!("saved"),
                Err(e) => println!("save failed: {}", e),
            },
            HostCommand::Retry => controller.retry(),
            HostCommand::Status => {
                // round-trip through the scheduler so the snapshot is current
                let _ = controller.pending_changes().await;
                let snapshot = controller.snapshot();
                println!(
                    "status={} pending={} last_saved={} error={}",
                    snapshot.status,
                    snapshot.pending_count,
                    snapshot
                        .last_saved_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                    snapshot.last_error.as_deref().unwrap_or("-")
                );
            }
            HostCommand::Quit => return false,
        }
        true
    }

    fn answered_count(&self) -> u32 {
        self.questions
            .values()
            .filter(|(answers, _)| !answers.is_empty())
            .count() as u32
    }

    fn flagged_count(&self) -> u32 {
        self.questions.values().filter(|(_, flagged)| *flagged).count() as u32
    }
}
