use super::prompts::{ADD_MORE_ID, CONFIRM_NO_ID, CONFIRM_YES_ID, SUBMIT_ID};
use crate::models::MessageBody;

/// Reserved inputs recognized regardless of what the conversation is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartOver,
    Cancel,
    Submit,
    AddMore,
    Sell,
}

const START_OVER: [&str; 3] = ["start over", "restart", "reset"];
const CANCEL: [&str; 3] = ["cancel", "stop", "quit"];

pub fn classify(body: &MessageBody) -> Option<Command> {
    match body {
        MessageBody::Choice { id, .. } => match id.as_str() {
            SUBMIT_ID => Some(Command::Submit),
            ADD_MORE_ID => Some(Command::AddMore),
            _ => None,
        },
        MessageBody::Text(text) => {
            let normalized = normalize(text);
            if START_OVER.contains(&normalized.as_str()) {
                Some(Command::StartOver)
            } else if CANCEL.contains(&normalized.as_str()) {
                Some(Command::Cancel)
            } else if normalized == "submit" {
                Some(Command::Submit)
            } else if normalized == "sell" {
                Some(Command::Sell)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Yes/no answer to the account-creation question, from a button or text.
pub fn affirmation(body: &MessageBody) -> Option<bool> {
    match body {
        MessageBody::Choice { id, .. } if id == CONFIRM_YES_ID => Some(true),
        MessageBody::Choice { id, .. } if id == CONFIRM_NO_ID => Some(false),
        MessageBody::Text(text) => match normalize(text).as_str() {
            "yes" | "y" | "yeah" | "yep" | "ok" | "okay" => Some(true),
            "no" | "n" | "nope" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Minimal shape check; the directory is the real authority.
pub fn looks_like_email(text: &str) -> bool {
    let trimmed = text.trim();
    !trimmed.contains(char::is_whitespace) && trimmed.contains('@') && trimmed.contains('.')
}

fn normalize(text: &str) -> String {
    text.trim()
        .trim_end_matches(['.', '!'])
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
