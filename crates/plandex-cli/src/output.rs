use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use plandex_stream::{StreamState, UiEvent};
use serde::Serialize;
use std::io::Write;

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub(crate) fn format_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%b %-d %H:%M").to_string()
}

/// Signed token count, e.g. `+120 🪙`.
pub(crate) fn token_delta(n: i64) -> String {
    if n >= 0 {
        format!("+{n} 🪙")
    } else {
        format!("{n} 🪙")
    }
}

/// What still has to be printed when a rejoined stream replays the reply as
/// `full`. `None` when the replay diverges from what is already on screen.
fn unseen_suffix<'a>(shown: &str, full: &'a str) -> Option<&'a str> {
    full.strip_prefix(shown)
}

/// Renders streamed turn events on the terminal. Silent in JSON mode; the
/// command prints a single result object when the turn ends.
pub(crate) struct StreamPrinter {
    json: bool,
    mid_line: bool,
    shown: String,
}

impl StreamPrinter {
    pub(crate) fn new(json: bool) -> Self {
        Self {
            json,
            mid_line: false,
            shown: String::new(),
        }
    }

    fn print_reply(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        print!("{text}");
        let _ = std::io::stdout().flush();
        self.mid_line = !text.ends_with('\n');
    }

    fn end_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }

    pub(crate) fn on_event(&mut self, event: &UiEvent) {
        if self.json {
            return;
        }
        match event {
            UiEvent::Reply(chunk) => {
                self.print_reply(chunk);
                self.shown.push_str(chunk);
            }
            UiEvent::ReplyReset(full) => {
                match unseen_suffix(&self.shown, full) {
                    Some(rest) => self.print_reply(rest),
                    None => {
                        self.end_line();
                        eprintln!("🔄 Reconnected");
                        self.print_reply(full);
                    }
                }
                self.shown = full.clone();
            }
            UiEvent::LoadingContext(files) => {
                self.end_line();
                eprintln!("📥 Loading {} file(s) into context...", files.len());
            }
            UiEvent::AutoLoaded(report) => {
                self.end_line();
                if !report.is_empty() {
                    eprintln!("{report}");
                }
            }
            UiEvent::RepliesFinished => self.end_line(),
            UiEvent::State(StreamState::Describing) => {
                self.end_line();
                eprintln!("📝 Describing changes...");
            }
            UiEvent::State(StreamState::Canceled) => {
                self.end_line();
                eprintln!("🛑 Stopped");
            }
            UiEvent::State(_) => {}
            UiEvent::Description(desc) => {
                self.end_line();
                if !desc.commit_msg.trim().is_empty() {
                    println!("✏️  {}", desc.commit_msg.trim());
                }
            }
            UiEvent::BuildInfo(info) => {
                self.end_line();
                if info.removed {
                    eprintln!("  🗑️  {} (removed)", info.path);
                } else if info.finished {
                    eprintln!("  ✅ {}", info.path);
                } else {
                    eprintln!("  🏗️  {} | {} 🪙", info.path, info.num_tokens);
                }
            }
            UiEvent::MissingFile(path) => {
                self.end_line();
                eprintln!("📄 The model asked for {path}, which isn't in context");
            }
            UiEvent::LoadedContext(contexts) => {
                self.end_line();
                let names: Vec<&str> = contexts.iter().map(|c| c.display_name()).collect();
                eprintln!("📥 Loaded into context: {}", names.join(", "));
            }
            UiEvent::Error(msg) => {
                self.end_line();
                eprintln!("🚨 {msg}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_delta_is_signed() {
        assert_eq!(token_delta(12), "+12 🪙");
        assert_eq!(token_delta(0), "+0 🪙");
        assert_eq!(token_delta(-4), "-4 🪙");
    }

    #[test]
    fn replayed_replies_only_print_what_is_new() {
        assert_eq!(unseen_suffix("hello ", "hello world"), Some("world"));
        assert_eq!(unseen_suffix("", "hello"), Some("hello"));
        assert_eq!(unseen_suffix("hello", "hello"), Some(""));
        assert_eq!(unseen_suffix("goodbye", "hello"), None);
    }

    #[test]
    fn printer_tracks_the_reply_across_a_replay() {
        let mut printer = StreamPrinter::new(false);
        printer.on_event(&UiEvent::Reply("hello ".to_string()));
        printer.on_event(&UiEvent::ReplyReset("hello there".to_string()));
        printer.on_event(&UiEvent::Reply("!".to_string()));
        assert_eq!(printer.shown, "hello there!");
    }
}
