use anyhow::Result;
use plandex_core::{ConvoMessage, MessageRole};
use serde_json::json;

use crate::context::CliContext;
use crate::output::{format_time, print_json};

fn header(msg: &ConvoMessage) -> String {
    let who = match msg.role {
        MessageRole::User => "👤 You",
        MessageRole::Assistant => "🤖 Plandex",
        MessageRole::System => "⚙️  System",
    };
    let mut line = format!("#{} | {who} | {} | {} 🪙", msg.num, format_time(msg.created_at), msg.tokens);
    if msg.stopped {
        line.push_str(" | stopped");
    }
    line
}

pub(crate) fn run_convo(ctx: &CliContext, plain: bool) -> Result<()> {
    let api = ctx.api()?;
    let plan = ctx.current_plan()?;
    let mut convo = api.list_convo(&plan.plan_id, &plan.branch)?;
    convo.sort_by_key(|m| m.num);
    if ctx.json {
        return print_json(&convo);
    }
    if convo.is_empty() {
        println!("🤷‍♂️ No conversation yet");
        return Ok(());
    }
    for msg in &convo {
        if !plain {
            println!("{}", header(msg));
        }
        println!("{}\n", msg.message.trim_end());
    }
    let total: usize = convo.iter().map(|m| m.tokens).sum();
    if !plain {
        println!("{} message(s) | {total} 🪙", convo.len());
    }
    Ok(())
}

pub(crate) fn run_log(ctx: &CliContext) -> Result<()> {
    let api = ctx.api()?;
    let plan = ctx.current_plan()?;
    let logs = api.list_logs(&plan.plan_id, &plan.branch)?;
    if ctx.json {
        return print_json(&logs);
    }
    if logs.is_empty() {
        println!("🤷‍♂️ No history yet");
        return Ok(());
    }
    for (i, entry) in logs.iter().enumerate() {
        let short = entry.sha.get(..8).unwrap_or(&entry.sha);
        let subject = entry.message.lines().next().unwrap_or_default();
        println!("{i:>3}  {short}  {}  {subject}", format_time(entry.created_at));
    }
    println!("\n`plandex rewind <n>` steps back n entries; `plandex rewind <sha>` jumps to one");
    Ok(())
}

pub(crate) fn run_summary(ctx: &CliContext) -> Result<()> {
    let api = ctx.api()?;
    let plan = ctx.current_plan()?;
    let latest = api
        .list_convo_summaries(&plan.plan_id, &plan.branch)?
        .into_iter()
        .max_by_key(|s| s.latest_convo_message_created_at);
    match latest {
        Some(summary) if ctx.json => print_json(&summary),
        Some(summary) => {
            println!(
                "Summary of {} message(s) up to {} | {} 🪙\n",
                summary.num_messages,
                format_time(summary.latest_convo_message_created_at),
                summary.tokens
            );
            println!("{}", summary.summary.trim_end());
            Ok(())
        }
        None if ctx.json => print_json(&json!(null)),
        None => {
            println!("🤷‍♂️ The conversation hasn't been summarized yet");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use plandex_core::ConvoMessageFlags;

    #[test]
    fn header_marks_stopped_replies() {
        let msg = ConvoMessage {
            id: "m1".to_string(),
            user_id: "u1".to_string(),
            role: MessageRole::Assistant,
            tokens: 42,
            num: 3,
            message: "partial".to_string(),
            stopped: true,
            flags: ConvoMessageFlags::default(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().expect("time"),
        };
        let line = header(&msg);
        assert!(line.starts_with("#3 | 🤖 Plandex"), "{line}");
        assert!(line.ends_with("42 🪙 | stopped"), "{line}");
    }
}
