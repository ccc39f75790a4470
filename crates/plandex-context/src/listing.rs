use chrono::{DateTime, Local, Utc};
use plandex_core::Context;

/// Creation order, ties broken by id so numbering is stable.
pub fn sort_contexts(contexts: &mut [Context]) {
    contexts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

fn when(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%b %-d %H:%M").to_string()
}

/// Table printed by `plandex ls`. Expects `contexts` already sorted.
pub fn format_context_table(contexts: &[Context]) -> String {
    if contexts.is_empty() {
        return "🤷‍♂️ No context".to_string();
    }
    let rows: Vec<[String; 6]> = contexts
        .iter()
        .enumerate()
        .map(|(i, ctx)| {
            let name = ctx.display_name();
            let name = if ctx.context_type == plandex_core::ContextType::DirectoryTree {
                crate::tree_name(name)
            } else {
                name.to_string()
            };
            [
                (i + 1).to_string(),
                name,
                ctx.context_type.label().to_string(),
                ctx.num_tokens.to_string(),
                when(ctx.created_at),
                when(ctx.updated_at),
            ]
        })
        .collect();
    let header = ["#", "Name", "Type", "🪙", "Added", "Updated"];
    let mut widths = header.map(|h| h.chars().count());
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.chars().count());
        }
    }
    let render = |cells: Vec<&str>| {
        cells
            .iter()
            .zip(widths.iter())
            .map(|(cell, &w)| format!("{cell:<w$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };
    let mut out = vec![render(header.to_vec())];
    for row in &rows {
        out.push(render(row.iter().map(String::as_str).collect()));
    }
    let total: usize = contexts.iter().map(|c| c.num_tokens).sum();
    out.push(String::new());
    out.push(format!("Total tokens: {total}"));
    out.join("\n")
}
