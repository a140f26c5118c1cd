use std::io::{self, IsTerminal, Write};

use tasklane_shared::{ConversationDto, MessageRole, TaskDto, UserDto};
use unicode_width::UnicodeWidthStr;

use crate::chat::{EntryKind, TranscriptEntry, parse_timestamp};
use crate::config::Config;

const SHORT_ID_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> Self {
        Self {
            color: cfg.color_enabled() && io::stdout().is_terminal(),
        }
    }

    pub fn plain() -> Self {
        Self { color: false }
    }

    #[tracing::instrument(skip(self, tasks))]
    pub fn print_task_table(&self, tasks: &[TaskDto]) -> anyhow::Result<()> {
        self.write_task_table(io::stdout().lock(), tasks)
    }

    pub fn write_task_table<W: Write>(&self, mut out: W, tasks: &[TaskDto]) -> anyhow::Result<()> {
        if tasks.is_empty() {
            writeln!(out, "No tasks.")?;
            return Ok(());
        }

        let headers = vec![
            "ID".to_string(),
            "Done".to_string(),
            "Title".to_string(),
            "Description".to_string(),
            "Updated".to_string(),
        ];

        let rows = tasks
            .iter()
            .map(|task| {
                let done = if task.is_completed {
                    self.paint("[x]", "32")
                } else {
                    "[ ]".to_string()
                };
                vec![
                    self.paint(&short_id(&task.task_id.to_string()), "33"),
                    done,
                    task.title.clone(),
                    task.description.clone(),
                    format_timestamp(&task.updated_at),
                ]
            })
            .collect();

        write_table(&mut out, headers, rows)
    }

    #[tracing::instrument(skip(self, task))]
    pub fn print_task(&self, verb: &str, task: &TaskDto) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        let mark = if task.is_completed { "[x]" } else { "[ ]" };
        writeln!(
            out,
            "{verb} {} {mark} {}",
            self.paint(&short_id(&task.task_id.to_string()), "33"),
            task.title
        )?;
        Ok(())
    }

    pub fn print_user(&self, user: &UserDto) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "user_id   {}", user.user_id)?;
        writeln!(out, "email     {}", user.email)?;
        writeln!(out, "username  {}", user.username)?;
        writeln!(out, "active    {}", if user.is_active { "yes" } else { "no" })?;
        if !user.created_at.is_empty() {
            writeln!(out, "created   {}", format_timestamp(&user.created_at))?;
        }
        Ok(())
    }

    pub fn print_conversations(
        &self,
        conversations: &[ConversationDto],
        selected: Option<i64>,
    ) -> anyhow::Result<()> {
        self.write_conversations(io::stdout().lock(), conversations, selected)
    }

    pub fn write_conversations<W: Write>(
        &self,
        mut out: W,
        conversations: &[ConversationDto],
        selected: Option<i64>,
    ) -> anyhow::Result<()> {
        if conversations.is_empty() {
            writeln!(out, "No conversations.")?;
            return Ok(());
        }

        let headers = vec![
            " ".to_string(),
            "ID".to_string(),
            "Last activity".to_string(),
            "Started".to_string(),
        ];
        let rows = conversations
            .iter()
            .map(|conversation| {
                let marker = if Some(conversation.id) == selected {
                    self.paint("*", "36")
                } else {
                    String::new()
                };
                vec![
                    marker,
                    conversation.id.to_string(),
                    format_timestamp(&conversation.last_activity),
                    format_timestamp(&conversation.created_at),
                ]
            })
            .collect();

        write_table(&mut out, headers, rows)
    }

    pub fn print_transcript(&self, entries: &[TranscriptEntry]) -> anyhow::Result<()> {
        self.write_transcript(io::stdout().lock(), entries)
    }

    pub fn write_transcript<W: Write>(
        &self,
        mut out: W,
        entries: &[TranscriptEntry],
    ) -> anyhow::Result<()> {
        for entry in entries {
            let (label, code) = match (entry.kind, entry.role) {
                (EntryKind::ToolInvocation, _) => ("tool", "35"),
                (EntryKind::ErrorPlaceholder, _) => ("error", "31"),
                (EntryKind::Message, MessageRole::User) => ("you", "36"),
                (EntryKind::Message, MessageRole::Assistant) => ("assistant", "32"),
            };
            writeln!(out, "{}: {}", self.paint(label, code), entry.content)?;
        }
        Ok(())
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

pub fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

fn format_timestamp(raw: &str) -> String {
    parse_timestamp(raw)
        .map(|at| {
            at.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_else(|| raw.to_string())
}

fn write_table<W: Write>(
    mut writer: W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(header.as_str()));
    }

    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for idx in 0..column_count {
        write!(writer, "{:width$} ", headers[idx], width = widths[idx])?;
    }
    writeln!(writer)?;

    for width in &widths {
        write!(writer, "{:-<width$} ", "", width = *width)?;
    }
    writeln!(writer)?;

    for row in rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = widths[idx].saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}
