//! Transcript export.
//!
//! Writes a conversation's messages to TXT, CSV or JSON files under a timestamped
//! directory: `output_dir/<timestamp>/<conversation>_<n>.<ext>`.

use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use csv::Writer;

use crate::error::Result;
use crate::models::{Conversation, Direction, Message, OutputFormat};

const TIMESTAMP_FORMAT: &str = "%b %d, %Y %r";

/// Name shown for the sender of `message`
fn sender<'a>(conversation: &'a Conversation, message: &Message) -> &'a str {
    match message.direction {
        Direction::Inbound => conversation.guest_name.as_str(),
        Direction::Outbound => message.direction.speaker(),
    }
}

/// Split into chunks of at most `rows` messages. `None` or `0` keeps one chunk.
#[must_use]
pub fn chunk_by_rows(messages: &[Message], rows: Option<usize>) -> Vec<&[Message]> {
    match rows {
        Some(rows) if rows > 0 => messages.chunks(rows).collect(),
        _ => vec![messages],
    }
}

/// Write a conversation transcript. Returns the created files; nothing is written for an
/// empty conversation.
///
/// # Errors
///
/// Returns an error if a directory or file cannot be created or written.
pub fn write_transcript(
    conversation: &Conversation,
    messages: &[Message],
    format: OutputFormat,
    output_dir: &Path,
    timestamp: &str,
    chunk_rows: Option<usize>,
) -> Result<Vec<PathBuf>> {
    if messages.is_empty() {
        return Ok(Vec::new());
    }

    let date_dir = output_dir.join(timestamp);
    create_dir_all(&date_dir)?;

    let stem = file_stem(conversation);
    let mut output_files = Vec::new();
    for (i, chunk) in chunk_by_rows(messages, chunk_rows).into_iter().enumerate() {
        let file_path = date_dir.join(format!("{stem}_{}.{}", i + 1, format.extension()));
        write_messages_to_file(conversation, chunk, format, &file_path)?;
        output_files.push(file_path);
    }

    Ok(output_files)
}

/// Write messages to one file in the given format
pub fn write_messages_to_file(
    conversation: &Conversation,
    messages: &[Message],
    format: OutputFormat,
    file_path: &Path,
) -> Result<()> {
    match format {
        OutputFormat::Txt => write_txt_file(conversation, messages, file_path),
        OutputFormat::Csv => write_csv_file(conversation, messages, file_path),
        OutputFormat::Json => write_json_file(conversation, messages, file_path),
    }
}

fn file_stem(conversation: &Conversation) -> String {
    let name: String = conversation
        .guest_name
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    let digits: String = conversation.guest_phone.chars().filter(char::is_ascii_digit).collect();
    format!("{name}_{digits}")
}

/// `sender, timestamp, content` with a blank line between messages
fn write_txt_file(conversation: &Conversation, messages: &[Message], file_path: &Path) -> Result<()> {
    let file = File::create(file_path)?;
    let mut writer = BufWriter::new(file);

    for message in messages {
        writeln!(
            writer,
            "{}, {}, {}",
            sender(conversation, message),
            message.created_at.format(TIMESTAMP_FORMAT),
            message.content
        )?;
        writeln!(writer)?;
    }

    writer.flush()?;
    Ok(())
}

fn write_csv_file(conversation: &Conversation, messages: &[Message], file_path: &Path) -> Result<()> {
    let file = File::create(file_path)?;
    let mut writer = Writer::from_writer(file);

    writer.write_record(["ID", "Sender", "Direction", "Type", "Datetime", "Message"])?;

    for (i, message) in messages.iter().enumerate() {
        writer.write_record([
            &(i + 1).to_string(),
            sender(conversation, message),
            message.direction.as_str(),
            &message.message_type,
            &message.created_at.format(TIMESTAMP_FORMAT).to_string(),
            &message.content,
        ])?;
    }

    writer.flush()?;
    Ok(())
}

fn write_json_file(conversation: &Conversation, messages: &[Message], file_path: &Path) -> Result<()> {
    let file = File::create(file_path)?;
    let writer = BufWriter::new(file);

    let json_messages: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "sender": sender(conversation, m),
                "direction": m.direction,
                "type": m.message_type,
                "timestamp": m.created_at.to_rfc3339(),
                "content": m.content,
            })
        })
        .collect();

    serde_json::to_writer_pretty(
        writer,
        &serde_json::json!({
            "conversation_id": conversation.id,
            "guest_name": conversation.guest_name,
            "guest_phone": conversation.guest_phone,
            "messages": json_messages,
        }),
    )?;
    Ok(())
}
