use std::{fmt, io};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

pub const ROSTER_PREFIX: &str = "Clientes conectados:";
pub const PRIVATE_PREFIX: &str = "Privado:";

const ROSTER_SEPARATOR: &str = ", ";
const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// A line sent by a registered client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientLine {
    Private { target: String, body: String },
    Plain(String),
}

impl ClientLine {
    /// Classifies a client line. Only lines carrying the private prefix can
    /// fail, and only when they lack a target/body separator.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        if !line.starts_with(PRIVATE_PREFIX) {
            return Ok(ClientLine::Plain(line.to_string()));
        }

        let (target, body) = split_private(line).ok_or_else(|| ProtocolError::MalformedPrivate {
            line: line.to_string(),
        })?;
        Ok(ClientLine::Private { target, body })
    }
}

impl fmt::Display for ClientLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientLine::Private { target, body } => write!(f, "{PRIVATE_PREFIX}{target}:{body}"),
            ClientLine::Plain(text) => f.write_str(text),
        }
    }
}

/// A line sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    Roster { names: Vec<String> },
    Private { sender: String, body: String },
}

impl ServerLine {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        if let Some(list) = line.strip_prefix(ROSTER_PREFIX) {
            // A trailing separator leaves an empty entry; skip it.
            let names = list
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
            return Ok(ServerLine::Roster { names });
        }

        if line.starts_with(PRIVATE_PREFIX) {
            let (sender, body) =
                split_private(line).ok_or_else(|| ProtocolError::MalformedPrivate {
                    line: line.to_string(),
                })?;
            return Ok(ServerLine::Private { sender, body });
        }

        Err(ProtocolError::UnknownServerLine {
            line: line.to_string(),
        })
    }
}

impl fmt::Display for ServerLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerLine::Roster { names } => {
                write!(f, "{ROSTER_PREFIX}{}", names.join(ROSTER_SEPARATOR))
            }
            ServerLine::Private { sender, body } => write!(f, "{PRIVATE_PREFIX}{sender}:{body}"),
        }
    }
}

/// Splits `Privado:<name>:<body>` into its name and body. The body keeps
/// any further colons.
fn split_private(line: &str) -> Option<(String, String)> {
    let mut parts = line.splitn(3, ':');
    let _prefix = parts.next()?;
    let name = parts.next()?;
    let body = parts.next()?;
    Some((name.to_string(), body.to_string()))
}

/// Reads the next line with its terminator stripped. `Ok(None)` means the
/// peer closed the stream. Empty lines are returned as empty strings.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }

    let trimmed = line.trim_end_matches(LINE_ENDINGS);
    Ok(Some(trimmed.to_string()))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // One buffer per line so a line is never split across two writes.
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
