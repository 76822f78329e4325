use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{ClientLine, ServerLine, read_line, write_line},
};

const USAGE: &str = "usage: /msg <name> <text> | /who | /quit";

/// A line typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Send(ClientLine),
    Who,
    Quit,
    Usage,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    if args.name.is_empty() || args.name.contains(['\n', '\r']) {
        bail!("display name must be a single non-empty line");
    }

    let (mut reader, mut writer) = establish_connection(&args).await?;
    write_line(&mut writer, &args.name)
        .await
        .context("failed to send registration")?;
    write_stdout(&format!("*** connected as {}", args.name)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let mut roster = Vec::new();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input, &mut roster).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(
    BufReader<tokio::net::tcp::OwnedReadHalf>,
    tokio::net::tcp::OwnedWriteHalf,
)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn run_client_loop(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    roster: &mut Vec<String>,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_line = read_line(reader) => {
                if !handle_server_line(server_line, roster).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer, roster).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_line(line: io::Result<Option<String>>, roster: &mut Vec<String>) -> Result<bool> {
    match line? {
        Some(line) => {
            write_stdout(&render_server_line(&line, roster)).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    roster: &[String],
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let Some(input) = parse_input(input.trim_end()) else {
        return Ok(true);
    };

    match input {
        Input::Send(line) => write_line(writer, &line.to_string()).await?,
        Input::Who => write_stdout(&render_roster(roster)).await?,
        Input::Usage => write_stderr(USAGE).await?,
        Input::Quit => {
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
    }
    Ok(true)
}

fn parse_input(text: &str) -> Option<Input> {
    if text.is_empty() {
        return None;
    }

    let input = match text {
        "/quit" => Input::Quit,
        "/who" => Input::Who,
        _ => match text.strip_prefix("/msg ") {
            Some(rest) => match rest.trim_start().split_once(' ') {
                Some((target, body)) if !target.is_empty() && !body.is_empty() => {
                    Input::Send(ClientLine::Private {
                        target: target.to_string(),
                        body: body.to_string(),
                    })
                }
                _ => Input::Usage,
            },
            None if text.starts_with('/') => Input::Usage,
            None => Input::Send(ClientLine::Plain(text.to_string())),
        },
    };
    Some(input)
}

/// Formats a line from the relay for the terminal, replacing the known
/// roster when the line carries one.
fn render_server_line(line: &str, roster: &mut Vec<String>) -> String {
    match ServerLine::parse(line) {
        Ok(ServerLine::Roster { names }) => {
            *roster = names;
            render_roster(roster)
        }
        Ok(ServerLine::Private { sender, body }) => format!("{sender}: {body}"),
        Err(_) => line.to_string(),
    }
}

fn render_roster(roster: &[String]) -> String {
    if roster.is_empty() {
        return "*** online: (nobody)".to_string();
    }
    format!("*** online: {}", roster.join(", "))
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut tokio::net::tcp::OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
