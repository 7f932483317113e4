use std::io::BufRead;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    wire::{self, LineReader, SEPARATOR, SERVER_PREFIX, Signal},
};

const LEFT: &str = "You have left the chat room.";
const LOST: &str = "Connection lost.";
const KICKED: &str = "You were kicked out of the chat room.";

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    let mut input = spawn_stdin_reader();

    let farewell = run_client_loop(&mut reader, &mut writer, &mut input).await?;
    write_stdout(SEPARATOR).await?;
    write_stdout(farewell).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(LineReader<BufReader<OwnedReadHalf>>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((LineReader::new(BufReader::new(reader)), writer))
}

/// Reads the terminal on a plain thread so a pending read never holds up
/// runtime shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Runs until the session ends and returns the line explaining why.
async fn run_client_loop(
    reader: &mut LineReader<BufReader<OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
    input: &mut mpsc::Receiver<String>,
) -> Result<&'static str> {
    let mut accepted = false;

    loop {
        select! {
            incoming = reader.next_line() => {
                let line = match incoming {
                    Ok(Some(line)) => line,
                    Ok(None) => return Ok(LOST),
                    Err(err) => {
                        warn!(error = %err, "failed to read from server");
                        return Ok(LOST);
                    }
                };
                match Signal::classify(&line) {
                    Signal::Accepted => accepted = true,
                    Signal::Kicked => return Ok(KICKED),
                    Signal::Text(text) => {
                        if accepted || text.starts_with(SERVER_PREFIX) {
                            write_stdout(text).await?;
                        }
                    }
                }
            }
            typed = input.recv() => {
                let Some(typed) = typed else {
                    // Terminal closed: leave the room the polite way.
                    let _ = wire::write_line(writer, "-exit").await;
                    return Ok(LEFT);
                };
                let text = typed.trim();
                if let Err(err) = wire::write_line(writer, text).await {
                    warn!(error = %err, "failed to send line");
                    return Ok(LOST);
                }
                if accepted && text == "-exit" {
                    return Ok(LEFT);
                }
            }
        }
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
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
