use std::future::Future;
use std::io::{self, Write};

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::debug;

const PROMPT: &str = "User > ";

#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Exit,
    Skip,
    Query(&'a str),
}

pub fn parse_line(line: &str) -> Command<'_> {
    let line = line.trim();
    if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
        Command::Exit
    } else if line.is_empty() {
        Command::Skip
    } else {
        Command::Query(line)
    }
}

/// Reads queries line by line until `exit`/`quit`, end of input, or
/// `interrupt` resolves. Empty lines are skipped. An interrupt during a
/// query abandons that query.
pub async fn run_loop<R, I, F, Fut>(input: R, interrupt: I, mut on_query: F) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    I: Future,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut lines = input.lines();
    tokio::pin!(interrupt);

    loop {
        print!("{PROMPT}");
        io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut interrupt => {
                println!("\nEnding session.");
                return Ok(());
            }
        };

        let Some(line) = line else {
            println!("\nEnding session.");
            return Ok(());
        };

        match parse_line(&line) {
            Command::Exit => {
                println!("Ending session.");
                return Ok(());
            }
            Command::Skip => continue,
            Command::Query(query) => {
                debug!(query, "dispatching query");
                tokio::select! {
                    _ = on_query(query.to_string()) => {}
                    _ = &mut interrupt => {
                        println!("\nEnding session.");
                        return Ok(());
                    }
                }
            }
        }
    }
}
