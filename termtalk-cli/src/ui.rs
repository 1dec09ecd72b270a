//! Console output and prompts.

use std::fmt::Display;
use std::io::Write;

use anyhow::Result;
use chrono::{Local, NaiveTime};
use crossterm::style::Stylize;
use tokio::io::{BufReader, Lines, Stdin};

/// Line reader over standard input, shared by prompts and the chat loop.
pub type StdinLines = Lines<BufReader<Stdin>>;

/// Clock format prefixed to chat lines.
const TIME_FORMAT: &str = "%H:%M:%S";

/// Greeting printed once at startup.
pub fn banner() {
    println!("{}", "Welcome to TermTalk".green().bold());
    println!(
        "{}",
        "Ephemeral IDs only: no MAC, host name or system info leaves this machine.".cyan()
    );
}

/// Neutral status line.
pub fn info(msg: impl Display) {
    println!("{}", format!("[termtalk] {msg}").cyan());
}

/// Something worked.
pub fn success(msg: impl Display) {
    println!("{}", format!("[termtalk] {msg}").green());
}

/// Something the user should notice; the session goes on.
pub fn warn(msg: impl Display) {
    println!("{}", format!("[termtalk] {msg}").yellow());
}

/// Failure, on stderr.
pub fn error(msg: impl Display) {
    eprintln!("{}", format!("[termtalk] {msg}").red());
}

/// A chat line from `sender`, stamped with the local time.
pub fn message(sender: impl Display, text: &str) {
    println!(
        "{} {} {}",
        stamp(Local::now().time()).dark_grey(),
        format!("[{sender}]").magenta().bold(),
        text
    );
}

fn stamp(at: NaiveTime) -> String {
    format!("[{}]", at.format(TIME_FORMAT))
}

/// Ask a question and read one trimmed answer. `None` on end of input.
pub async fn prompt(stdin: &mut StdinLines, question: &str) -> Result<Option<String>> {
    print!("{} ", question.bold());
    std::io::stdout().flush()?;
    Ok(stdin.next_line().await?.map(|line| line.trim().to_string()))
}
