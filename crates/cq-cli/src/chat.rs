//! Interactive chat mode with readline support.

use std::path::PathBuf;

use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::history::FileHistory;
use rustyline::{Config, Editor};

use cq_core::{CancellationToken, Conversation, Question, Role};

use crate::output::{cancel_on_interrupt, render, EventPrinter};

/// Chat commands
#[derive(Debug, PartialEq)]
enum ChatCommand {
    Quit,
    Clear,
    History,
    Help,
    Tools,
    Usage,
    Model(String),
    Unknown(String),
    Ask(String), // Regular message
}

fn parse_command(input: &str) -> ChatCommand {
    let trimmed = input.trim();

    if !trimmed.starts_with('/') {
        return ChatCommand::Ask(trimmed.to_string());
    }

    let (cmd, arg) = match trimmed.split_once(' ') {
        Some((cmd, arg)) => (cmd.to_lowercase(), arg.trim().to_string()),
        None => (trimmed.to_lowercase(), String::new()),
    };

    match cmd.as_str() {
        "/quit" | "/exit" | "/q" => ChatCommand::Quit,
        "/clear" | "/c" => ChatCommand::Clear,
        "/history" | "/h" => ChatCommand::History,
        "/help" | "/?" => ChatCommand::Help,
        "/tools" | "/t" => ChatCommand::Tools,
        "/usage" | "/u" => ChatCommand::Usage,
        "/model" | "/m" => ChatCommand::Model(arg),
        _ => ChatCommand::Unknown(cmd),
    }
}

fn print_help() {
    println!(
        r#"
Chat Commands:
  /help, /?       Show this help message
  /quit, /exit    Exit chat mode
  /clear, /c      Clear conversation history (keeps the system instruction)
  /history, /h    Show message counts
  /tools, /t      List available tools
  /usage, /u      Show token usage so far
  /model <name>   Use a different model for the following questions

Tips:
  - Press Ctrl+C to cancel the current answer
  - Press Ctrl+D to exit
  - Up/Down arrows navigate history
"#
    );
}

/// Run interactive chat mode
pub async fn run_chat(mut conversation: Conversation, verbose: bool) -> Result<()> {
    let config = Config::builder()
        .history_ignore_space(true)
        .history_ignore_dups(true)?
        .build();

    let history_path = get_history_path();
    let mut rl: Editor<(), FileHistory> = Editor::with_config(config)?;

    if let Some(path) = &history_path {
        let _ = rl.load_history(path);
    }

    let mut model = conversation.config().default_model.clone();

    println!("Chat mode started. Type /help for commands, /quit to exit.\n");

    loop {
        match rl.readline("you> ") {
            Ok(line) => {
                let _ = rl.add_history_entry(&line);

                match parse_command(&line) {
                    ChatCommand::Quit => {
                        println!("Goodbye!");
                        break;
                    }
                    ChatCommand::Clear => {
                        conversation.clear_history();
                        println!("Conversation cleared.\n");
                    }
                    ChatCommand::History => print_history(&conversation),
                    ChatCommand::Help => print_help(),
                    ChatCommand::Tools => print_tools(&conversation),
                    ChatCommand::Usage => {
                        let usage = conversation.usage();
                        println!(
                            "Tokens: {} prompt, {} completion, {} total\n",
                            usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
                        );
                    }
                    ChatCommand::Model(name) => {
                        if name.is_empty() {
                            match &model {
                                Some(m) => println!("Current model: {}\n", m),
                                None => println!("Using the backend's default model.\n"),
                            }
                        } else {
                            println!("Model set to {}.\n", name);
                            model = Some(name);
                        }
                    }
                    ChatCommand::Unknown(cmd) => {
                        eprintln!("Unknown command: {}. Type /help for available commands.", cmd);
                    }
                    ChatCommand::Ask(text) => {
                        if text.is_empty() {
                            continue;
                        }
                        ask(&mut conversation, text, model.as_deref(), verbose).await?;
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                break;
            }
        }
    }

    if let Some(path) = &history_path {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let _ = rl.save_history(path);
    }

    Ok(())
}

/// Ask one question and print its answer. Failures are reported, not returned.
async fn ask(conversation: &mut Conversation, text: String, model: Option<&str>, verbose: bool) -> Result<()> {
    let token = CancellationToken::new();
    let mut question = Question::new(text).with_cancellation(token.clone());
    if let Some(model) = model {
        question = question.with_model(model);
    }

    let interrupt = cancel_on_interrupt(token);
    println!();
    let answer = render(conversation.ask(question), EventPrinter::terminal(verbose)).await;
    interrupt.abort();
    let answer = answer?;

    if let Some((kind, message)) = &answer.failure {
        tracing::debug!(?kind, "Question failed");
        if kind.is_transient() {
            eprintln!("\nError: {} (you can ask again)", message);
        } else {
            eprintln!("\nError: {}", message);
        }
    }
    println!();
    Ok(())
}

fn print_history(conversation: &Conversation) {
    let count = |role: Role| conversation.history().iter().filter(|m| m.role == role).count();
    println!(
        "Messages in conversation: {} ({} user, {} assistant, {} tool)\n",
        conversation.history().len(),
        count(Role::User),
        count(Role::Assistant),
        count(Role::Tool)
    );
}

fn print_tools(conversation: &Conversation) {
    let definitions = conversation.capabilities().advertise();
    if definitions.is_empty() {
        println!("No tools enabled.\n");
        return;
    }
    println!("\nAvailable tools:");
    for def in definitions {
        println!("  {} - {}", def.name, def.description);
    }
    println!();
}

fn get_history_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cq").join("chat_history"))
}
