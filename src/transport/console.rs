use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use color_print::cformat;
use eyre::Result;
use rustyline::{CompletionType, Config, Editor};

use super::{Command, render_reply};
use crate::relay::conversation_state::{ImageAttachment, UserId};
use crate::relay::{ChatRelay, RelayError};

const WELCOME_TEXT: &str = "
Step tutor console. Ask a question and get a step-by-step answer.

/image <path> [caption]   Ask about an image file
/start                    Start the conversation over
/help                     Show the help dialogue
/quit                     Quit the application
";

const HELP_TEXT: &str = "
/image <path> [caption]   Ask about an image file (~ and relative paths work)
/start                    Start the conversation over
/help                     Show this help dialogue
/quit                     Quit the application
";

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Local terminal session that talks to the relay as a single user.
pub struct ConsoleSession {
    output: Box<dyn Write + Send>,
    input: Option<String>,
    relay: Arc<ChatRelay>,
    user_id: UserId,
}

impl ConsoleSession {
    pub fn new(
        output: Box<dyn Write + Send>,
        input: Option<String>,
        relay: Arc<ChatRelay>,
        user_id: UserId,
    ) -> Self {
        Self {
            output,
            input,
            relay,
            user_id,
        }
    }

    pub async fn run(&mut self) -> Result<ExitCode> {
        // Single question mode
        if let Some(input) = self.input.take() {
            self.handle_input(&input).await?;
            return Ok(ExitCode::SUCCESS);
        }

        writeln!(self.output, "{}", WELCOME_TEXT)?;
        self.run_interactive().await?;

        Ok(ExitCode::SUCCESS)
    }

    async fn run_interactive(&mut self) -> Result<()> {
        let mut rl = editor()?;

        loop {
            match rl.readline("> ") {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }

                    rl.add_history_entry(line.as_str());

                    match self.handle_input(&line).await {
                        Ok(Flow::Quit) => break,
                        Ok(Flow::Continue) => {}
                        Err(e) => writeln!(self.output, "Error: {}", e)?,
                    }
                }
                Err(rustyline::error::ReadlineError::Interrupted)
                | Err(rustyline::error::ReadlineError::Eof) => break,
                Err(e) => {
                    writeln!(self.output, "Error: {}", e)?;
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_input(&mut self, input: &str) -> Result<Flow> {
        let input = input.trim();

        if let Some(args) = input.strip_prefix("/image") {
            if args.is_empty() || args.starts_with(char::is_whitespace) {
                let reply = self.ask_about_image(args.trim()).await;
                self.print_reply(&reply)?;
                return Ok(Flow::Continue);
            }
        }

        match Command::parse(input) {
            Some(Command::Quit) => return Ok(Flow::Quit),
            Some(Command::Start) => {
                let greeting = self.relay.reset(self.user_id).await;
                self.print_reply(&greeting)?;
            }
            Some(Command::Help) => writeln!(self.output, "{}", HELP_TEXT)?,
            Some(Command::Unknown) => {
                writeln!(self.output, "Unknown command. Type /help for the list.")?
            }
            None => {
                let result = self.relay.handle_text(self.user_id, input).await;
                let reply = render_reply(self.user_id, result);
                self.print_reply(&reply)?;
            }
        }

        Ok(Flow::Continue)
    }

    async fn ask_about_image(&self, args: &str) -> String {
        let (path, caption) = match args.split_once(char::is_whitespace) {
            Some((path, caption)) => (path, Some(caption.trim())),
            None => (args, None),
        };

        if path.is_empty() {
            return "Usage: /image <path> [caption]".to_string();
        }

        let path = resolve_image_path(path);
        let result = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                let image = ImageAttachment::from_file_name(file_name, bytes);
                self.relay.handle_image(self.user_id, image, caption).await
            }
            Err(e) => Err(RelayError::MediaFetch(format!("{}: {}", path.display(), e))),
        };

        render_reply(self.user_id, result)
    }

    fn print_reply(&mut self, reply: &str) -> Result<()> {
        writeln!(self.output, "{}", cformat!("<green>{}</>", reply))?;
        Ok(())
    }
}

/// `~` and `~/...` are taken from the home directory, anything relative
/// from the working directory.
fn resolve_image_path(raw: &str) -> PathBuf {
    let home_relative = if raw == "~" { Some("") } else { raw.strip_prefix("~/") };
    let path = match (home_relative, dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(raw),
    };

    if path.is_absolute() {
        return path;
    }
    std::env::current_dir()
        .map(|dir| dir.join(&path))
        .unwrap_or(path)
}

fn editor() -> rustyline::Result<Editor<()>> {
    let config = Config::builder()
        .history_ignore_space(true)
        .completion_type(CompletionType::List)
        .build();
    Editor::with_config(config)
}
