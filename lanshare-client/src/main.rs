use std::{
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use lanshare_client::{
    Action, ApiClient, AssumeAnswer, ClientConfig, ClientError, Confirm, FileService, Notice,
    Notifier, Synchronizer, delete_all_sequential, settings, spawn_transport, upload_batch,
};
use lanshare_core::{ConnectionState, FileStats, Locale, MessageKey, SyncEvent};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{error, info, warn};

const SEND_ECHO_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "lanshare", version, about = "Share files and messages on the local network")]
struct ClientArgs {
    #[arg(long, default_value = "http://127.0.0.1:5000")]
    server: String,
    #[arg(long, default_value_t = 300_000)]
    upload_timeout_ms: u64,
    /// Pause between files of one upload batch; never below 500.
    #[arg(long, default_value_t = 500)]
    upload_delay_ms: u64,
    /// Answer yes to every confirmation.
    #[arg(long, short = 'y', default_value_t = false)]
    yes: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow live events; stdin lines become chat messages or slash commands.
    Watch,
    List,
    Messages,
    /// Print the address other devices should open.
    Info,
    Send {
        #[arg(required = true)]
        text: Vec<String>,
    },
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    Delete {
        filename: String,
    },
    ClearAll,
    ClearMessages,
    Download {
        filename: String,
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Show or set the display language (en, zh).
    Lang {
        locale: Option<Locale>,
    },
}

struct CliNotifier {
    locale: Locale,
}

impl Notifier for CliNotifier {
    fn notify(&self, notice: Notice) {
        if let Notice::UploadProgress { percent, .. } = &notice {
            if percent % 10 != 0 {
                return;
            }
        }
        let line = notice.render(self.locale);
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }
}

struct StdinConfirm {
    locale: Locale,
}

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: MessageKey) -> bool {
        print!("{} [y/N] ", self.locale.text(prompt));
        let _ = io::stdout().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        is_yes(&answer)
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = ClientArgs::parse();
    let saved = settings::load_settings();
    let locale = saved.locale();

    match run(args, locale).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: ClientArgs, locale: Locale) -> Result<ExitCode, ClientError> {
    let mut config = ClientConfig::new(&args.server)?
        .with_upload_delay(Duration::from_millis(args.upload_delay_ms));
    config.upload_timeout = Duration::from_millis(args.upload_timeout_ms);

    let notifier = Arc::new(CliNotifier { locale });
    let confirm: Arc<dyn Confirm> = if args.yes {
        Arc::new(AssumeAnswer(true))
    } else {
        Arc::new(StdinConfirm { locale })
    };
    let api = ApiClient::new(config.clone())?;

    match args.command.unwrap_or(Command::Watch) {
        Command::Watch => watch(api, config, notifier, args.yes).await,
        Command::List => {
            let files = api.fetch_files().await?;
            let stats = FileStats::from_records(&files);
            notifier.notify(Notice::Listing { files, stats });
            Ok(ExitCode::SUCCESS)
        }
        Command::Messages => {
            let messages = api.fetch_messages().await?;
            println!("{}", locale.text(MessageKey::Messages));
            if messages.is_empty() {
                println!("{}", locale.text(MessageKey::NoMessages));
            }
            for message in messages {
                notifier.notify(Notice::NewMessage(message));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Info => {
            let info = api.fetch_info().await?;
            println!("{} {}", locale.text(MessageKey::ServerUrl), info.url);
            Ok(ExitCode::SUCCESS)
        }
        Command::Send { text } => send_once(&config, &text.join(" ")).await,
        Command::Upload { paths } => {
            let outcomes = upload_batch(&api, &paths, config.upload_delay, &notifier).await;
            if outcomes.iter().all(|outcome| outcome.is_success()) {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Delete { filename } => {
            if !confirm.confirm(MessageKey::ConfirmDeleteFile) {
                return Ok(ExitCode::SUCCESS);
            }
            match api.delete_file(&filename).await {
                Ok(()) => {
                    notifier.notify(Notice::FileDeletedSuccess { filename });
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    notifier.notify(Notice::DeleteFailed {
                        filename,
                        reason: err.to_string(),
                    });
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::ClearAll => {
            let files = api.fetch_files().await?;
            if files.is_empty() {
                println!("{}", locale.text(MessageKey::NoFiles));
                return Ok(ExitCode::SUCCESS);
            }
            if !confirm.confirm(MessageKey::ConfirmDeleteAll) {
                return Ok(ExitCode::SUCCESS);
            }
            let requested = files.len();
            let filenames = files.into_iter().map(|file| file.filename).collect();
            let deleted = delete_all_sequential(&api, filenames, notifier.as_ref()).await;
            Ok(if deleted == requested {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::ClearMessages => {
            api.clear_messages().await?;
            notifier.notify(Notice::MessagesCleared);
            Ok(ExitCode::SUCCESS)
        }
        Command::Download { filename, output } => {
            let dest = match output {
                Some(dest) => dest,
                None => default_download_path(&api, &filename).await?,
            };
            let bytes = api.download_file(&filename, &dest).await?;
            println!("{} ({})", dest.display(), lanshare_core::format_file_size(bytes));
            Ok(ExitCode::SUCCESS)
        }
        Command::Lang { locale: requested } => {
            let Some(requested) = requested else {
                println!("{locale}");
                return Ok(ExitCode::SUCCESS);
            };
            let path = settings::settings_path();
            let updated = settings::SavedSettings {
                language: Some(requested),
            };
            match settings::save_settings_with_retry(&path, &updated) {
                Ok(()) => {
                    info!(path = %path.display(), locale = %requested, "language saved");
                    println!("{requested}");
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    eprintln!("failed to save settings: {err}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

/// Saves under the original upload name in the working directory.
async fn default_download_path(api: &ApiClient, filename: &str) -> Result<PathBuf, ClientError> {
    let files = api.fetch_files().await?;
    let original = files
        .into_iter()
        .find(|file| file.filename == filename)
        .map(|file| file.original_name)
        .ok_or_else(|| ClientError::Download(format!("{filename}: File not found")))?;
    let name = Path::new(&original)
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| filename.into());
    Ok(PathBuf::from(name))
}

/// Connects, sends one chat message and waits for the server's echo.
async fn send_once(config: &ClientConfig, text: &str) -> Result<ExitCode, ClientError> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (transport, task) = spawn_transport(config.ws_url()?, events_tx);

    let outcome = tokio::time::timeout(SEND_ECHO_TIMEOUT, async {
        let mut sent: Option<String> = None;
        while let Some(event) = events_rx.recv().await {
            match event {
                SyncEvent::ConnectionStateChanged(ConnectionState::Connected) if sent.is_none() => {
                    if !transport.send_message(text)? {
                        return Ok(false);
                    }
                    sent = Some(text.trim().to_owned());
                }
                SyncEvent::NewMessage(message) if sent.as_deref() == Some(message.text.as_str()) => {
                    return Ok(true);
                }
                _ => {}
            }
        }
        Ok::<bool, ClientError>(false)
    })
    .await;
    task.abort();

    match outcome {
        Ok(Ok(_)) => Ok(ExitCode::SUCCESS),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(ClientError::Connection(format!(
            "no confirmation from server within {SEND_ECHO_TIMEOUT:?}"
        ))),
    }
}

async fn watch(
    api: ApiClient,
    config: ClientConfig,
    notifier: Arc<CliNotifier>,
    yes: bool,
) -> Result<ExitCode, ClientError> {
    let locale = notifier.locale;
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (transport, transport_task) = spawn_transport(config.ws_url()?, events_tx);
    let (actions_tx, actions_rx) = mpsc::unbounded_channel();

    // Prompts are answered on the line reader below before an action is queued.
    let synchronizer = Synchronizer::new(
        Arc::new(api),
        notifier,
        Arc::new(AssumeAnswer(true)),
        transport,
        config,
    );
    let runner = tokio::spawn(synchronizer.run(events_rx, actions_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!("stdin read failed: {err}");
                break;
            }
        };

        let action = match parse_line(&line) {
            LineCommand::Quit => break,
            LineCommand::Help => {
                println!("{WATCH_HELP}");
                continue;
            }
            LineCommand::Unknown(command) => {
                println!("unknown command {command}\n{WATCH_HELP}");
                continue;
            }
            LineCommand::Action(action) => action,
        };

        let prompt = match &action {
            Action::Delete(_) => Some(MessageKey::ConfirmDeleteFile),
            Action::ClearAllFiles => Some(MessageKey::ConfirmDeleteAll),
            _ => None,
        };
        if let Some(prompt) = prompt {
            if !yes && !ask(&mut lines, locale, prompt).await {
                continue;
            }
        }

        if actions_tx.send(action).is_err() {
            break;
        }
    }

    drop(actions_tx);
    let result = runner.await;
    transport_task.abort();
    match result {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            error!("synchronizer task failed: {err}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn ask<R>(lines: &mut tokio::io::Lines<R>, locale: Locale, prompt: MessageKey) -> bool
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    print!("{} [y/N] ", locale.text(prompt));
    let _ = io::stdout().flush();
    match lines.next_line().await {
        Ok(Some(answer)) => is_yes(&answer),
        _ => false,
    }
}

const WATCH_HELP: &str = "commands: /upload <paths..>  /delete <filename>  /clear-all  /clear  \
/files  /refresh  /help  /quit  (any other line is sent as a message)";

#[derive(Debug, PartialEq, Eq)]
enum LineCommand {
    Action(Action),
    Help,
    Quit,
    Unknown(String),
}

fn parse_line(line: &str) -> LineCommand {
    let trimmed = line.trim();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return LineCommand::Action(Action::SendMessage(line.to_owned()));
    };

    let mut parts = rest.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();
    match command {
        "upload" if !args.is_empty() => {
            LineCommand::Action(Action::Upload(args.into_iter().map(PathBuf::from).collect()))
        }
        "delete" if args.len() == 1 => LineCommand::Action(Action::Delete(args[0].to_owned())),
        "clear-all" => LineCommand::Action(Action::ClearAllFiles),
        "clear" => LineCommand::Action(Action::ClearMessages),
        "files" => LineCommand::Action(Action::ShowFiles),
        "refresh" => LineCommand::Action(Action::Refresh),
        "help" => LineCommand::Help,
        "quit" | "exit" => LineCommand::Quit,
        _ => LineCommand::Unknown(trimmed.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_messages() {
        assert_eq!(
            parse_line("hello there"),
            LineCommand::Action(Action::SendMessage("hello there".to_owned()))
        );
    }

    #[test]
    fn slash_commands_map_to_actions() {
        assert_eq!(
            parse_line("/upload a.txt b.png"),
            LineCommand::Action(Action::Upload(vec![
                PathBuf::from("a.txt"),
                PathBuf::from("b.png")
            ]))
        );
        assert_eq!(
            parse_line("/delete ab_c.txt"),
            LineCommand::Action(Action::Delete("ab_c.txt".to_owned()))
        );
        assert_eq!(parse_line(" /quit "), LineCommand::Quit);
        assert!(matches!(parse_line("/upload"), LineCommand::Unknown(_)));
        assert!(matches!(parse_line("/nope"), LineCommand::Unknown(_)));
    }

    #[test]
    fn confirmation_accepts_yes_variants() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes(""));
        assert!(!is_yes("no"));
    }
}
