use anyhow::{Context, Result};
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use turnloom::config::Config;
use turnloom::sink::{ChannelSink, EventSink};
use turnloom::state::{Session, TurnOutcome};
use turnloom::types::{Entry, ResponseEvent};
use turnloom::Error;

const UNAVAILABLE_TOOL: &str = "tool execution is not available in this frontend";

/// Writes cumulative text deltas to stdout as suffixes.
#[derive(Default)]
struct Printer {
    printed: usize,
}

impl Printer {
    fn handle(&mut self, event: ResponseEvent) {
        let mut stdout = std::io::stdout().lock();
        match event {
            ResponseEvent::TextDelta { content, .. } => {
                if content.len() < self.printed || !content.is_char_boundary(self.printed) {
                    self.printed = 0;
                }
                let _ = write!(stdout, "{}", &content[self.printed..]);
                self.printed = content.len();
            }
            ResponseEvent::ToolCallReady { name, arguments, .. } => {
                self.break_line(&mut stdout);
                let _ = writeln!(stdout, "[tool call] {name} {arguments}");
            }
            ResponseEvent::TurnComplete | ResponseEvent::FollowupComplete => {
                self.break_line(&mut stdout);
            }
        }
        let _ = stdout.flush();
    }

    fn break_line(&mut self, out: &mut impl Write) {
        if self.printed > 0 {
            let _ = writeln!(out);
        }
        self.printed = 0;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::load()?;
    config.validate()?;
    let session = Arc::new(Session::new(&config)?);

    if let Some(path) = config.history_path.as_deref().filter(|path| path.exists()) {
        session
            .load_history(path)
            .with_context(|| format!("loading history from {}", path.display()))?;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink: Arc<dyn EventSink> = Arc::new(ChannelSink::new(tx));
    let mut printer = Printer::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = next_prompt(&mut lines, tokio::signal::ctrl_c()).await? else {
            println!();
            break;
        };
        let line = line.trim();

        match line {
            "" => continue,
            "/quit" => break,
            "/clear" => {
                session.clear_history()?;
                println!("history cleared");
                continue;
            }
            _ => {}
        }
        if let Some(path) = line.strip_prefix("/save ") {
            match session.save_history(Path::new(path.trim())) {
                Ok(()) => println!("history saved to {}", path.trim()),
                Err(error) => eprintln!("error: {error}"),
            }
            continue;
        }

        let turn = session.submit_user_turn(vec![Entry::user(line)], Arc::clone(&sink));
        let mut outcome = drive(&session, turn, &mut rx, &mut printer).await;

        while let Ok(TurnOutcome::ToolCalls(calls)) = &outcome {
            let calls = calls.clone();
            for call in calls {
                let result = session.submit_tool_result(
                    &call.id,
                    &call.function.name,
                    UNAVAILABLE_TOOL,
                    false,
                );
                outcome = drive(&session, result, &mut rx, &mut printer).await;
                if outcome.is_err() {
                    break;
                }
            }
        }

        match outcome {
            Err(Error::Cancelled) => {
                printer.break_line(&mut std::io::stdout());
                println!("(cancelled)");
            }
            Err(error) => {
                printer.break_line(&mut std::io::stdout());
                eprintln!("error: {error}");
            }
            Ok(_) => {}
        }
    }

    session.close()?;
    Ok(())
}

/// Reads the next prompt line. An interrupt at the prompt ends input like EOF.
async fn next_prompt<R, F>(lines: &mut Lines<R>, interrupt: F) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        line = lines.next_line() => line,
        _ = interrupt => Ok(None),
    }
}

/// Polls one submission while printing its events. Ctrl-C cancels it.
async fn drive<F>(
    session: &Session,
    turn: F,
    rx: &mut mpsc::UnboundedReceiver<ResponseEvent>,
    printer: &mut Printer,
) -> turnloom::Result<TurnOutcome>
where
    F: Future<Output = turnloom::Result<TurnOutcome>>,
{
    tokio::pin!(turn);
    loop {
        tokio::select! {
            result = &mut turn => {
                while let Ok(event) = rx.try_recv() {
                    printer.handle(event);
                }
                return result;
            }
            Some(event) = rx.recv() => printer.handle(event),
            _ = tokio::signal::ctrl_c() => session.cancel(),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TURNLOOM_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
