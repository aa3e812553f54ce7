//! `slot-sentinel console`: interactive REPL driving an in-process engine.
//!
//! The engine runs against a scripted page and an empty status transport;
//! commands inject signals by hand. Type `/help` for commands, Tab for
//! completion.

use std::sync::Arc;

use anyhow::Result;
use rustyline::completion::{Completer, Pair};
use rustyline::config::CompletionType;
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{
    Cmd, ConditionalEventHandler, Config, Editor, Event, EventContext, EventHandler, Helper,
    KeyEvent, RepeatCount,
};
use serde_json::Value;
use slot_sentinel::{
    BackoffPolicy, Engine, EngineHandle, EngineParts, EventBus, MemoryMarker, PageScript,
    PollReport, RequestTemplate, ScriptedPage, SentinelConfig, StructuralReport, Timings,
};
use tokio::sync::{broadcast, mpsc};

use crate::config::{state_dir, FileConfig};
use crate::output::EventPrinter;
use crate::scenario::ScriptedTransport;

/// Available console commands.
const COMMANDS: &[(&str, &str)] = &[
    ("/status", "Show the engine snapshot"),
    ("/arm", "Arm the engine"),
    ("/disarm", "Disarm the engine"),
    ("/auto", "Toggle auto-click: /auto on|off"),
    ("/chain", "Toggle chained confirm: /chain on|off"),
    ("/page", "Set what the page shows: soldout|open|subunits|nocontext"),
    ("/mutation", "Signal a DOM mutation burst"),
    ("/poll", "Report a status payload: /poll <json>"),
    ("/request", "Start polling a captured request: /request <url>"),
    ("/ratelimit", "Report a 429 from the status endpoint"),
    ("/navigate", "Report a navigation: /navigate <url>"),
    ("/clear", "Clear the terminal"),
    ("/help", "List console commands"),
    ("/exit", "Quit the console"),
];

const PAGE_STATES: &[&str] = &["soldout", "open", "subunits", "nocontext"];

/// A parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Status,
    Arm(bool),
    Auto(bool),
    Chain(bool),
    Page(StructuralReport),
    Mutation,
    Poll(Value),
    Request(String),
    RateLimited,
    Navigate(String),
    Clear,
    Help,
    Exit,
}

fn on_off(args: &str) -> Result<bool, String> {
    match args {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => Err(format!("expected on|off, got '{other}'")),
    }
}

fn page_report(args: &str) -> Result<StructuralReport, String> {
    let (sold_out, has_sub_units, context_selected) = match args {
        "soldout" => (true, false, true),
        "open" => (false, false, true),
        "subunits" => (false, true, true),
        "nocontext" => (false, false, false),
        other => return Err(format!("unknown page state '{other}'")),
    };
    Ok(StructuralReport {
        sold_out,
        has_sub_units,
        context_selected,
    })
}

/// Parse one input line. The leading `/` is optional.
pub fn parse(line: &str) -> Result<ConsoleCommand, String> {
    let input = line.trim();
    let input = input.strip_prefix('/').unwrap_or(input);
    let mut parts = input.splitn(2, ' ');
    let cmd = parts.next().unwrap_or("");
    let args = parts.next().unwrap_or("").trim();

    let require = |what: &str| -> Result<String, String> {
        if args.is_empty() {
            Err(format!("usage: /{cmd} <{what}>"))
        } else {
            Ok(args.to_string())
        }
    };

    match cmd {
        "" | "help" | "h" | "?" => Ok(ConsoleCommand::Help),
        "status" | "s" => Ok(ConsoleCommand::Status),
        "arm" => Ok(ConsoleCommand::Arm(true)),
        "disarm" => Ok(ConsoleCommand::Arm(false)),
        "auto" => on_off(args).map(ConsoleCommand::Auto),
        "chain" => on_off(args).map(ConsoleCommand::Chain),
        "page" => page_report(args).map(ConsoleCommand::Page),
        "mutation" | "m" => Ok(ConsoleCommand::Mutation),
        "poll" => {
            let raw = require("json")?;
            serde_json::from_str(&raw)
                .map(ConsoleCommand::Poll)
                .map_err(|e| format!("invalid json: {e}"))
        }
        "request" => require("url").map(ConsoleCommand::Request),
        "ratelimit" => Ok(ConsoleCommand::RateLimited),
        "navigate" => require("url").map(ConsoleCommand::Navigate),
        "clear" | "cls" => Ok(ConsoleCommand::Clear),
        "exit" | "quit" => Ok(ConsoleCommand::Exit),
        other => Err(format!("Unknown command '/{other}'. Type /help for commands.")),
    }
}

/// Completion and inline hints for console commands.
#[derive(Default)]
struct ConsoleHelper;

impl Completer for ConsoleHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let input = &line[..pos];

        if !input.contains(' ') {
            let matches = COMMANDS
                .iter()
                .filter(|(cmd, _)| cmd.starts_with(input))
                .map(|(cmd, desc)| Pair {
                    display: format!("{cmd:<12} {desc}"),
                    replacement: format!("{cmd} "),
                })
                .collect();
            return Ok((0, matches));
        }

        let (cmd, args) = input.split_once(' ').unwrap_or((input, ""));
        let options: &[&str] = match cmd {
            "/page" => PAGE_STATES,
            "/auto" | "/chain" => &["on", "off"],
            _ => &[],
        };
        let start = input.len() - args.len();
        let matches = options
            .iter()
            .filter(|o| o.starts_with(args.trim()))
            .map(|o| Pair {
                display: o.to_string(),
                replacement: o.to_string(),
            })
            .collect();
        Ok((start, matches))
    }
}

impl Hinter for ConsoleHelper {
    type Hint = String;

    fn hint(&self, line: &str, pos: usize, _ctx: &rustyline::Context<'_>) -> Option<String> {
        if pos < line.len() || line.is_empty() || !line.starts_with('/') || line.contains(' ') {
            return None;
        }
        COMMANDS
            .iter()
            .find(|(cmd, _)| cmd.starts_with(line) && *cmd != line)
            .map(|(cmd, _)| cmd[line.len()..].to_string())
    }
}

impl Highlighter for ConsoleHelper {}
impl Validator for ConsoleHelper {}
impl Helper for ConsoleHelper {}

struct TabKey;

impl ConditionalEventHandler for TabKey {
    fn handle(
        &self,
        _evt: &Event,
        _n: RepeatCount,
        _positive: bool,
        ctx: &EventContext<'_>,
    ) -> Option<Cmd> {
        Some(if ctx.has_hint() {
            Cmd::CompleteHint
        } else {
            Cmd::Complete
        })
    }
}

/// Blocking readline loop; forwards lines until exit or EOF.
fn read_lines(lines: mpsc::UnboundedSender<String>) -> Result<()> {
    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .completion_type(CompletionType::List)
        .completion_prompt_limit(20)
        .build();

    let mut rl: Editor<ConsoleHelper, rustyline::history::DefaultHistory> =
        Editor::with_config(config)?;
    rl.set_helper(Some(ConsoleHelper));
    rl.bind_sequence(
        KeyEvent::from('\t'),
        EventHandler::Conditional(Box::new(TabKey)),
    );

    let hist_path = state_dir().join("console_history");
    if let Err(e) = rl.load_history(&hist_path) {
        tracing::debug!("no console history loaded: {e}");
    }

    let prompt = " \x1b[36msentinel>\x1b[0m ";
    loop {
        match rl.readline(prompt) {
            Ok(line) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let exit = matches!(parse(&line), Ok(ConsoleCommand::Exit));
                if lines.send(line).is_err() || exit {
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                eprintln!("  \x1b[90m(interrupted)\x1b[0m use \x1b[1m/exit\x1b[0m to leave the console");
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("  Error: {err}");
                break;
            }
        }
    }

    let _ = std::fs::create_dir_all(state_dir());
    let _ = rl.save_history(&hist_path);
    Ok(())
}

fn help() {
    eprintln!();
    eprintln!("  Commands:");
    eprintln!();
    for (cmd, desc) in COMMANDS {
        eprintln!("    {cmd:<14} {desc}");
    }
    eprintln!();
}

/// Console session state: the engine plus the config it was last given.
struct Session {
    handle: EngineHandle,
    page: Arc<ScriptedPage>,
    config: SentinelConfig,
}

impl Session {
    async fn reconfigure(&mut self, change: impl FnOnce(&mut SentinelConfig)) -> Result<()> {
        change(&mut self.config);
        self.handle.update_config(self.config.clone()).await?;
        Ok(())
    }

    /// Run one command; returns `false` when the console should exit.
    async fn execute(&mut self, command: ConsoleCommand) -> Result<bool> {
        match command {
            ConsoleCommand::Status => {
                let snapshot = self.handle.snapshot().await?;
                eprintln!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            ConsoleCommand::Arm(on) => self.reconfigure(|c| c.armed = on).await?,
            ConsoleCommand::Auto(on) => self.reconfigure(|c| c.auto_click_enabled = on).await?,
            ConsoleCommand::Chain(on) => self.reconfigure(|c| c.chain_confirm_enabled = on).await?,
            ConsoleCommand::Page(report) => {
                self.page.set_report(report).await;
                self.handle.notify_mutation().await?;
            }
            ConsoleCommand::Mutation => self.handle.notify_mutation().await?,
            ConsoleCommand::Poll(payload) => {
                self.handle
                    .report_poll(PollReport::from_payload(payload, None))
                    .await?
            }
            ConsoleCommand::Request(url) => {
                self.handle
                    .observe_status_request(RequestTemplate::get(url))
                    .await?
            }
            ConsoleCommand::RateLimited => self.handle.report_rate_limited().await?,
            ConsoleCommand::Navigate(url) => self.handle.navigate(url).await?,
            ConsoleCommand::Clear => eprint!("\x1b[2J\x1b[H"),
            ConsoleCommand::Help => help(),
            ConsoleCommand::Exit => return Ok(false),
        }
        Ok(true)
    }
}

/// Run the interactive console.
pub async fn run(config: FileConfig, printer: EventPrinter) -> Result<()> {
    eprintln!();
    eprintln!(
        "  \x1b[32m\u{25c9}\x1b[0m \x1b[1mslot-sentinel console v{}\x1b[0m",
        env!("CARGO_PKG_VERSION")
    );
    eprintln!();
    eprintln!(
        "    Engine runs on a scripted page. \x1b[36m/help\x1b[0m lists commands, \x1b[90mTab\x1b[0m completes."
    );
    eprintln!();

    let page = Arc::new(ScriptedPage::new(PageScript {
        sold_out: true,
        ..Default::default()
    }));
    let events = EventBus::new(1024);
    let mut rx = events.subscribe();
    super::start_relay(&config, &events)?;

    let (handle, task) = Engine::spawn(EngineParts {
        config: config.sentinel.clone(),
        timings: Timings::default(),
        backoff: BackoffPolicy::default(),
        page: page.clone(),
        transport: Arc::new(ScriptedTransport::new(Vec::new())),
        marker: Arc::new(MemoryMarker::new()),
        events,
    })?;

    let mut session = Session {
        handle: handle.clone(),
        page,
        config: config.sentinel.normalized(),
    };

    let (lines_tx, mut lines) = mpsc::unbounded_channel();
    let reader = tokio::task::spawn_blocking(move || read_lines(lines_tx));

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                match parse(&line) {
                    Ok(command) => match session.execute(command).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => eprintln!("  Error: {e:#}"),
                    },
                    Err(message) => eprintln!("  {message}"),
                }
            }
            event = rx.recv() => match event {
                Ok(event) => printer.print(&event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    eprintln!("  \x1b[90m\u{2728}\x1b[0m Goodbye!");
    handle.shutdown();
    let _ = task.await;
    reader.await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse("/status"), Ok(ConsoleCommand::Status));
        assert_eq!(parse("disarm"), Ok(ConsoleCommand::Arm(false)));
        assert_eq!(parse("/auto on"), Ok(ConsoleCommand::Auto(true)));
        assert_eq!(parse("/"), Ok(ConsoleCommand::Help));
        assert_eq!(
            parse("/poll {\"slots\": []}"),
            Ok(ConsoleCommand::Poll(json!({"slots": []})))
        );
        assert_eq!(
            parse("/page subunits"),
            Ok(ConsoleCommand::Page(StructuralReport {
                sold_out: false,
                has_sub_units: true,
                context_selected: true,
            }))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("/auto maybe").is_err());
        assert!(parse("/navigate").unwrap_err().contains("usage"));
        assert!(parse("/poll {oops").unwrap_err().contains("invalid json"));
        assert!(parse("/frobnicate").unwrap_err().contains("Unknown command"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_disarm_updates_engine() {
        let page = Arc::new(ScriptedPage::new(PageScript::default()));
        let (handle, _task) = Engine::spawn(EngineParts {
            config: SentinelConfig {
                armed: true,
                ..Default::default()
            },
            timings: Timings::default(),
            backoff: BackoffPolicy::default(),
            page: page.clone(),
            transport: Arc::new(ScriptedTransport::new(Vec::new())),
            marker: Arc::new(MemoryMarker::new()),
            events: EventBus::new(64),
        })
        .unwrap();
        let mut session = Session {
            handle,
            page,
            config: SentinelConfig {
                armed: true,
                ..Default::default()
            },
        };

        assert!(session.execute(ConsoleCommand::Arm(false)).await.unwrap());
        assert!(!session.config.armed);
        assert!(!session.execute(ConsoleCommand::Exit).await.unwrap());
    }
}
