use std::io::{self, BufRead, IsTerminal, Write};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use tenet_config::AppConfig;
use tenet_memory::Domain;
use tenet_runtime::Orchestrator;

#[derive(Debug, Parser)]
#[command(name = "tenet", version, about = "A persistent memory-centric local-first agent")]
struct Cli {
    /// Path to the TOML config file (created with defaults if missing).
    #[arg(long, default_value = "config/default.toml")]
    config: String,
    /// Send a single message and print the response, instead of entering the
    /// interactive loop. Useful for scripting.
    #[arg(long)]
    message: Option<String>,
}

const HELP_TEXT: &str = "\
commands:
  help                         show this message
  exit, quit                   leave the chat loop
  clear                        forget the in-memory conversation history
  quiet [duration|off]         pause proactive messages (e.g. `quiet 2h`), or `quiet off` to resume
  reminders [clear]            list pending reminders, or clear them all
  remember \"text\"              store a fact directly, bypassing extraction
  facts [domain]               list stored facts, optionally filtered by domain
  proactive status             show proactive-loop counters and quiet-mode state
  proactive tick               force an immediate proactive tick
  proactive reminder-tick      force an immediate reminder-queue tick
  proactive context            preview the quiet-hours/rate-limit verdict right now
  proactive reset              reset proactive-loop counters and clear quiet mode
anything else is sent to the assistant.";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    let log_dir = config.data.log_dir_path();
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "tenet.log");
    let (non_blocking, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stdout.and(non_blocking))
        .init();

    let orchestrator = Orchestrator::start(config).await?;
    orchestrator.spawn_background_tasks();

    if let Some(message) = cli.message {
        let outcome = orchestrator.handle_user_message(&message).await?;
        println!("{}", outcome.response);
        orchestrator.shutdown().await;
        return Ok(());
    }

    run_chat_loop(&orchestrator).await;
    orchestrator.shutdown().await;
    Ok(())
}

async fn run_chat_loop(orchestrator: &Orchestrator) {
    let stdin = io::stdin();
    let interactive = stdin.is_terminal();
    if interactive {
        println!("{}", HELP_TEXT);
    }

    let mut lines = stdin.lock().lines();
    loop {
        if interactive {
            print!("> ");
            let _ = io::stdout().flush();
        }
        let Some(Ok(line)) = lines.next() else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match dispatch_command(orchestrator, line).await {
            CommandOutcome::Exit => break,
            CommandOutcome::Handled => {}
            CommandOutcome::PassThrough(text) => match orchestrator.handle_user_message(&text).await {
                Ok(outcome) => {
                    if let Some(warning) = outcome.truncation_warning {
                        eprintln!("[context truncated: {warning}]");
                    }
                    println!("{}", outcome.response);
                }
                Err(err) => eprintln!("error: {err:#}"),
            },
        }
    }
}

enum CommandOutcome {
    Exit,
    Handled,
    PassThrough(String),
}

/// Route a line of input before it reaches the LLM pipeline. Unrecognized
/// input falls through to the assistant, per the external-interface command
/// table: `exit|quit`, `clear`, `help`, `quiet`, `reminders`, `remember`,
/// `facts`, and the `proactive` debug group.
async fn dispatch_command(orchestrator: &Orchestrator, line: &str) -> CommandOutcome {
    let mut parts = line.splitn(2, char::is_whitespace);
    let head = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    match head {
        "exit" | "quit" => CommandOutcome::Exit,
        "help" => {
            println!("{}", HELP_TEXT);
            CommandOutcome::Handled
        }
        "clear" => {
            orchestrator.clear_history().await;
            println!("conversation history cleared");
            CommandOutcome::Handled
        }
        "quiet" => {
            handle_quiet(orchestrator, rest).await;
            CommandOutcome::Handled
        }
        "reminders" => {
            handle_reminders(orchestrator, rest).await;
            CommandOutcome::Handled
        }
        "remember" => {
            let text = rest.trim_matches('"');
            if text.is_empty() {
                println!("usage: remember \"text\"");
            } else if let Err(err) = orchestrator.remember(text).await {
                eprintln!("error: {err:#}");
            } else {
                println!("remembered");
            }
            CommandOutcome::Handled
        }
        "facts" => {
            handle_facts(orchestrator, rest).await;
            CommandOutcome::Handled
        }
        "proactive" => {
            handle_proactive_debug(orchestrator, rest).await;
            CommandOutcome::Handled
        }
        _ => CommandOutcome::PassThrough(line.to_string()),
    }
}

async fn handle_quiet(orchestrator: &Orchestrator, arg: &str) {
    if arg.is_empty() {
        println!("usage: quiet <duration>|off  (e.g. `quiet 2h`, `quiet 30m`, `quiet off`)");
        return;
    }
    if arg.eq_ignore_ascii_case("off") {
        orchestrator.set_quiet(None).await;
        println!("quiet mode off");
        return;
    }
    match parse_duration(arg) {
        Some(duration) => {
            orchestrator.set_quiet(Some(duration)).await;
            println!("proactive messages paused for {arg}");
        }
        None => println!("couldn't parse duration '{arg}' (expected e.g. 30m, 2h, 1d)"),
    }
}

/// Parse a duration like `30m`, `2h`, `1d`. No fractional amounts, no
/// combined units — this only needs to cover the `quiet` command's input.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    let secs = match unit {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        "d" => amount * 86400,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

async fn handle_reminders(orchestrator: &Orchestrator, arg: &str) {
    if arg.eq_ignore_ascii_case("clear") {
        orchestrator.clear_reminders().await;
        println!("reminders cleared");
        return;
    }
    let reminders = orchestrator.list_reminders().await;
    if reminders.is_empty() {
        println!("no pending reminders");
        return;
    }
    for reminder in reminders {
        println!("  [{:?}] {} — {}", reminder.status, reminder.trigger_at.to_rfc3339(), reminder.message);
    }
}

fn parse_domain(raw: &str) -> Option<Domain> {
    let domain = match raw.to_lowercase().as_str() {
        "health" => Domain::Health,
        "preferences" => Domain::Preferences,
        "work" => Domain::Work,
        "relationships" => Domain::Relationships,
        "schedule" => Domain::Schedule,
        "goals" => Domain::Goals,
        "general" => Domain::General,
        "decisions" => Domain::Decisions,
        "personal" => Domain::Personal,
        "projects" => Domain::Projects,
        _ => return None,
    };
    Some(domain)
}

async fn handle_facts(orchestrator: &Orchestrator, arg: &str) {
    let facts = if arg.is_empty() {
        orchestrator.all_facts().await
    } else {
        match parse_domain(arg) {
            Some(domain) => orchestrator.facts_in_domain(domain).await,
            None => {
                println!("unknown domain '{arg}' (try: health, preferences, work, relationships, schedule, goals, general, decisions, personal, projects)");
                return;
            }
        }
    };
    if facts.is_empty() {
        println!("no facts stored");
        return;
    }
    for fact in facts {
        println!("  [{:?}/{:?}] {} ({})", fact.domain, fact.confidence, fact.fact, fact.scope);
    }
}

async fn handle_proactive_debug(orchestrator: &Orchestrator, arg: &str) {
    match arg {
        "status" => {
            let status = orchestrator.proactive_status().await;
            println!("── proactive status ─────────────────────────────────");
            println!("  quiet hours          : {:02}:00 – {:02}:00", status.quiet_hours_start_hour, status.quiet_hours_end_hour);
            println!("  quiet mode until     : {}", status.quiet_until.map(|t| t.to_rfc3339()).unwrap_or_else(|| "(not active)".to_string()));
            println!("  spontaneous/hour     : {}/{}", status.state.spontaneous_this_hour, status.max_spontaneous_per_hour);
            println!("  spontaneous/day      : {}/{}", status.state.spontaneous_this_day, status.max_spontaneous_per_day);
            println!("  consecutive messages : {}", status.state.consecutive_ticks_with_message);
            println!("  consecutive skips    : {}", status.state.consecutive_skips);
            println!("  greeted today        : {}", status.state.greeted_today);
            println!(
                "  last spontaneous at  : {}",
                status.state.last_spontaneous_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "(never)".to_string())
            );
        }
        "tick" => println!("{}", orchestrator.force_proactive_tick().await),
        "reminder-tick" => {
            let remaining = orchestrator.force_reminder_tick().await;
            println!("reminder tick complete, {remaining} reminder(s) remaining in queue");
        }
        "context" => match orchestrator.proactive_preview().await {
            Some(refusal) => println!("would refuse right now: {refusal:?}"),
            None => println!("would proceed to the decision step right now"),
        },
        "reset" => {
            orchestrator.reset_proactive().await;
            println!("proactive state reset");
        }
        _ => println!("usage: proactive {{status|tick|reminder-tick|context|reset}}"),
    }
}
