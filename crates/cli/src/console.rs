//! Interactive debugging console (`petri-debug attach`).
//!
//! Stdin is read on its own thread; the main thread alternates between
//! draining client callbacks and executing console commands, so every
//! `DebuggerHooks` call happens on the main thread.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use petri_debug_client::{
    compiler_for, generator_for, CallbackQueue, ClientConfig, Collaborators, DebugClient,
    DebuggerHooks, SourceDocument,
};
use petri_debug_config::DebuggerSettings;

use crate::exit_codes::{debug_exit_code, EXIT_SESSION_PROTOCOL};
use crate::CliError;

/// Extra time allowed for the handshake after the connect timeout.
const HANDSHAKE_GRACE: Duration = Duration::from_secs(2);
const POLL: Duration = Duration::from_millis(50);

pub const HELP: &str = "\
Commands:
  start                 start the net
  stop                  stop the net
  pause | resume        pause or resume the running net
  reload                stop, recompile and reload the net
  break <id>            add a breakpoint on entity <id>
  unbreak <id>          remove the breakpoint on entity <id>
  eval <expr> [| fmt]   evaluate an expression ($name reads a net variable)
  history               list recent evaluations
  states                show the active states
  status                show the session and net state
  detach                leave the session, the net keeps its peer
  end                   end the debugging session on the peer
  help                  show this help";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start,
    Stop,
    Pause,
    Resume,
    Reload,
    Break(u64),
    Unbreak(u64),
    Eval { expression: String, format: Option<String> },
    History,
    States,
    Status,
    Detach,
    End,
    Help,
}

impl ConsoleCommand {
    /// Parse one console line. `Ok(None)` for blank lines.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let cmd = match word {
            "start" => ConsoleCommand::Start,
            "stop" => ConsoleCommand::Stop,
            "pause" => ConsoleCommand::Pause,
            "resume" => ConsoleCommand::Resume,
            "reload" => ConsoleCommand::Reload,
            "break" => ConsoleCommand::Break(parse_id(rest)?),
            "unbreak" => ConsoleCommand::Unbreak(parse_id(rest)?),
            "eval" => parse_eval(rest)?,
            "history" => ConsoleCommand::History,
            "states" => ConsoleCommand::States,
            "status" => ConsoleCommand::Status,
            "detach" | "quit" => ConsoleCommand::Detach,
            "end" => ConsoleCommand::End,
            "help" | "?" => ConsoleCommand::Help,
            other => return Err(format!("unknown command '{}' (try 'help')", other)),
        };
        Ok(Some(cmd))
    }
}

fn parse_id(arg: &str) -> Result<u64, String> {
    arg.parse()
        .map_err(|_| format!("expected an entity id, got '{}'", arg))
}

/// `eval <expr> [| <format>]`. The split only happens when the part after
/// the last `|` looks like a printf format, so `a || b` stays intact.
fn parse_eval(rest: &str) -> Result<ConsoleCommand, String> {
    if rest.is_empty() {
        return Err("eval needs an expression".to_string());
    }
    if let Some((expression, format)) = rest.rsplit_once('|') {
        let format = format.trim();
        if format.starts_with('%') && !expression.trim().is_empty() {
            return Ok(ConsoleCommand::Eval {
                expression: expression.trim().to_string(),
                format: Some(format.to_string()),
            });
        }
    }
    Ok(ConsoleCommand::Eval { expression: rest.to_string(), format: None })
}

/// Prints callbacks as they are drained.
#[derive(Default)]
struct ConsoleHooks {
    last_error: Mutex<Option<String>>,
}

impl ConsoleHooks {
    fn take_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl DebuggerHooks for ConsoleHooks {
    fn on_states_updated(&self) {
        log::debug!("active states updated");
    }

    fn on_evaluation_result(&self, result: &str) {
        println!("= {}", result);
    }

    fn on_status_changed(&self, status: &str) {
        println!("{}", status);
    }

    fn on_error(&self, message: &str) {
        eprintln!("error: {}", message);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.to_string());
    }

    fn on_toolbar_refresh(&self) {
        log::trace!("toolbar refresh");
    }
}

pub struct AttachArgs {
    pub source: PathBuf,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub settings: Option<PathBuf>,
    pub states: Option<Vec<u64>>,
}

pub fn cmd_attach(args: AttachArgs) -> Result<(), CliError> {
    let mut settings = match &args.settings {
        Some(path) => DebuggerSettings::load_from(path)
            .map_err(|e| CliError::args(e.to_string()))?,
        None => DebuggerSettings::load(),
    };
    if let Some(host) = args.host {
        settings.hostname = host;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if !args.source.is_file() {
        return Err(CliError::args(format!("{}: no such file", args.source.display())));
    }

    let compiler = compiler_for(&settings);
    let library = settings.library_path_for(&args.source);
    let mut document = SourceDocument::new(&args.source, &library, compiler.clone());
    if let Some(ids) = args.states {
        document = document.with_entities(ids);
    }

    let queue = Arc::new(CallbackQueue::new());
    let hooks = Arc::new(ConsoleHooks::default());
    let client = DebugClient::new(
        ClientConfig::from_settings(&settings),
        Collaborators {
            document: Arc::new(document),
            codegen: generator_for(&settings),
            compiler,
            scheduler: queue.clone(),
            hooks: hooks.clone(),
        },
    );

    client.attach().map_err(|e| {
        queue.run_pending();
        CliError {
            code: debug_exit_code(&e),
            message: String::new(),
            hint: Some(format!("is a net running with its debugger on {}?", settings.peer_address())),
        }
    })?;

    let deadline = Instant::now() + settings.connect_timeout() + HANDSHAKE_GRACE;
    while !client.is_attached() {
        queue.wait_and_run(POLL);
        // Already printed by the hooks
        if hooks.take_error().is_some() {
            return Err(CliError { code: EXIT_SESSION_PROTOCOL, message: String::new(), hint: None });
        }
        if Instant::now() >= deadline {
            return Err(CliError {
                code: EXIT_SESSION_PROTOCOL,
                message: "no answer to the handshake".to_string(),
                hint: None,
            });
        }
    }
    hooks.take_error();

    run_console(&client, &queue, &hooks);
    Ok(())
}

fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name("console-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::debug!("stdin: {}", e);
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        log::error!("Cannot read the console: {}", e);
    }
    rx
}

fn run_console(client: &DebugClient, queue: &CallbackQueue, hooks: &ConsoleHooks) {
    let lines = spawn_stdin_reader();
    loop {
        queue.wait_and_run(POLL);
        hooks.take_error();

        if !client.is_attached() {
            println!("The debugging session is over.");
            return;
        }

        let line = match lines.try_recv() {
            Ok(line) => line,
            Err(TryRecvError::Empty) => continue,
            Err(TryRecvError::Disconnected) => {
                client.detach();
                queue.run_pending();
                return;
            }
        };

        match ConsoleCommand::parse(&line) {
            Ok(None) => {}
            Ok(Some(cmd)) => {
                if !execute(client, cmd, hooks) {
                    queue.run_pending();
                    return;
                }
            }
            Err(e) => eprintln!("{}", e),
        }
    }
}

/// Run one command. Returns false when the console should exit.
fn execute(client: &DebugClient, cmd: ConsoleCommand, hooks: &ConsoleHooks) -> bool {
    match cmd {
        ConsoleCommand::Start => client.start_petri(),
        ConsoleCommand::Stop => client.stop_petri(),
        ConsoleCommand::Pause => client.set_pause(true),
        ConsoleCommand::Resume => client.set_pause(false),
        ConsoleCommand::Reload => client.reload_petri(),
        ConsoleCommand::Break(id) => client.add_breakpoint(id),
        ConsoleCommand::Unbreak(id) => client.remove_breakpoint(id),
        ConsoleCommand::Eval { expression, format } => {
            if let Err(e) = client.evaluate(&expression, format.as_deref()) {
                eprintln!("error: {}", e);
            }
        }
        ConsoleCommand::History => {
            for (i, expression) in client.last_evaluations().iter().enumerate() {
                println!("{:>3}  {}", i + 1, expression);
            }
        }
        ConsoleCommand::States => {
            let states = client.active_states().snapshot();
            if states.is_empty() {
                println!("no active state");
            }
            for (id, count) in states {
                println!("{:>8}  {} token(s)", id, count);
            }
        }
        ConsoleCommand::Status => {
            let status = client.status();
            println!(
                "session: {:?}, net: {:?}, protocol: {}, breakpoints: {:?}",
                status.session,
                status.petri,
                status.protocol_version.as_deref().unwrap_or("-"),
                client.breakpoints().snapshot(),
            );
        }
        ConsoleCommand::Detach => {
            client.detach();
            return false;
        }
        ConsoleCommand::End => {
            client.stop_session();
            return false;
        }
        ConsoleCommand::Help => println!("{}", HELP),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> ConsoleCommand {
        ConsoleCommand::parse(line).unwrap().unwrap()
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse("start"), ConsoleCommand::Start);
        assert_eq!(parse("  stop  "), ConsoleCommand::Stop);
        assert_eq!(parse("end"), ConsoleCommand::End);
        assert_eq!(parse("quit"), ConsoleCommand::Detach);
        assert_eq!(ConsoleCommand::parse("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_breakpoints() {
        assert_eq!(parse("break 17"), ConsoleCommand::Break(17));
        assert_eq!(parse("unbreak  3"), ConsoleCommand::Unbreak(3));
        assert!(ConsoleCommand::parse("break x").is_err());
        assert!(ConsoleCommand::parse("break").is_err());
    }

    #[test]
    fn test_parse_eval() {
        assert_eq!(
            parse("eval $count + 1"),
            ConsoleCommand::Eval { expression: "$count + 1".to_string(), format: None }
        );
        assert_eq!(
            parse("eval $ratio * 2 | %f"),
            ConsoleCommand::Eval { expression: "$ratio * 2".to_string(), format: Some("%f".to_string()) }
        );
        assert_eq!(
            parse("eval a || b"),
            ConsoleCommand::Eval { expression: "a || b".to_string(), format: None }
        );
        assert!(ConsoleCommand::parse("eval").is_err());
    }

    #[test]
    fn test_parse_unknown() {
        let err = ConsoleCommand::parse("launch").unwrap_err();
        assert!(err.contains("launch"));
    }
}
