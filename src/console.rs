/// `console.rs` — operator console on stdin
///
/// ```text
/// !hello some args       chat command as user "console"
/// emit Follow alice 42   raw event of any kind
/// run backup             call a catalog script
/// mediaend Main          report end of the current item
/// enable / disable NAME  toggle a reaction or script
/// list                   loaded reactions and scripts
/// quit
/// ```
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::{
    capabilities::hardware::{normalize_button, normalize_key, parse_key_code, parse_mouse_button},
    error::HubError,
    scripting::{kind::EventKind, reaction::CallResult, value::EventArg},
    state::AppState,
};

pub const CONSOLE_USER: &str = "console";
pub const CONSOLE_USER_ID: &str = "0";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Chat { command: String, args_text: String },
    Emit { kind: EventKind, args: Vec<EventArg> },
    Run(String),
    MediaEnd(String),
    SetEnabled { name: String, enabled: bool },
    List,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        if let Some(rest) = line.strip_prefix('!') {
            let (command, args_text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            if command.is_empty() {
                return Err("expected a command name after '!'".into());
            }
            return Ok(Some(Self::Chat {
                command: command.to_string(),
                args_text: args_text.trim().to_string(),
            }));
        }

        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or_default();
        let cmd = match verb {
            "emit" => {
                let name = words.next().ok_or("usage: emit <Kind> [args...]")?;
                let kind = EventKind::from_name(name).ok_or_else(|| format!("unknown event kind '{name}'"))?;
                Self::Emit {
                    kind,
                    args: words.map(EventArg::parse).collect(),
                }
            }
            "run" => Self::Run(words.next().ok_or("usage: run <script>")?.to_string()),
            "mediaend" => Self::MediaEnd(words.next().ok_or("usage: mediaend <channel>")?.to_string()),
            "enable" | "disable" => Self::SetEnabled {
                name: words.next().ok_or_else(|| format!("usage: {verb} <name>"))?.to_string(),
                enabled: verb == "enable",
            },
            "list" | "ls" => Self::List,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => return Err(format!("unknown command '{other}', try 'help'")),
        };
        Ok(Some(cmd))
    }
}

/// Key and mouse events go through the same blocked-input gate scripts
/// control with `hardwarelib.blockkey`. Returns `None` when the event is
/// suppressed; otherwise the arguments with names resolved to codes.
pub fn gate_input(state: &AppState, kind: EventKind, mut args: Vec<EventArg>) -> Option<Vec<EventArg>> {
    let blocked = &state.services.blocked;
    match kind {
        EventKind::KeyDown | EventKind::KeyUp | EventKind::KeyType => {
            let code = match args.first() {
                Some(EventArg::Int(code)) => normalize_key(*code),
                Some(EventArg::Str(name)) => parse_key_code(name),
                _ => return Some(args),
            };
            if blocked.is_key_blocked(code) {
                log::debug!("[console] key 0x{:04X} is blocked, dropping {}", code, kind);
                return None;
            }
            args[0] = EventArg::Int(i64::from(code));
        }
        EventKind::MouseDown | EventKind::MouseUp | EventKind::MouseClick => {
            let button = match args.first() {
                Some(EventArg::Int(code)) => normalize_button(*code),
                Some(EventArg::Str(name)) => parse_mouse_button(name),
                _ => return Some(args),
            };
            if blocked.is_button_blocked(button) {
                log::debug!("[console] button {} is blocked, dropping {}", button, kind);
                return None;
            }
            args[0] = EventArg::Int(i64::from(button));
        }
        _ => {}
    }
    Some(args)
}

fn print_result(name: &str, res: &CallResult) {
    match &res.error_message {
        Some(err) => match res.error_line {
            Some(line) => println!("  {name}: failed at line {line}: {err}"),
            None => println!("  {name}: failed: {err}"),
        },
        None => println!("  {name}: {:?} -> {}", res.status, res.result),
    }
}

/// Run one command. Returns `false` once the operator asked to quit.
pub async fn execute(state: &AppState, cmd: ConsoleCommand) -> bool {
    let dispatcher = &state.dispatcher;
    match cmd {
        ConsoleCommand::Chat { command, args_text } => {
            match dispatcher
                .route_command(&command, CONSOLE_USER, CONSOLE_USER_ID, &args_text)
                .await
            {
                Some(res) => print_result(&command, &res),
                None => println!("  no command reaction named '{command}'"),
            }
        }
        ConsoleCommand::Emit { kind, args } => {
            let Some(args) = gate_input(state, kind, args) else {
                println!("  {kind} suppressed: input is blocked");
                return true;
            };
            let results = dispatcher.dispatch(kind, args).await;
            if results.is_empty() {
                println!("  no reactions for {kind}");
            }
            for (name, res) in &results {
                print_result(name, res);
            }
        }
        ConsoleCommand::Run(name) => {
            let res = dispatcher.call_script(&name).await;
            print_result(&name, &res);
        }
        ConsoleCommand::MediaEnd(channel) => {
            if let Err(e) = state.media.end_reached(&channel) {
                println!("  {e}");
            }
        }
        ConsoleCommand::SetEnabled { name, enabled } => {
            let toggled = match dispatcher.registry().set_enabled(&name, enabled) {
                Err(HubError::NameNotFound(_)) => dispatcher.catalog().set_enabled(&name, enabled),
                other => other,
            };
            match toggled {
                Ok(()) => println!("  {name} {}", if enabled { "enabled" } else { "disabled" }),
                Err(e) => println!("  {e}"),
            }
        }
        ConsoleCommand::List => {
            println!("  reactions:");
            for name in dispatcher.registry().names() {
                if let Some(r) = dispatcher.registry().get(&name) {
                    let flag = if r.is_enabled() { "" } else { " (disabled)" };
                    println!("    {:<24} {:<16} {}ms{}", name, r.kind(), r.cooldown().as_millis(), flag);
                }
            }
            println!("  scripts:");
            for name in dispatcher.catalog().keys() {
                println!("    {name}");
            }
        }
        ConsoleCommand::Help => {
            println!("Commands:");
            println!("  !<command> [args]      - Chat command as '{CONSOLE_USER}'");
            println!("  emit <Kind> [args...]  - Dispatch an event");
            println!("  run <script>           - Call a catalog script");
            println!("  mediaend <channel>     - End the current media item");
            println!("  enable|disable <name>  - Toggle a reaction or script");
            println!("  list                   - Show reactions and scripts");
            println!("  quit                   - Exit");
        }
        ConsoleCommand::Quit => return false,
    }
    true
}

/// Read commands from stdin until `quit` or end of input.
pub async fn run_console(state: &AppState) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("[console] stdin read failed: {}", e);
                break;
            }
        };
        match ConsoleCommand::parse(&line) {
            Ok(Some(cmd)) => {
                if !execute(state, cmd).await {
                    break;
                }
            }
            Ok(None) => {}
            Err(msg) => println!("  {msg}"),
        }
    }
}
