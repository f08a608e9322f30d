//! Interactive per-client menu sessions.
//!
//! Each connected client gets a command loop written as straight-line async
//! code. The loop is a future parked on the client's line queue; every
//! `input` event pushes a line and polls the future until it waits again.
//! Nothing else drives it, so there is no executor and no waker.

use crate::host::{ClientId, HostFunctions};
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::future::LocalBoxFuture;
use futures::task::noop_waker_ref;
use futures::{FutureExt, StreamExt};
use lantern_runtime::{OptionKind, OptionSpec, OptionValue, OptionsManifest, SandboxResult};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::task::Context;
use tracing::{debug, info};

/// Handler for an `action` command.
#[async_trait(?Send)]
pub trait MenuAction {
    /// Run the action. `args` is the rest of the command line. The error is
    /// echoed to the client.
    async fn run(&self, args: &str, io: &mut SessionIo) -> Result<(), String>;
}

/// The declared commands plus their current values.
pub struct Menu {
    manifest: OptionsManifest,
    values: RefCell<BTreeMap<String, OptionValue>>,
    actions: RefCell<HashMap<String, Rc<dyn MenuAction>>>,
}

impl Menu {
    pub fn new(manifest: OptionsManifest) -> SandboxResult<Self> {
        let mut values = BTreeMap::new();
        for option in &manifest.options {
            if let Some(value) = option.initial_value()? {
                values.insert(option.name.clone(), value);
            }
        }

        Ok(Self {
            manifest,
            values: RefCell::new(values),
            actions: RefCell::new(HashMap::new()),
        })
    }

    /// Bind a handler to an `action` command.
    pub fn register_action(&self, name: &str, action: Rc<dyn MenuAction>) {
        self.actions.borrow_mut().insert(name.to_string(), action);
    }

    /// Current value of an option.
    pub fn value(&self, name: &str) -> Option<OptionValue> {
        self.values.borrow().get(name).cloned()
    }

    /// Overwrite an option value.
    pub fn set_value(&self, name: &str, value: OptionValue) {
        self.values.borrow_mut().insert(name.to_string(), value);
    }

    pub fn manifest(&self) -> &OptionsManifest {
        &self.manifest
    }

    /// Banner title: the `title` option when set, else the manifest's.
    pub fn title(&self) -> String {
        match self.value("title") {
            Some(OptionValue::String(title)) if !title.is_empty() => title,
            _ => self.manifest.menu.title.clone(),
        }
    }

    /// Help table listing every command.
    pub fn help_text(&self) -> String {
        let mut out = String::new();
        for option in &self.manifest.options {
            let current = match self.value(&option.name) {
                Some(value) => format!(" ({})", value),
                None => String::new(),
            };
            out.push_str(&format!(
                "{:<20} {:<10} {}{}\n",
                option.name,
                option.placeholder(),
                option.description,
                current
            ));
        }
        out.push_str(&format!("{:<20} {:<10} {}\n", "help, ?", "", "show this help"));
        out.push_str(&format!("{:<20} {:<10} {}\n", "exit", "", "end the session"));
        out
    }

    async fn execute(&self, option: &OptionSpec, args: &str, io: &mut SessionIo) {
        if option.kind == OptionKind::Action {
            let action = self.actions.borrow().get(&option.name).cloned();
            match action {
                Some(action) => {
                    if let Err(message) = action.run(args, io).await {
                        io.writeln(&format!("error: {}", message));
                    }
                }
                None => io.writeln(&format!("action '{}' has no handler", option.name)),
            }
            return;
        }

        if !args.is_empty() {
            match OptionValue::parse(option.kind, args) {
                Ok(value) => {
                    info!(option = %option.name, value = %value, "Menu option changed");
                    self.set_value(&option.name, value);
                }
                Err(message) => {
                    io.writeln(&format!("invalid value for {}: {}", option.name, message));
                    return;
                }
            }
        }

        if let Some(value) = self.value(&option.name) {
            io.writeln(&format!("{} ({})", option.name, value));
        }
    }
}

/// A session's view of its client.
pub struct SessionIo {
    client: ClientId,
    lines: UnboundedReceiver<String>,
    host: Rc<dyn HostFunctions>,
}

impl SessionIo {
    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn write(&self, text: &str) {
        self.host.client_write(self.client, text);
    }

    pub fn writeln(&self, text: &str) {
        self.host.client_write(self.client, &format!("{}\n", text));
    }

    /// Wait for the next input line. `None` once the client is gone.
    pub async fn read_line(&mut self) -> Option<String> {
        self.lines.next().await
    }

    /// Write `text` and wait for the answer.
    pub async fn prompt(&mut self, text: &str) -> Option<String> {
        self.write(text);
        self.read_line().await
    }
}

struct Session {
    lines: UnboundedSender<String>,
    task: LocalBoxFuture<'static, ()>,
}

impl Session {
    fn spawn(client: ClientId, host: Rc<dyn HostFunctions>, menu: Rc<Menu>) -> Self {
        let (lines, receiver) = unbounded();
        let io = SessionIo {
            client,
            lines: receiver,
            host,
        };
        Self {
            lines,
            task: command_loop(io, menu).boxed_local(),
        }
    }

    /// Run until the loop waits for input again. True once it has ended.
    fn poll(&mut self) -> bool {
        let mut cx = Context::from_waker(noop_waker_ref());
        self.task.poll_unpin(&mut cx).is_ready()
    }
}

async fn command_loop(mut io: SessionIo, menu: Rc<Menu>) {
    io.writeln(&format!(
        "{} - type 'help' for a list of commands",
        menu.title()
    ));

    loop {
        io.write("> ");
        let Some(line) = io.read_line().await else {
            break;
        };
        let line = line.trim_end_matches(['\r', '\n']).trim_start();
        if line.trim().is_empty() {
            break;
        }

        let (command, args) = split_command(line);
        match command {
            "?" | "help" => io.write(&menu.help_text()),
            "exit" => break,
            _ => match menu.manifest().get(command).cloned() {
                Some(option) => menu.execute(&option, args, &mut io).await,
                None => io.writeln(&format!(
                    "invalid command '{}'. type 'help' for a list of commands",
                    command
                )),
            },
        }
    }

    io.writeln("bye");
}

/// Split at the first whitespace run.
fn split_command(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(i) => (&line[..i], line[i..].trim_start()),
        None => (line, ""),
    }
}

/// Live sessions keyed by client.
#[derive(Default)]
pub struct SessionTable {
    sessions: RefCell<HashMap<ClientId, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session for `client`, replacing any previous one.
    pub fn connect(&self, client: ClientId, host: Rc<dyn HostFunctions>, menu: Rc<Menu>) {
        debug!(client, "Menu session started");
        self.sessions.borrow_mut().remove(&client);

        let mut session = Session::spawn(client, host, menu);
        if !session.poll() {
            self.sessions.borrow_mut().entry(client).or_insert(session);
        }
    }

    /// Deliver a line to `client`'s session.
    ///
    /// The session is taken out of the table while it runs, so input that
    /// arrives for it from inside the session is dropped instead of
    /// re-entering it.
    pub fn input(&self, client: ClientId, line: String) {
        let Some(mut session) = self.sessions.borrow_mut().remove(&client) else {
            debug!(client, "Input for client without a session");
            return;
        };

        if session.lines.unbounded_send(line).is_err() {
            return;
        }

        if session.poll() {
            debug!(client, "Menu session ended");
        } else {
            self.sessions.borrow_mut().entry(client).or_insert(session);
        }
    }

    /// Drop `client`'s session. False if there was none.
    pub fn disconnect(&self, client: ClientId) -> bool {
        self.sessions.borrow_mut().remove(&client).is_some()
    }

    pub fn contains(&self, client: ClientId) -> bool {
        self.sessions.borrow().contains_key(&client)
    }

    pub fn len(&self) -> usize {
        self.sessions.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.sessions.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;

    const MANIFEST: &str = r#"
[menu]
title = "test node"

[[option]]
name = "enabled"
type = "boolean"
description = "toggle"
default = true

[[option]]
name = "greeting"
type = "string"
description = "text"
default = "hi"

[[option]]
name = "ping"
type = "action"
description = "answer pong"
"#;

    struct Ping;

    #[async_trait(?Send)]
    impl MenuAction for Ping {
        async fn run(&self, args: &str, io: &mut SessionIo) -> Result<(), String> {
            if args == "fail" {
                return Err("asked to fail".to_string());
            }
            io.writeln("pong");
            Ok(())
        }
    }

    struct Confirm;

    #[async_trait(?Send)]
    impl MenuAction for Confirm {
        async fn run(&self, _args: &str, io: &mut SessionIo) -> Result<(), String> {
            let answer = io.prompt("sure? ").await.unwrap_or_default();
            io.writeln(&format!("answered {}", answer));
            Ok(())
        }
    }

    fn setup() -> (Rc<MemoryHost>, Rc<Menu>, SessionTable) {
        let host = Rc::new(MemoryHost::new());
        let menu = Rc::new(Menu::new(OptionsManifest::from_str(MANIFEST).unwrap()).unwrap());
        menu.register_action("ping", Rc::new(Ping));
        (host, menu, SessionTable::new())
    }

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("greeting hello  world"), ("greeting", "hello  world"));
        assert_eq!(split_command("help"), ("help", ""));
        assert_eq!(split_command("a \t b"), ("a", "b"));
    }

    #[test]
    fn test_banner_and_prompt() {
        let (host, menu, table) = setup();
        table.connect(1, host.clone(), menu);
        assert_eq!(
            host.take_output(1),
            "test node - type 'help' for a list of commands\n> "
        );
        assert!(table.contains(1));
    }

    #[test]
    fn test_value_report_and_update() {
        let (host, menu, table) = setup();
        table.connect(1, host.clone(), menu.clone());
        host.take_output(1);

        table.input(1, "enabled".to_string());
        assert_eq!(host.take_output(1), "enabled (true)\n> ");

        table.input(1, "enabled off".to_string());
        assert_eq!(host.take_output(1), "enabled (false)\n> ");
        assert_eq!(menu.value("enabled"), Some(OptionValue::Boolean(false)));

        table.input(1, "enabled maybe".to_string());
        assert!(host.take_output(1).starts_with("invalid value for enabled"));
        assert_eq!(menu.value("enabled"), Some(OptionValue::Boolean(false)));
    }

    #[test]
    fn test_unknown_command() {
        let (host, menu, table) = setup();
        table.connect(1, host.clone(), menu);
        host.take_output(1);

        table.input(1, "frobnicate now".to_string());
        assert_eq!(
            host.take_output(1),
            "invalid command 'frobnicate'. type 'help' for a list of commands\n> "
        );
    }

    #[test]
    fn test_actions() {
        let (host, menu, table) = setup();
        table.connect(1, host.clone(), menu);
        host.take_output(1);

        table.input(1, "ping".to_string());
        assert_eq!(host.take_output(1), "pong\n> ");

        table.input(1, "ping fail".to_string());
        assert_eq!(host.take_output(1), "error: asked to fail\n> ");
    }

    #[test]
    fn test_action_prompt_waits_for_input() {
        let (host, menu, table) = setup();
        menu.register_action("ping", Rc::new(Confirm));
        table.connect(1, host.clone(), menu);
        host.take_output(1);

        table.input(1, "ping".to_string());
        assert_eq!(host.take_output(1), "sure? ");

        table.input(1, "yes".to_string());
        assert_eq!(host.take_output(1), "answered yes\n> ");
    }

    #[test]
    fn test_exit_ends_session() {
        let (host, menu, table) = setup();
        table.connect(1, host.clone(), menu);
        host.take_output(1);

        table.input(1, "exit".to_string());
        assert_eq!(host.take_output(1), "bye\n");
        assert!(!table.contains(1));

        table.input(1, "help".to_string());
        assert_eq!(host.take_output(1), "");
        assert!(!table.disconnect(1));
    }

    #[test]
    fn test_help_lists_commands() {
        let (host, menu, table) = setup();
        table.connect(1, host.clone(), menu);
        host.take_output(1);

        table.input(1, "?".to_string());
        let help = host.take_output(1);
        for command in ["enabled", "greeting", "ping", "help", "exit"] {
            assert!(help.contains(command), "missing {command}");
        }
        assert!(help.contains("(hi)"));
    }

    #[test]
    fn test_sessions_are_independent() {
        let (host, menu, table) = setup();
        table.connect(1, host.clone(), menu.clone());
        table.connect(2, host.clone(), menu);
        table.input(1, "".to_string());

        assert!(!table.contains(1));
        assert!(table.contains(2));
        assert_eq!(table.len(), 1);
    }
}
