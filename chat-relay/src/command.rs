//! `-`-prefixed requests: the command table, the parser and the dispatcher.
//!
//! Dispatch never performs I/O on the caller's connection. It mutates the
//! registries, queues lines for other sessions, and hands back the lines the
//! caller should see plus whatever the session has to do next.

use std::{net::SocketAddr, time::Instant};

use thiserror::Error;

use crate::{
    broadcast,
    context::{ServerContext, format_elapsed},
    wire::{self, SEPARATOR},
};

const CLEAR_SCREEN_LINES: usize = 50;
const NOT_ADMIN: &str = "Failed. You are not an Administrator.";

/// Which callers see a command in `-h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    Admins,
    NonAdmins,
}

#[derive(Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    pub usage: &'static str,
    pub summary: &'static str,
    pub takes_argument: bool,
    pub admin_only: bool,
    pub audience: Audience,
    build: fn(&str) -> Result<Command, ParseError>,
}

impl CommandSpec {
    fn help_line(&self) -> String {
        format!("{:<20}{}", self.usage, self.summary)
    }
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "-h",
        usage: "-h",
        summary: "Display the list of request commands",
        takes_argument: false,
        admin_only: false,
        audience: Audience::Everyone,
        build: |_| Ok(Command::Help),
    },
    CommandSpec {
        name: "-sip",
        usage: "-sip",
        summary: "Display the server's IP Address",
        takes_argument: false,
        admin_only: false,
        audience: Audience::Everyone,
        build: |_| Ok(Command::ServerAddress),
    },
    CommandSpec {
        name: "-num",
        usage: "-num",
        summary: "Display the number of people in the chat room",
        takes_argument: false,
        admin_only: false,
        audience: Audience::Everyone,
        build: |_| Ok(Command::Count),
    },
    CommandSpec {
        name: "-st",
        usage: "-st",
        summary: "Display how long the server has been running",
        takes_argument: false,
        admin_only: false,
        audience: Audience::Everyone,
        build: |_| Ok(Command::ServerTime),
    },
    CommandSpec {
        name: "-ct",
        usage: "-ct",
        summary: "Display how long you have been here",
        takes_argument: false,
        admin_only: false,
        audience: Audience::Everyone,
        build: |_| Ok(Command::ClientTime),
    },
    CommandSpec {
        name: "-block",
        usage: "-block name",
        summary: "Block all the messages from another user",
        takes_argument: true,
        admin_only: false,
        audience: Audience::Everyone,
        build: |name| Ok(Command::Block(name.to_string())),
    },
    CommandSpec {
        name: "-unblock",
        usage: "-unblock name",
        summary: "Unblock a user",
        takes_argument: true,
        admin_only: false,
        audience: Audience::Everyone,
        build: |name| Ok(Command::Unblock(name.to_string())),
    },
    CommandSpec {
        name: "-private",
        usage: "-private name: msg",
        summary: "Send a private message to another user",
        takes_argument: true,
        admin_only: false,
        audience: Audience::Everyone,
        build: parse_private,
    },
    CommandSpec {
        name: "-cls",
        usage: "-cls",
        summary: "Clear screen",
        takes_argument: false,
        admin_only: false,
        audience: Audience::Everyone,
        build: |_| Ok(Command::Clear),
    },
    CommandSpec {
        name: "-exit",
        usage: "-exit",
        summary: "Disconnect and exit",
        takes_argument: false,
        admin_only: false,
        audience: Audience::Everyone,
        build: |_| Ok(Command::Exit),
    },
    CommandSpec {
        name: "-kick",
        usage: "-kick name",
        summary: "Kick a user out of the chat room",
        takes_argument: true,
        admin_only: true,
        audience: Audience::Admins,
        build: |name| Ok(Command::Kick(name.to_string())),
    },
    CommandSpec {
        name: "-shutdown",
        usage: "-shutdown",
        summary: "Shut down the server",
        takes_argument: false,
        admin_only: true,
        audience: Audience::Admins,
        build: |_| Ok(Command::Shutdown),
    },
    CommandSpec {
        name: "-admin",
        usage: "-admin password",
        summary: "Enter the password to become an Administrator",
        takes_argument: true,
        admin_only: false,
        audience: Audience::NonAdmins,
        build: |secret| Ok(Command::Admin(secret.to_string())),
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    ClientTime,
    ServerTime,
    ServerAddress,
    Count,
    Clear,
    Exit,
    Block(String),
    Unblock(String),
    Private { target: String, message: String },
    Admin(String),
    Kick(String),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("{0} is not recognized as a command.")]
    Unknown(String),
    #[error("Failed. Invalid format.")]
    Malformed { usage: &'static str },
}

impl ParseError {
    /// Lines sent back to the caller, server prefix included.
    pub fn feedback(&self) -> Vec<String> {
        let hint = match self {
            ParseError::Unknown(_) => "You may enter '-h' for help.".to_string(),
            ParseError::Malformed { usage } => format!("Valid Format: '{usage}'."),
        };
        vec![wire::server_line(self.to_string()), wire::server_line(hint)]
    }
}

impl Command {
    /// Parses a whole input line that starts with `-`.
    ///
    /// The command name runs up to the first space; argument-taking commands
    /// receive the rest of the line verbatim.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let (name, argument) = match line.split_once(' ') {
            Some((name, argument)) => (name, Some(argument)),
            None => (line, None),
        };

        let spec = find(name).ok_or_else(|| ParseError::Unknown(line.to_string()))?;
        match (spec.takes_argument, argument) {
            (true, Some(argument)) => (spec.build)(argument),
            (true, None) => Err(ParseError::Malformed { usage: spec.usage }),
            (false, None) => (spec.build)(""),
            (false, Some(_)) => Err(ParseError::Unknown(line.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Help => "-h",
            Command::ClientTime => "-ct",
            Command::ServerTime => "-st",
            Command::ServerAddress => "-sip",
            Command::Count => "-num",
            Command::Clear => "-cls",
            Command::Exit => "-exit",
            Command::Block(_) => "-block",
            Command::Unblock(_) => "-unblock",
            Command::Private { .. } => "-private",
            Command::Admin(_) => "-admin",
            Command::Kick(_) => "-kick",
            Command::Shutdown => "-shutdown",
        }
    }

    pub fn requires_admin(&self) -> bool {
        find(self.name()).is_some_and(|spec| spec.admin_only)
    }
}

fn find(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|spec| spec.name == name)
}

fn parse_private(argument: &str) -> Result<Command, ParseError> {
    let malformed = ParseError::Malformed {
        usage: "-private name: message",
    };
    let (target, message) = argument.split_once(':').ok_or(malformed.clone())?;
    let (target, message) = (target.trim(), message.trim());
    if target.is_empty() || message.is_empty() {
        return Err(malformed);
    }
    Ok(Command::Private {
        target: target.to_string(),
        message: message.to_string(),
    })
}

/// What the session should do after a command ran.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    #[default]
    Continue,
    Exit,
    Shutdown,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Lines for the caller, already formatted for the wire.
    pub replies: Vec<String>,
    pub action: Action,
}

impl Outcome {
    fn reply(lines: Vec<String>) -> Self {
        Self {
            replies: lines,
            action: Action::Continue,
        }
    }

    fn feedback<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::reply(lines.into_iter().map(wire::server_line).collect())
    }

    fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }
}

/// The validated session issuing a command.
#[derive(Debug, Clone, Copy)]
pub struct Caller<'a> {
    pub name: &'a str,
    pub joined_at: Instant,
    /// Server end of the caller's connection.
    pub server_addr: SocketAddr,
}

/// Parses and runs one command line on behalf of `caller`.
pub fn dispatch(context: &ServerContext, caller: &Caller<'_>, line: &str) -> Outcome {
    match Command::parse(line) {
        Ok(command) => execute(context, caller, command),
        Err(err) => Outcome::reply(err.feedback()),
    }
}

pub fn execute(context: &ServerContext, caller: &Caller<'_>, command: Command) -> Outcome {
    let registries = &context.registries;
    if command.requires_admin() && !registries.admins.contains(caller.name) {
        return Outcome::feedback([NOT_ADMIN]);
    }

    match command {
        Command::Help => Outcome::reply(help(context, caller)),
        Command::ClientTime => Outcome::feedback([format!(
            "You have been staying here for {}",
            format_elapsed(caller.joined_at.elapsed())
        )]),
        Command::ServerTime => Outcome::feedback([format!(
            "The server has been running for {}",
            format_elapsed(context.uptime())
        )]),
        Command::ServerAddress => Outcome::feedback([format!(
            "The server's IP Address is {}",
            caller.server_addr
        )]),
        Command::Count => Outcome::feedback([format!(
            "The number of people in the chat room is {}",
            registries.directory.len()
        )]),
        Command::Clear => Outcome::reply(vec![String::new(); CLEAR_SCREEN_LINES]),
        Command::Exit => Outcome::default().with_action(Action::Exit),
        Command::Block(target) => block(context, caller, &target),
        Command::Unblock(target) => unblock(context, caller, &target),
        Command::Private { target, message } => private(context, caller, &target, &message),
        Command::Admin(secret) => admin(context, caller, &secret),
        Command::Kick(target) => kick(context, caller, &target),
        Command::Shutdown => {
            Outcome::feedback(["You have shut down the server."]).with_action(Action::Shutdown)
        }
    }
}

fn not_found(name: &str) -> String {
    format!("Failed. Cannot find a user named {name}.")
}

fn help(context: &ServerContext, caller: &Caller<'_>) -> Vec<String> {
    let is_admin = context.registries.admins.contains(caller.name);
    let mut lines = vec![SEPARATOR.to_string(), "The list of request commands:".to_string()];
    lines.extend(
        COMMANDS
            .iter()
            .filter(|spec| match spec.audience {
                Audience::Everyone => true,
                Audience::Admins => is_admin,
                Audience::NonAdmins => !is_admin,
            })
            .map(CommandSpec::help_line),
    );
    lines.push(SEPARATOR.to_string());
    lines
}

fn block(context: &ServerContext, caller: &Caller<'_>, target: &str) -> Outcome {
    let registries = &context.registries;
    if target == caller.name {
        return Outcome::feedback(["You cannot block yourself."]);
    }
    if !registries.directory.contains(target) {
        return Outcome::feedback([not_found(target)]);
    }

    registries.blocks.block(caller.name, target);
    Outcome::feedback([format!(
        "You will no longer receive the messages from {target}."
    )])
}

fn unblock(context: &ServerContext, caller: &Caller<'_>, target: &str) -> Outcome {
    let registries = &context.registries;
    if !registries.directory.contains(target) {
        return Outcome::feedback([not_found(target)]);
    }

    registries.blocks.unblock(caller.name, target);
    Outcome::feedback([format!("You will now receive messages from {target}.")])
}

fn private(context: &ServerContext, caller: &Caller<'_>, target: &str, message: &str) -> Outcome {
    let registries = &context.registries;
    if target == caller.name {
        return Outcome::feedback(["You are not allowed to send a private message to yourself."]);
    }
    let Some(outlet) = registries.directory.outlet(target) else {
        return Outcome::feedback([not_found(target)]);
    };
    if registries.blocks.blocks(target, caller.name) {
        return Outcome::feedback([format!("Failed. You are blocked by {target}.")]);
    }
    if !outlet.send_line(broadcast::private_line(caller.name, message)) {
        return Outcome::feedback([not_found(target)]);
    }

    Outcome::feedback([format!("You've sent a private message to {target}.")])
}

fn admin(context: &ServerContext, caller: &Caller<'_>, secret: &str) -> Outcome {
    if !context.verify_admin_secret(secret) {
        return Outcome::feedback(["Wrong password."]);
    }
    if !context.registries.admins.grant(caller.name) {
        return Outcome::feedback(["You are already an Administrator."]);
    }

    broadcast::announce(
        context,
        Some(caller.name),
        &format!("{} has become an Administrator.", caller.name),
    );
    Outcome::feedback([
        "You are now an Administrator.",
        "Enter '-h' to see your extra commands.",
    ])
}

fn kick(context: &ServerContext, caller: &Caller<'_>, target: &str) -> Outcome {
    let registries = &context.registries;
    let Some(outlet) = registries.directory.outlet(target) else {
        return Outcome::feedback([not_found(target)]);
    };
    if registries.admins.contains(target) {
        return Outcome::feedback(["Failed. Cannot kick out another Administrator."]);
    }
    if !outlet.kick() {
        return Outcome::feedback([not_found(target)]);
    }

    broadcast::announce(
        context,
        Some(caller.name),
        &format!("{target} is kicked out of the chat room by {}", caller.name),
    );
    Outcome::feedback([format!("You have kicked {target} out of the chat room.")])
}
