use std::path::PathBuf;
use std::str::FromStr;

use super::error::CommandError;

/// A run-control command, parsed from one `VERB parameters` text line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Reload the configuration, optionally from a different file
    Configure(Option<PathBuf>),
    Start(u32),
    Stop,
    Reset,
    Terminate,
    Status,
    /// `CMD <SUBCOMMAND> [args...]`, the relay form used by hardware producers
    Relay {
        subcommand: String,
        args: Vec<String>,
    },
}

impl Command {
    /// Parse a command line. Verbs are case-insensitive; relay subcommands are normalized
    /// to upper case.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut words = line.split_whitespace();
        let verb = match words.next() {
            Some(v) => v.to_ascii_lowercase(),
            None => return Err(CommandError::Empty),
        };
        let rest: Vec<&str> = words.collect();

        match verb.as_str() {
            "configure" => match rest.as_slice() {
                [] => Ok(Self::Configure(None)),
                [path] => Ok(Self::Configure(Some(PathBuf::from(path)))),
                _ => Err(CommandError::BadParameter("configure", rest.join(" "))),
            },
            "start" => match rest.as_slice() {
                [] => Err(CommandError::MissingParameter("start")),
                [run] => run
                    .parse::<u32>()
                    .map(Self::Start)
                    .map_err(|_| CommandError::BadParameter("start", run.to_string())),
                _ => Err(CommandError::BadParameter("start", rest.join(" "))),
            },
            "stop" => no_parameters(Self::Stop, "stop", &rest),
            "reset" => no_parameters(Self::Reset, "reset", &rest),
            "terminate" => no_parameters(Self::Terminate, "terminate", &rest),
            "status" => no_parameters(Self::Status, "status", &rest),
            "cmd" => match rest.split_first() {
                Some((subcommand, args)) => Ok(Self::Relay {
                    subcommand: subcommand.to_ascii_uppercase(),
                    args: args.iter().map(|a| a.to_string()).collect(),
                }),
                None => Err(CommandError::MissingParameter("cmd")),
            },
            _ => Err(CommandError::UnknownVerb(verb)),
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Self::Configure(_) => "configure",
            Self::Start(_) => "start",
            Self::Stop => "stop",
            Self::Reset => "reset",
            Self::Terminate => "terminate",
            Self::Status => "status",
            Self::Relay { .. } => "cmd",
        }
    }
}

fn no_parameters(
    command: Command,
    verb: &'static str,
    rest: &[&str],
) -> Result<Command, CommandError> {
    if rest.is_empty() {
        Ok(command)
    } else {
        Err(CommandError::BadParameter(verb, rest.join(" ")))
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
