use log::trace;

use crate::patcher::Patcher;
use crate::protection::ProtectionController;
use crate::resolver::SignatureResolver;

pub const USAGE: &str = "usage: status | patch <name> | restore <name>";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Status,
    Patch(String),
    Restore(String),
    /// Known subcommand given without its patch name
    Usage(&'static str),
    Unknown(String),
}

impl Command {
    /// Parses one command line; quoting follows shell rules.
    ///
    /// Example
    /// ```rust
    /// use sigpatch::command::Command;
    /// assert_eq!(Command::parse("patch 'Movement Unlocker'"), Command::Patch("Movement Unlocker".into()));
    /// assert_eq!(Command::parse("status"), Command::Status);
    /// ```
    pub fn parse(line: &str) -> Command {
        let args = match shlex::split(line) {
            Some(args) => args,
            None => return Command::Unknown(line.to_string()),
        };
        trace!("Command arguments: {:?}", args);
        let mut args = args.into_iter();
        let subcommand = match args.next() {
            Some(subcommand) => subcommand,
            None => return Command::Usage(USAGE),
        };
        match subcommand.to_ascii_lowercase().as_str() {
            "status" => Command::Status,
            "patch" => match args.next() {
                Some(name) => Command::Patch(name),
                None => Command::Usage("usage: patch <name>"),
            },
            "restore" => match args.next() {
                Some(name) => Command::Restore(name),
                None => Command::Usage("usage: restore <name>"),
            },
            _ => Command::Unknown(subcommand),
        }
    }
}

/// Runs one command line against `patcher` and returns the response lines.
pub fn dispatch<R, P>(patcher: &Patcher<R, P>, line: &str) -> Vec<String>
where
    R: SignatureResolver,
    P: ProtectionController,
{
    match Command::parse(line) {
        Command::Status => {
            let statuses = patcher.status();
            if statuses.is_empty() {
                return vec!["No patches configured".to_string()];
            }
            statuses.iter().map(ToString::to_string).collect()
        }
        Command::Patch(name) => vec![match patcher.apply(&name) {
            Ok(address) => format!("Patch '{}' successfully patched at {:#x}.", name, address),
            Err(err) => err.to_string(),
        }],
        Command::Restore(name) => vec![match patcher.restore(&name) {
            Ok(()) => format!("Patch '{}' successfully restored.", name),
            Err(err) => err.to_string(),
        }],
        Command::Usage(usage) => vec![usage.to_string()],
        Command::Unknown(_) => vec!["Unknown command".to_string(), USAGE.to_string()],
    }
}
