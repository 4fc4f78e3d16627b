//! Console command parsing

use anyhow::bail;
use std::str::FromStr;

pub const HELP: &[&str] = &[
    "add [CODE]   select the proxy for an access code (default: last entered code)",
    "start        start the local proxy",
    "stop         stop the local proxy and VPN",
    "vpn-start    route the VPN device through the proxy",
    "vpn-stop     unbind the VPN device",
    "status       show session state",
    "quit         stop everything and exit",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add(Option<String>),
    Start,
    Stop,
    VpnStart,
    VpnStop,
    Status,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            bail!("Empty command");
        };
        let arg = words.next().map(str::to_string);
        if words.next().is_some() {
            bail!("Too many arguments for '{}'", name);
        }

        let command = match name.to_ascii_lowercase().as_str() {
            "add" => return Ok(Command::Add(arg)),
            "start" => Command::Start,
            "stop" => Command::Stop,
            "vpn-start" => Command::VpnStart,
            "vpn-stop" => Command::VpnStop,
            "status" => Command::Status,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => bail!("Unknown command '{}', try 'help'", other),
        };

        if arg.is_some() {
            bail!("'{}' takes no arguments", name);
        }
        Ok(command)
    }
}
