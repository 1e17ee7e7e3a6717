//! Command-line flags and the interactive line commands.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use nearcast_core::{DeviceId, SessionView};

#[derive(Debug, Parser)]
#[command(name = "nearcast", version, about = "Share locations and images with nearby peers")]
pub struct Cli {
    /// Config file (default: ~/.config/nearcast/config.toml, then /etc/nearcast/config.toml).
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Display name shown to other peers.
    #[arg(short, long)]
    pub name: Option<String>,
    #[arg(long)]
    pub service_tag: Option<String>,
    #[arg(long)]
    pub discovery_port: Option<u16>,
    /// Session port; 0 picks a free one.
    #[arg(long)]
    pub transport_port: Option<u16>,
}

impl Cli {
    pub fn apply(&self, config: &mut crate::config::Config) {
        if let Some(n) = &self.name {
            config.display_name = n.clone();
        }
        if let Some(t) = &self.service_tag {
            config.service_tag = t.clone();
        }
        if let Some(p) = self.discovery_port {
            config.discovery_port = p;
        }
        if let Some(p) = self.transport_port {
            config.transport_port = p;
        }
    }
}

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Peers,
    /// Peer by 1-based index in `peers` output, or by display name.
    Connect(String),
    Location(String),
    Image(PathBuf),
    View,
    Refresh,
    Help,
    Quit,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command `{0}` (try `help`)")]
    Unknown(String),
    #[error("`{0}` needs an argument")]
    MissingArgument(&'static str),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let arg = |name: &'static str| {
            if rest.is_empty() {
                Err(CommandError::MissingArgument(name))
            } else {
                Ok(rest.to_string())
            }
        };
        match word {
            "peers" | "ls" => Ok(Command::Peers),
            "connect" => arg("connect").map(Command::Connect),
            "location" | "loc" => arg("location").map(Command::Location),
            "image" | "img" => arg("image").map(|p| Command::Image(PathBuf::from(p))),
            "view" => Ok(Command::View),
            "refresh" => Ok(Command::Refresh),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

pub const HELP: &str = "\
commands:
  peers                 list discovered peers
  connect <n|name>      invite a discovered peer
  location <text>       share a location with connected peers
  image <path>          share an image file with connected peers
  view                  show connected peers and what they sent
  refresh               forget idle peers and rediscover
  quit";

/// Resolve `connect` arguments against the discovered list.
pub fn resolve_peer(view: &SessionView, target: &str) -> Option<DeviceId> {
    if let Ok(n) = target.parse::<usize>() {
        return n
            .checked_sub(1)
            .and_then(|i| view.discovered.get(i))
            .map(|p| p.device_id());
    }
    view.discovered
        .iter()
        .find(|p| p.display_name() == target)
        .map(|p| p.device_id())
}

pub fn render_peers(view: &SessionView) -> String {
    if view.discovered.is_empty() {
        return "no peers found yet".to_string();
    }
    view.discovered
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{:>3}. {:<24} {}", i + 1, p.display_name(), view.state_of(p)))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_view(view: &SessionView) -> String {
    let mut out = Vec::new();
    if view.nearby.is_empty() {
        out.push("no connected peers".to_string());
    } else {
        out.push(format!("connected: {}", view.nearby.join(", ")));
    }
    let mut names: Vec<&String> = view.received_locations.keys().collect();
    names.sort();
    for name in names {
        out.push(format!("  {name} is at {}", view.received_locations[name]));
    }
    let mut names: Vec<&String> = view.received_images.keys().collect();
    names.sort();
    for name in names {
        out.push(format!("  {name} sent an image ({} bytes)", view.received_images[name].len()));
    }
    out.join("\n")
}
