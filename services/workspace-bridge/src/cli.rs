//! Command-line parsing
//!
//! `google-workspace-bridge [--config PATH] [auth [SERVICE...] | status | revoke | serve]`
//!
//! With no command the bridge serves the tool protocol on stdin/stdout.

use anyhow::{Result, bail};

pub const USAGE: &str = "\
Usage: google-workspace-bridge [--config PATH] [COMMAND]

Commands:
  auth [SERVICE...]  Authorize access in the browser (calendar, gmail, drive, sheets)
  status             Show token status
  revoke             Revoke the grant and delete stored tokens
  serve              Serve line-delimited JSON tool calls on stdin/stdout (default)

Environment:
  GOOGLE_CLIENT_ID, GOOGLE_CLIENT_SECRET, GOOGLE_CLIENT_SECRET_FILE,
  GOOGLE_REDIRECT_URI, TOKEN_ENCRYPTION_KEY, CONFIG_PATH, LOG_LEVEL
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Auth { services: Vec<String> },
    Status,
    Revoke,
    Serve,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cli {
    pub config_path: Option<String>,
    pub command: Command,
}

impl Cli {
    /// Parse arguments, excluding the program name.
    pub fn parse<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config_path = None;
        let mut positional = Vec::new();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => match args.next() {
                    Some(path) => config_path = Some(path),
                    None => bail!("--config requires a path"),
                },
                "-h" | "--help" => {
                    return Ok(Self {
                        config_path,
                        command: Command::Help,
                    });
                }
                flag if flag.starts_with("--config=") => {
                    config_path = Some(flag["--config=".len()..].to_string());
                }
                flag if flag.starts_with('-') => bail!("unknown option {flag}\n\n{USAGE}"),
                _ => positional.push(arg),
            }
        }

        let mut positional = positional.into_iter();
        let command = match positional.next().as_deref() {
            None | Some("serve") => Command::Serve,
            Some("auth") => Command::Auth {
                services: positional.by_ref().collect(),
            },
            Some("status") => Command::Status,
            Some("revoke") => Command::Revoke,
            Some("help") => Command::Help,
            Some(other) => bail!("unknown command {other:?}\n\n{USAGE}"),
        };
        if let Some(extra) = positional.next() {
            bail!("unexpected argument {extra:?}\n\n{USAGE}");
        }

        Ok(Self {
            config_path,
            command,
        })
    }
}
