//! Console command grammar.

use anyhow::{bail, Result};

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Show the roster.
    List,
    Search(String),
    /// Call by list number, id or handle.
    Call(String),
    Accept,
    Decline,
    HangUp,
    Cameras,
    Microphones,
    Refresh,
    /// Switch to a camera by list number or device id.
    Switch(String),
    Video(bool),
    Mic(bool),
    Preview(bool),
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
  list                 show who is online
  search <text>        filter the list by handle
  call <n|id|handle>   call someone
  accept | decline     answer or reject an incoming call
  hangup               end the current call
  cameras | mics       list capture devices
  refresh              re-scan capture devices
  switch <n|id>        switch camera (works mid-call)
  video on|off         enable/disable the camera
  mic on|off           mute/unmute the microphone
  preview on|off       start/stop local preview
  status               show the current call
  help                 this text
  quit                 leave";

fn on_off(arg: Option<&str>, what: &str) -> Result<bool> {
    match arg.map(str::to_ascii_lowercase).as_deref() {
        Some("on") | Some("1") | Some("yes") => Ok(true),
        Some("off") | Some("0") | Some("no") => Ok(false),
        _ => bail!("usage: {} on|off", what),
    }
}

impl ConsoleCommand {
    /// Parse a line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((w, r)) => (w, r.trim()),
            None => (line, ""),
        };
        let arg = (!rest.is_empty()).then_some(rest);

        let cmd = match word.to_ascii_lowercase().as_str() {
            "list" | "ls" | "who" => ConsoleCommand::List,
            "search" | "find" => ConsoleCommand::Search(rest.to_string()),
            "call" | "dial" => match arg {
                Some(target) => ConsoleCommand::Call(target.to_string()),
                None => bail!("usage: call <n|id|handle>"),
            },
            "accept" | "answer" | "a" => ConsoleCommand::Accept,
            "decline" | "reject" | "d" => ConsoleCommand::Decline,
            "hangup" | "hang-up" | "bye" | "h" => ConsoleCommand::HangUp,
            "cameras" | "cams" => ConsoleCommand::Cameras,
            "mics" | "microphones" => ConsoleCommand::Microphones,
            "refresh" => ConsoleCommand::Refresh,
            "switch" | "camera" => match arg {
                Some(target) => ConsoleCommand::Switch(target.to_string()),
                None => bail!("usage: switch <n|id>"),
            },
            "video" => ConsoleCommand::Video(on_off(arg, "video")?),
            "mic" | "audio" => ConsoleCommand::Mic(on_off(arg, "mic")?),
            "mute" => ConsoleCommand::Mic(false),
            "unmute" => ConsoleCommand::Mic(true),
            "preview" => ConsoleCommand::Preview(match arg {
                None => true,
                some => on_off(some, "preview")?,
            }),
            "status" | "st" => ConsoleCommand::Status,
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" | "q" => ConsoleCommand::Quit,
            other => bail!("unknown command '{}' (try 'help')", other),
        };
        Ok(Some(cmd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> ConsoleCommand {
        ConsoleCommand::parse(line).unwrap().unwrap()
    }

    #[test]
    fn test_parse_basic_commands() {
        assert_eq!(parse("list"), ConsoleCommand::List);
        assert_eq!(parse("  ACCEPT "), ConsoleCommand::Accept);
        assert_eq!(parse("hangup"), ConsoleCommand::HangUp);
        assert_eq!(parse("q"), ConsoleCommand::Quit);
        assert_eq!(ConsoleCommand::parse("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse("call 2"), ConsoleCommand::Call("2".into()));
        assert_eq!(
            parse("call  bob@example.com"),
            ConsoleCommand::Call("bob@example.com".into())
        );
        assert_eq!(
            parse("switch cam-back-camera"),
            ConsoleCommand::Switch("cam-back-camera".into())
        );
        assert_eq!(parse("search al"), ConsoleCommand::Search("al".into()));
        assert_eq!(parse("search"), ConsoleCommand::Search(String::new()));
    }

    #[test]
    fn test_parse_toggles() {
        assert_eq!(parse("video off"), ConsoleCommand::Video(false));
        assert_eq!(parse("mic ON"), ConsoleCommand::Mic(true));
        assert_eq!(parse("mute"), ConsoleCommand::Mic(false));
        assert_eq!(parse("preview"), ConsoleCommand::Preview(true));
        assert_eq!(parse("preview off"), ConsoleCommand::Preview(false));
    }

    #[test]
    fn test_parse_errors() {
        assert!(ConsoleCommand::parse("call").is_err());
        assert!(ConsoleCommand::parse("video maybe").is_err());
        assert!(ConsoleCommand::parse("switch").is_err());
        let err = ConsoleCommand::parse("teleport").unwrap_err();
        assert!(err.to_string().contains("unknown command"));
    }
}
