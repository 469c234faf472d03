//! Interactive commands read from stdin while the node runs.

use libp2p::Multiaddr;

pub const HELP: &str = "\
Commands:
  dial <multiaddr>          connect to a peer
  publish <topic> <text>    publish a message
  subscribe <topic>         join a topic
  status                    print the full node status
  peers                     list connected peers
  log <directives>          change the log filter, e.g. `log debug`
  log off                   silence logging
  help                      show this message
  quit                      shut down";

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Dial(Multiaddr),
    Publish { topic: String, text: String },
    Subscribe(String),
    Status,
    Peers,
    Log(String),
    LogOff,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parse one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word {
            "dial" => {
                if rest.is_empty() {
                    return Err("usage: dial <multiaddr>".to_string());
                }
                let addr = rest
                    .parse::<Multiaddr>()
                    .map_err(|e| format!("invalid multiaddr {:?}: {}", rest, e))?;
                ConsoleCommand::Dial(addr)
            }
            "publish" => match rest.split_once(char::is_whitespace) {
                Some((topic, text)) if !text.trim().is_empty() => ConsoleCommand::Publish {
                    topic: topic.to_string(),
                    text: text.trim().to_string(),
                },
                _ => return Err("usage: publish <topic> <text>".to_string()),
            },
            "subscribe" => {
                if rest.is_empty() || rest.contains(char::is_whitespace) {
                    return Err("usage: subscribe <topic>".to_string());
                }
                ConsoleCommand::Subscribe(rest.to_string())
            }
            "status" => ConsoleCommand::Status,
            "peers" => ConsoleCommand::Peers,
            "log" => match rest {
                "" => return Err("usage: log <directives> | log off".to_string()),
                "off" => ConsoleCommand::LogOff,
                directives => ConsoleCommand::Log(directives.to_string()),
            },
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            other => return Err(format!("unknown command {:?}, try `help`", other)),
        };
        Ok(Some(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dial() {
        let cmd = ConsoleCommand::parse("dial /ip4/127.0.0.1/tcp/9002").unwrap();
        assert_eq!(
            cmd,
            Some(ConsoleCommand::Dial("/ip4/127.0.0.1/tcp/9002".parse().unwrap()))
        );
        assert!(ConsoleCommand::parse("dial").is_err());
        assert!(ConsoleCommand::parse("dial nowhere").is_err());
    }

    #[test]
    fn test_parse_publish_keeps_spaces_in_text() {
        let cmd = ConsoleCommand::parse("  publish welcome_0.0.1 hello there  ").unwrap();
        assert_eq!(
            cmd,
            Some(ConsoleCommand::Publish {
                topic: "welcome_0.0.1".to_string(),
                text: "hello there".to_string(),
            })
        );
        assert!(ConsoleCommand::parse("publish welcome_0.0.1").is_err());
    }

    #[test]
    fn test_parse_log_and_simple_commands() {
        assert_eq!(
            ConsoleCommand::parse("log info,waypoint_p2p=debug").unwrap(),
            Some(ConsoleCommand::Log("info,waypoint_p2p=debug".to_string()))
        );
        assert_eq!(
            ConsoleCommand::parse("log off").unwrap(),
            Some(ConsoleCommand::LogOff)
        );
        assert_eq!(
            ConsoleCommand::parse("subscribe news").unwrap(),
            Some(ConsoleCommand::Subscribe("news".to_string()))
        );
        assert_eq!(ConsoleCommand::parse("status").unwrap(), Some(ConsoleCommand::Status));
        assert_eq!(ConsoleCommand::parse("peers").unwrap(), Some(ConsoleCommand::Peers));
        assert_eq!(ConsoleCommand::parse("exit").unwrap(), Some(ConsoleCommand::Quit));
        assert_eq!(ConsoleCommand::parse("   ").unwrap(), None);
        assert!(ConsoleCommand::parse("frobnicate").is_err());
    }
}
