//! Interactive commands read from stdin while a server or relay runs.

use std::path::PathBuf;
use tftpsim_faults::FaultSpec;

/// Server console commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCommand {
    /// Print the command list
    Help,
    /// Stop accepting requests and exit
    Shutdown,
    /// Serve a different directory
    ChangeDir(PathBuf),
}

/// Relay console commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayCommand {
    /// Print the command list
    Help,
    /// Stop accepting requests and exit
    Shutdown,
    /// Arm a fault for new sessions
    SetFault(FaultSpec),
    /// Run new sessions without faults
    Clear,
    /// Print the armed fault
    Show,
}

pub const SERVER_HELP: &str = "\
commands:
  help              show this list
  chgdir <dir>      serve files from <dir>
  shutdown          stop the server";

pub const RELAY_HELP: &str = "\
commands:
  help                          show this list
  drop <n>                      drop packet n
  delay <n> <ms>                delay packet n by ms milliseconds
  duplicate <n> <ms>            send packet n again after ms milliseconds
  change-opcode <n> <opcode>    rewrite the opcode of packet n
  wrong-sender <n>              also send packet n from a foreign port
  clear                         disarm the fault
  show                          print the armed fault
  shutdown                      stop the relay
packets are numbered from 1 across both directions of a session";

/// Parse one server console line. Blank lines yield `None`.
pub fn parse_server(line: &str) -> Option<Result<ServerCommand, String>> {
    let mut words = line.split_whitespace();
    let command = words.next()?.to_ascii_lowercase();
    let rest: Vec<&str> = words.collect();

    Some(match (command.as_str(), rest.as_slice()) {
        ("help" | "?", []) => Ok(ServerCommand::Help),
        ("shutdown" | "quit" | "exit", []) => Ok(ServerCommand::Shutdown),
        ("chgdir" | "cd", [_, ..]) => Ok(ServerCommand::ChangeDir(PathBuf::from(rest.join(" ")))),
        ("chgdir" | "cd", []) => Err("usage: chgdir <dir>".to_string()),
        _ => Err(format!("unknown command {line:?}, try 'help'")),
    })
}

/// Parse one relay console line. Blank lines yield `None`.
///
/// Fault commands take the same fields as `--fault`, separated by
/// spaces instead of colons.
pub fn parse_relay(line: &str) -> Option<Result<RelayCommand, String>> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let (command, args) = words.split_first()?;
    let command = command.to_ascii_lowercase();

    Some(match (command.as_str(), args) {
        ("help" | "?", []) => Ok(RelayCommand::Help),
        ("shutdown" | "quit" | "exit", []) => Ok(RelayCommand::Shutdown),
        ("clear" | "none", []) => Ok(RelayCommand::Clear),
        ("show", []) => Ok(RelayCommand::Show),
        ("drop" | "delay" | "duplicate" | "change-opcode" | "wrong-sender", _) => {
            let text = std::iter::once(command.as_str())
                .chain(args.iter().copied())
                .collect::<Vec<_>>()
                .join(":");
            text.parse::<FaultSpec>()
                .map(RelayCommand::SetFault)
                .map_err(|e| e.to_string())
        }
        _ => Err(format!("unknown command {line:?}, try 'help'")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tftpsim_faults::FaultKind;

    #[test]
    fn test_server_commands() {
        assert_eq!(parse_server("help"), Some(Ok(ServerCommand::Help)));
        assert_eq!(parse_server("  SHUTDOWN "), Some(Ok(ServerCommand::Shutdown)));
        assert_eq!(
            parse_server("chgdir /srv/tftp"),
            Some(Ok(ServerCommand::ChangeDir(PathBuf::from("/srv/tftp"))))
        );
        assert!(matches!(parse_server("chgdir"), Some(Err(_))));
        assert!(matches!(parse_server("reboot"), Some(Err(_))));
        assert_eq!(parse_server("   "), None);
    }

    #[test]
    fn test_relay_fault_commands() {
        let Some(Ok(RelayCommand::SetFault(spec))) = parse_relay("delay 3 250") else {
            panic!("delay should parse");
        };
        assert_eq!(spec.packet, 3);
        assert_eq!(spec.kind, FaultKind::Delay(Duration::from_millis(250)));

        assert_eq!(
            parse_relay("change-opcode 2 9"),
            Some(Ok(RelayCommand::SetFault(FaultSpec::change_opcode(2, 9).unwrap())))
        );
        assert!(matches!(
            parse_relay("wrong-sender 1"),
            Some(Ok(RelayCommand::SetFault(_)))
        ));
    }

    #[test]
    fn test_relay_rejects_bad_input() {
        assert!(matches!(parse_relay("drop"), Some(Err(_))));
        assert!(matches!(parse_relay("drop 0"), Some(Err(_))));
        assert!(matches!(parse_relay("delay 1"), Some(Err(_))));
        assert!(matches!(parse_relay("teleport 1"), Some(Err(_))));
        assert_eq!(parse_relay("clear"), Some(Ok(RelayCommand::Clear)));
        assert_eq!(parse_relay(""), None);
    }
}
