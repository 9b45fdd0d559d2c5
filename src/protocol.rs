//! Line grammar definitions
//!
//! Two separate grammars share the same shape: the remote client grammar
//! (`/enter`, `/leave`, `/exit`, bare message lines) and the operator
//! console grammar (`/shutdown <seconds>`, `/exit`). Both parse into closed
//! enums dispatched with exhaustive matching.

/// Reply sent for a successfully executed client command
pub const OK_MESSAGE: &str = "[OK]";

/// Format an error reply for the remote client
pub fn error_message(reason: &str) -> String {
    format!("[Error: {reason}]")
}

/// A parsed line from a remote client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientLine {
    /// A bare line, posted to the current room
    Message(String),
    /// `/enter <room>`
    Enter(String),
    /// `/leave`
    Leave,
    /// `/exit`
    Exit,
    /// Malformed or unknown command, with the reason to report back
    Invalid(&'static str),
}

/// A parsed line from the operator console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleLine {
    /// `/shutdown <seconds>` - graceful shutdown with a drain timeout
    Shutdown(u64),
    /// `/exit` - immediate stop
    Exit,
    Invalid(&'static str),
}

/// Parse a line received from a remote client
pub fn parse_client(line: &str) -> ClientLine {
    if !line.starts_with('/') {
        return ClientLine::Message(line.to_string());
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts[0] {
        "/enter" => {
            if parts.len() != 2 {
                ClientLine::Invalid("/enter command requires exactly one argument")
            } else {
                ClientLine::Enter(parts[1].to_string())
            }
        }
        "/leave" => {
            if parts.len() != 1 {
                ClientLine::Invalid("/leave command does not have arguments")
            } else {
                ClientLine::Leave
            }
        }
        "/exit" => {
            if parts.len() != 1 {
                ClientLine::Invalid("/exit command does not have arguments")
            } else {
                ClientLine::Exit
            }
        }
        _ => ClientLine::Invalid("Unknown command."),
    }
}

/// Parse a line typed on the operator console
pub fn parse_console(line: &str) -> ConsoleLine {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.first() {
        Some(&"/shutdown") => {
            if parts.len() != 2 {
                ConsoleLine::Invalid("/shutdown command requires exactly one argument")
            } else {
                match parts[1].parse() {
                    Ok(seconds) => ConsoleLine::Shutdown(seconds),
                    Err(_) => ConsoleLine::Invalid("/shutdown timeout must be a number of seconds"),
                }
            }
        }
        Some(&"/exit") => {
            if parts.len() != 1 {
                ConsoleLine::Invalid("/exit command does not have arguments")
            } else {
                ConsoleLine::Exit
            }
        }
        _ => ConsoleLine::Invalid("Unknown command."),
    }
}
