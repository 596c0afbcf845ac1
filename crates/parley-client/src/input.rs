//! Interactive input parsing.

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Switch the current recipient.
    To(String),
    Register { username: String, password: String },
    Login { username: String, password: String },
    Quit,
    /// Anything else is sent as a message.
    Text(String),
    /// Blank line.
    Empty,
}

/// Parse a line. Errors carry a usage string for the user.
pub fn parse(line: &str) -> Result<Command, &'static str> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(Command::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Text(line.to_string()));
    };

    let mut parts = rest.split_whitespace();
    match parts.next() {
        Some("to") => match (parts.next(), parts.next()) {
            (Some(who), None) => Ok(Command::To(who.to_string())),
            _ => Err("usage: /to <recipient>"),
        },
        Some("register") => credentials(parts)
            .map(|(username, password)| Command::Register { username, password })
            .ok_or("usage: /register <username> <password>"),
        Some("login") => credentials(parts)
            .map(|(username, password)| Command::Login { username, password })
            .ok_or("usage: /login <username> <password>"),
        Some("quit" | "exit") => Ok(Command::Quit),
        _ => Err("commands: /to, /register, /login, /quit"),
    }
}

fn credentials<'a>(mut parts: impl Iterator<Item = &'a str>) -> Option<(String, String)> {
    match (parts.next(), parts.next(), parts.next()) {
        (Some(user), Some(pass), None) => Some((user.to_string(), pass.to_string())),
        _ => None,
    }
}
