/// Classification of a `run` command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionCommand<'a> {
    Empty,
    Pwd,
    Clear,
    /// `cd` with its optional target.
    ChangeDirectory(Option<&'a str>),
    Spawn(&'a str),
}

impl<'a> SessionCommand<'a> {
    pub fn parse(raw: &'a str) -> Self {
        let command = raw.trim();
        if command.is_empty() {
            return SessionCommand::Empty;
        }
        match command {
            "pwd" => return SessionCommand::Pwd,
            "clear" => return SessionCommand::Clear,
            _ => {}
        }

        let (head, rest) = match command.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (command, ""),
        };
        if head == "cd" {
            let target = if rest.is_empty() { None } else { Some(rest) };
            return SessionCommand::ChangeDirectory(target);
        }
        SessionCommand::Spawn(command)
    }
}
