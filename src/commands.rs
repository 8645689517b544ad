//! Prefix command parsing.

/// A message split into a lowercased command name and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub name: String,
    pub args: Vec<String>,
}

/// Returns `None` unless `content` starts with `prefix` and names something.
pub fn parse(content: &str, prefix: &str) -> Option<Invocation> {
    let rest = content.strip_prefix(prefix)?;
    let mut words = rest.split_whitespace();
    let name = words.next()?.to_lowercase();
    let args = words.map(str::to_string).collect();

    Some(Invocation { name, args })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Play(Option<String>),
    Skip,
    Stop,
    Pause,
    Resume,
    Queue,
    Help,
}

impl Command {
    /// Unknown names yield `None` and are ignored by the bot.
    pub fn from_invocation(invocation: Invocation) -> Option<Command> {
        let command = match invocation.name.as_str() {
            "play" => Command::Play(invocation.args.into_iter().next()),
            "skip" => Command::Skip,
            "stop" => Command::Stop,
            "pause" => Command::Pause,
            "resume" => Command::Resume,
            "queue" => Command::Queue,
            "help" => Command::Help,
            _ => return None,
        };

        Some(command)
    }
}
