//! Parsing of the lines typed into the chat prompt.

use shared::domain::{MessageId, RoomId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Reply { parent: MessageId, text: String },
    Read(Option<MessageId>),
    Thread(MessageId),
    Expand(MessageId),
    Older,
    Rooms,
    Join(RoomId),
    Dm(UserId),
    Group { name: String, members: Vec<UserId> },
    React { message: MessageId, emoji: String },
    Unreact { message: MessageId, emoji: String },
    Unread,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  <text>                      send to the current room
  /reply <message_id> <text>  reply in a thread
  /read [message_id]          mark the room read (latest message by default)
  /thread <message_id>        open a thread
  /expand <message_id>        expand or collapse a thread
  /older                      load older messages
  /rooms                      list your rooms
  /join <room_id>             switch room
  /dm <user_id>               open a direct message
  /group <name> <user_id>...  create a group
  /react <message_id> <emoji> add a reaction
  /unreact <message_id> <emoji>
  /unread                     show unread counts
  /quit";

/// Parses one prompt line. `Ok(None)` means there is nothing to do.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };

    let (name, args) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(name, args)| (name, args.trim()));
    let command = match name {
        "reply" => {
            let (id, text) = split_first(args).ok_or("usage: /reply <message_id> <text>")?;
            if text.is_empty() {
                return Err("usage: /reply <message_id> <text>".into());
            }
            Command::Reply {
                parent: MessageId(parse_id(id)?),
                text: text.to_string(),
            }
        }
        "read" if args.is_empty() => Command::Read(None),
        "read" => Command::Read(Some(MessageId(parse_id(args)?))),
        "thread" => Command::Thread(MessageId(parse_id(args)?)),
        "expand" => Command::Expand(MessageId(parse_id(args)?)),
        "older" => Command::Older,
        "rooms" => Command::Rooms,
        "join" => Command::Join(RoomId(parse_id(args)?)),
        "dm" => Command::Dm(UserId(parse_id(args)?)),
        "group" => {
            let mut words = args.split_whitespace();
            let name = words.next().ok_or("usage: /group <name> <user_id>...")?;
            let members = words
                .map(|word| parse_id(word).map(UserId))
                .collect::<Result<Vec<_>, _>>()?;
            Command::Group {
                name: name.to_string(),
                members,
            }
        }
        "react" | "unreact" => {
            let (id, emoji) = split_first(args).ok_or("usage: /react <message_id> <emoji>")?;
            if emoji.is_empty() {
                return Err("usage: /react <message_id> <emoji>".into());
            }
            let message = MessageId(parse_id(id)?);
            let emoji = emoji.to_string();
            if name == "react" {
                Command::React { message, emoji }
            } else {
                Command::Unreact { message, emoji }
            }
        }
        "unread" => Command::Unread,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command /{other}; try /help")),
    };
    Ok(Some(command))
}

fn split_first(args: &str) -> Option<(&str, &str)> {
    if args.is_empty() {
        return None;
    }
    Some(
        args.split_once(char::is_whitespace)
            .map_or((args, ""), |(first, rest)| (first, rest.trim())),
    )
}

fn parse_id(raw: &str) -> Result<i64, String> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| format!("'{raw}' is not a numeric id"))
}

#[cfg(test)]
#[path = "tests/commands_tests.rs"]
mod tests;
