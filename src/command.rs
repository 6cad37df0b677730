//! Text commands for driving the player from a terminal.
//!
//! One command per line:
//!
//! | command           | action                                  |
//! | ----------------- | --------------------------------------- |
//! | `play [N]`        | play track N, or the current track      |
//! | `pause`           | pause                                   |
//! | `toggle`          | play or pause                           |
//! | `select N`        | make track N current without playing    |
//! | `click N`         | click playlist row N                    |
//! | `seek P`          | seek to P percent                       |
//! | `vol V`           | set volume, `0.0..=1.0`                 |
//! | `loop MODE`       | `none`, `one` or `all`                  |
//! | `next`, `prev`    | skip tracks                             |
//! | `prefetch N`      | download track N ahead of time          |
//! | `cancel N`        | cancel the download of track N          |
//! | `retry`           | retry a failed track                    |
//! | `status`, `list`  | print the player state or the playlist  |
//! | `quit`            | exit                                    |
//!
//! Track numbers are zero-based, like the playlist indices.

use std::{fmt, str::FromStr};

use crate::{
    error::{Error, Result},
    state::LoopMode,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    Play(Option<usize>),
    Pause,
    Toggle,
    Select(usize),
    Click(usize),
    Seek(f64),
    Volume(f32),
    Loop(LoopMode),
    Next,
    Previous,
    Prefetch(usize),
    Cancel(usize),
    Retry,
    Status,
    List,
    Quit,
}

fn argument<'a>(command: &str, argument: Option<&'a str>) -> Result<&'a str> {
    argument.ok_or_else(|| Error::invalid_argument(format!("{command} needs an argument")))
}

fn index(command: &str, argument: Option<&str>) -> Result<usize> {
    let value = self::argument(command, argument)?;
    value
        .parse()
        .map_err(|_| Error::invalid_argument(format!("{value} is not a track number")))
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut words = s.split_whitespace();
        let Some(command) = words.next() else {
            return Err(Error::invalid_argument("empty command"));
        };
        let command = command.to_ascii_lowercase();
        let arg = words.next();
        if let Some(extra) = words.next() {
            return Err(Error::invalid_argument(format!(
                "unexpected argument {extra}"
            )));
        }

        let parsed = match command.as_str() {
            "play" | "p" => Self::Play(arg.map(|_| index(&command, arg)).transpose()?),
            "pause" => Self::Pause,
            "toggle" | "t" => Self::Toggle,
            "select" | "s" => Self::Select(index(&command, arg)?),
            "click" | "c" => Self::Click(index(&command, arg)?),
            "seek" => {
                let value = argument(&command, arg)?;
                Self::Seek(value.trim_end_matches('%').parse().map_err(|_| {
                    Error::invalid_argument(format!("{value} is not a percentage"))
                })?)
            }
            "vol" | "volume" => {
                let value = argument(&command, arg)?;
                Self::Volume(
                    value
                        .parse()
                        .map_err(|_| Error::invalid_argument(format!("{value} is not a volume")))?,
                )
            }
            "loop" => Self::Loop(argument(&command, arg)?.parse()?),
            "next" | "n" => Self::Next,
            "prev" | "previous" => Self::Previous,
            "prefetch" => Self::Prefetch(index(&command, arg)?),
            "cancel" => Self::Cancel(index(&command, arg)?),
            "retry" => Self::Retry,
            "status" => Self::Status,
            "list" | "ls" => Self::List,
            "quit" | "exit" | "q" => Self::Quit,
            _ => return Err(Error::invalid_argument(format!("unknown command {command}"))),
        };

        let takes_argument = matches!(
            parsed,
            Self::Play(_)
                | Self::Select(_)
                | Self::Click(_)
                | Self::Seek(_)
                | Self::Volume(_)
                | Self::Loop(_)
                | Self::Prefetch(_)
                | Self::Cancel(_)
        );
        if !takes_argument {
            if let Some(arg) = arg {
                return Err(Error::invalid_argument(format!(
                    "{command} takes no argument, got {arg}"
                )));
            }
        }

        Ok(parsed)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Play(Some(index)) => write!(f, "play {index}"),
            Self::Play(None) => write!(f, "play"),
            Self::Pause => write!(f, "pause"),
            Self::Toggle => write!(f, "toggle"),
            Self::Select(index) => write!(f, "select {index}"),
            Self::Click(index) => write!(f, "click {index}"),
            Self::Seek(percent) => write!(f, "seek {percent}"),
            Self::Volume(volume) => write!(f, "vol {volume}"),
            Self::Loop(mode) => write!(f, "loop {mode}"),
            Self::Next => write!(f, "next"),
            Self::Previous => write!(f, "prev"),
            Self::Prefetch(index) => write!(f, "prefetch {index}"),
            Self::Cancel(index) => write!(f, "cancel {index}"),
            Self::Retry => write!(f, "retry"),
            Self::Status => write!(f, "status"),
            Self::List => write!(f, "list"),
            Self::Quit => write!(f, "quit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!("play".parse::<Command>().unwrap(), Command::Play(None));
        assert_eq!("play 2".parse::<Command>().unwrap(), Command::Play(Some(2)));
        assert_eq!("  SELECT  1 ".parse::<Command>().unwrap(), Command::Select(1));
        assert_eq!("seek 42.5%".parse::<Command>().unwrap(), Command::Seek(42.5));
        assert_eq!("vol 0.3".parse::<Command>().unwrap(), Command::Volume(0.3));
        assert_eq!(
            "loop all".parse::<Command>().unwrap(),
            Command::Loop(LoopMode::All)
        );
        assert_eq!("q".parse::<Command>().unwrap(), Command::Quit);
    }

    #[test]
    fn rejects_malformed_input() {
        for input in ["", "dance", "select", "select x", "pause 3", "play 1 2", "loop twice"] {
            let err = input.parse::<Command>().unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgument, "{input}");
        }
    }

    #[test]
    fn display_parses_back() {
        for command in [Command::Play(Some(4)), Command::Loop(LoopMode::One), Command::Previous] {
            assert_eq!(command.to_string().parse::<Command>().unwrap(), command);
        }
    }
}
