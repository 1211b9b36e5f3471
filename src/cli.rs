use galleria_core::{ContentHash, RotateDirection, ThreadingMode};
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub const USAGE: &str = "usage:
  galleria ingest     [--config=PATH] [--no-thread]
  galleria query      [--config=PATH] [--filter=STRING] [--output=FILE]
  galleria tags       [--config=PATH] [--hash=HASH]
  galleria tag        [--config=PATH] --tag=T[,T..] HASH...
  galleria untag      [--config=PATH] --tag=T[,T..]
  galleria rename-tag [--config=PATH] OLD NEW
  galleria rotate     [--config=PATH] HASH (cw|ccw)
  galleria thumbnail  [--config=PATH] HASH [--size=N]";

#[derive(Debug, PartialEq, Eq)]
pub struct Invocation {
    pub config: Option<PathBuf>,
    pub command: Command,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Ingest {
        threading: ThreadingMode,
    },
    Query {
        filter: String,
        output: Option<PathBuf>,
    },
    Tags {
        hash: Option<ContentHash>,
    },
    Tag {
        tags: Vec<String>,
        hashes: Vec<ContentHash>,
    },
    Untag {
        tags: Vec<String>,
    },
    RenameTag {
        old: String,
        new: String,
    },
    Rotate {
        hash: ContentHash,
        direction: RotateDirection,
    },
    Thumbnail {
        hash: ContentHash,
        size: Option<u32>,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum CliError {
    Help,
    MissingCommand,
    UnknownCommand(String),
    MissingArgument(&'static str),
    InvalidFlag(String),
    InvalidValue { flag: &'static str, value: String },
    InvalidHash(String),
    UnexpectedArgument(String),
}

impl Invocation {
    pub fn from_env() -> Result<Self, CliError> {
        Self::from_iter(env::args().skip(1))
    }

    pub fn from_iter<I>(args: I) -> Result<Self, CliError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let name = match args.next() {
            Some(name) if name == "--help" || name == "-h" || name == "help" => {
                return Err(CliError::Help)
            }
            Some(name) => name,
            None => return Err(CliError::MissingCommand),
        };

        let mut config = None;
        let mut flags = Vec::new();
        let mut positionals = Vec::new();
        for arg in args {
            if arg == "--help" || arg == "-h" {
                return Err(CliError::Help);
            }
            if let Some(value) = arg.strip_prefix("--config=") {
                config = Some(PathBuf::from(value));
            } else if arg.starts_with("--") {
                flags.push(arg);
            } else {
                positionals.push(arg);
            }
        }

        let command = match name.as_str() {
            "ingest" => parse_ingest(&flags, &positionals)?,
            "query" => parse_query(&flags, &positionals)?,
            "tags" => parse_tags(&flags, &positionals)?,
            "tag" => parse_tag(&flags, &positionals)?,
            "untag" => parse_untag(&flags, &positionals)?,
            "rename-tag" => parse_rename(&flags, &positionals)?,
            "rotate" => parse_rotate(&flags, &positionals)?,
            "thumbnail" => parse_thumbnail(&flags, &positionals)?,
            _ => return Err(CliError::UnknownCommand(name)),
        };
        Ok(Self { config, command })
    }
}

fn parse_ingest(flags: &[String], positionals: &[String]) -> Result<Command, CliError> {
    no_positionals(positionals)?;
    let mut threading = ThreadingMode::Parallel;
    for flag in flags {
        if flag == "--no-thread" {
            threading = ThreadingMode::Sequential;
            continue;
        }
        return Err(CliError::InvalidFlag(flag.clone()));
    }
    Ok(Command::Ingest { threading })
}

fn parse_query(flags: &[String], positionals: &[String]) -> Result<Command, CliError> {
    no_positionals(positionals)?;
    let mut filter = String::new();
    let mut output = None;
    for flag in flags {
        if let Some(value) = flag.strip_prefix("--filter=") {
            filter = value.to_string();
            continue;
        }
        if let Some(value) = flag.strip_prefix("--output=") {
            output = Some(PathBuf::from(value));
            continue;
        }
        return Err(CliError::InvalidFlag(flag.clone()));
    }
    Ok(Command::Query { filter, output })
}

fn parse_tags(flags: &[String], positionals: &[String]) -> Result<Command, CliError> {
    no_positionals(positionals)?;
    let mut hash = None;
    for flag in flags {
        if let Some(value) = flag.strip_prefix("--hash=") {
            hash = Some(parse_hash(value)?);
            continue;
        }
        return Err(CliError::InvalidFlag(flag.clone()));
    }
    Ok(Command::Tags { hash })
}

fn parse_tag(flags: &[String], positionals: &[String]) -> Result<Command, CliError> {
    let tags = tag_list(flags)?;
    if positionals.is_empty() {
        return Err(CliError::MissingArgument("HASH"));
    }
    let hashes = positionals
        .iter()
        .map(|value| parse_hash(value))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Command::Tag { tags, hashes })
}

fn parse_untag(flags: &[String], positionals: &[String]) -> Result<Command, CliError> {
    no_positionals(positionals)?;
    Ok(Command::Untag {
        tags: tag_list(flags)?,
    })
}

fn parse_rename(flags: &[String], positionals: &[String]) -> Result<Command, CliError> {
    no_flags(flags)?;
    match positionals {
        [old, new] => Ok(Command::RenameTag {
            old: old.clone(),
            new: new.clone(),
        }),
        [] => Err(CliError::MissingArgument("OLD")),
        [_] => Err(CliError::MissingArgument("NEW")),
        [_, _, extra, ..] => Err(CliError::UnexpectedArgument(extra.clone())),
    }
}

fn parse_rotate(flags: &[String], positionals: &[String]) -> Result<Command, CliError> {
    no_flags(flags)?;
    let (hash, direction) = match positionals {
        [hash, direction] => (hash, direction),
        [] => return Err(CliError::MissingArgument("HASH")),
        [_] => return Err(CliError::MissingArgument("cw|ccw")),
        [_, _, extra, ..] => return Err(CliError::UnexpectedArgument(extra.clone())),
    };
    let direction = match direction.as_str() {
        "cw" | "right" => RotateDirection::Clockwise,
        "ccw" | "left" => RotateDirection::CounterClockwise,
        other => {
            return Err(CliError::InvalidValue {
                flag: "direction",
                value: other.to_string(),
            })
        }
    };
    Ok(Command::Rotate {
        hash: parse_hash(hash)?,
        direction,
    })
}

fn parse_thumbnail(flags: &[String], positionals: &[String]) -> Result<Command, CliError> {
    let mut size = None;
    for flag in flags {
        if let Some(value) = flag.strip_prefix("--size=") {
            size = Some(value.parse::<u32>().map_err(|_| CliError::InvalidValue {
                flag: "--size",
                value: value.to_string(),
            })?);
            continue;
        }
        return Err(CliError::InvalidFlag(flag.clone()));
    }
    match positionals {
        [hash] => Ok(Command::Thumbnail {
            hash: parse_hash(hash)?,
            size,
        }),
        [] => Err(CliError::MissingArgument("HASH")),
        [_, extra, ..] => Err(CliError::UnexpectedArgument(extra.clone())),
    }
}

fn tag_list(flags: &[String]) -> Result<Vec<String>, CliError> {
    let mut tags = Vec::new();
    for flag in flags {
        if let Some(value) = flag.strip_prefix("--tag=") {
            tags.extend(
                value
                    .split(',')
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string),
            );
            continue;
        }
        return Err(CliError::InvalidFlag(flag.clone()));
    }
    if tags.is_empty() {
        return Err(CliError::MissingArgument("--tag"));
    }
    Ok(tags)
}

fn parse_hash(value: &str) -> Result<ContentHash, CliError> {
    ContentHash::parse(value).map_err(|_| CliError::InvalidHash(value.to_string()))
}

fn no_flags(flags: &[String]) -> Result<(), CliError> {
    match flags.first() {
        Some(flag) => Err(CliError::InvalidFlag(flag.clone())),
        None => Ok(()),
    }
}

fn no_positionals(positionals: &[String]) -> Result<(), CliError> {
    match positionals.first() {
        Some(arg) => Err(CliError::UnexpectedArgument(arg.clone())),
        None => Ok(()),
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Help => write!(f, "{}", USAGE),
            Self::MissingCommand => write!(f, "a command is required\n{}", USAGE),
            Self::UnknownCommand(name) => write!(f, "unknown command: {}\n{}", name, USAGE),
            Self::MissingArgument(name) => write!(f, "missing argument: {}", name),
            Self::InvalidFlag(flag) => write!(f, "unrecognized argument: {}", flag),
            Self::InvalidValue { flag, value } => {
                write!(f, "invalid value for {}: {}", flag, value)
            }
            Self::InvalidHash(value) => write!(f, "not a content hash: {}", value),
            Self::UnexpectedArgument(arg) => write!(f, "unexpected argument: {}", arg),
        }
    }
}

impl Error for CliError {}
