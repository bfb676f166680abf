//! Ganesha-style configuration file parser
//!
//! Configuration is a tree of named blocks holding `key = value;`
//! parameters:
//!
//! ```text
//! PROXY_V4 {
//!     Remote_Server {
//!         Srv_Addr = 10.0.0.5;      # backend
//!         NFS_SendSize = 64K;
//!     }
//! }
//! ```
//!
//! Block names and keys are case-insensitive. Values are bare words or
//! quoted strings; comma separated lists are kept as one value.
//!
//! # Example
//!
//! ```
//! use proxyconfig::BlockConfig;
//!
//! let config = BlockConfig::parse("PROXY_V4 { Remote_Server { NFS_Port = 2050; } }").unwrap();
//! let server = config.find(&["proxy_v4", "remote_server"]).unwrap();
//! assert_eq!(server.get("nfs_port"), Some("2050"));
//! ```

use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config file: line {line}: {msg}")]
    ParseError { line: usize, msg: String },

    #[error("Invalid {kind} value for {key}: {value}")]
    InvalidValue {
        key: String,
        kind: &'static str,
        value: String,
    },

    #[error("Missing required option: {0}")]
    MissingOption(String),
}

impl ConfigError {
    fn parse(line: usize, msg: impl Into<String>) -> Self {
        Self::ParseError {
            line,
            msg: msg.into(),
        }
    }
}

/// Types that can be parsed from a parameter value
pub trait ConfigValue: Sized + Clone {
    /// Parse from the raw value text, `None` if it is not valid
    fn parse_config_value(s: &str) -> Option<Self>;

    /// Type name for error messages
    fn type_name() -> &'static str;
}

/// Size in bytes; accepts K, M, G suffixes (powers of 1024)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Size(pub u64);

impl ConfigValue for Size {
    fn parse_config_value(s: &str) -> Option<Self> {
        parse_size(s).map(Size)
    }

    fn type_name() -> &'static str {
        "size"
    }
}

/// Duration; a bare number is seconds, `ms`, `s`, `m`, `h` suffixes accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Duration(pub std::time::Duration);

impl ConfigValue for Duration {
    fn parse_config_value(s: &str) -> Option<Self> {
        parse_duration(s).map(Duration)
    }

    fn type_name() -> &'static str {
        "duration"
    }
}

/// Plain unsigned integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Count(pub u64);

impl ConfigValue for Count {
    fn parse_config_value(s: &str) -> Option<Self> {
        let s = s.trim();
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).ok().map(Count),
            None => s.parse().ok().map(Count),
        }
    }

    fn type_name() -> &'static str {
        "count"
    }
}

impl ConfigValue for bool {
    fn parse_config_value(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Some(true),
            "false" | "no" | "0" | "off" => Some(false),
            _ => None,
        }
    }

    fn type_name() -> &'static str {
        "bool"
    }
}

impl ConfigValue for String {
    fn parse_config_value(s: &str) -> Option<Self> {
        Some(s.to_string())
    }

    fn type_name() -> &'static str {
        "string"
    }
}

/// A named, typed parameter with its default
pub struct ConfigOption<T: ConfigValue> {
    name: &'static str,
    default: T,
}

impl<T: ConfigValue> ConfigOption<T> {
    pub const fn new(name: &'static str, default: T) -> Self {
        Self { name, default }
    }

    /// Value from `block`, the default when absent, an error when malformed
    pub fn get(&self, block: &Block) -> Result<T, ConfigError> {
        match block.get(self.name) {
            None => Ok(self.default.clone()),
            Some(raw) => T::parse_config_value(raw).ok_or_else(|| ConfigError::InvalidValue {
                key: self.name.to_string(),
                kind: T::type_name(),
                value: raw.to_string(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }
}

fn split_number(s: &str) -> (&str, String) {
    let end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    (&s[..end], s[end..].trim().to_lowercase())
}

fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let (num, unit) = split_number(s);
    let num: f64 = num.parse().ok()?;
    let multiplier: u64 = match unit.as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        _ => return None,
    };
    Some((num * multiplier as f64) as u64)
}

fn parse_duration(s: &str) -> Option<std::time::Duration> {
    let s = s.trim();
    let (num, unit) = split_number(s);
    let num: f64 = num.parse().ok()?;
    let seconds = match unit.as_str() {
        "" | "s" | "sec" | "seconds" => num,
        "ms" | "msec" => num / 1000.0,
        "m" | "min" | "minutes" => num * 60.0,
        "h" | "hours" => num * 3600.0,
        _ => return None,
    };
    std::time::Duration::try_from_secs_f64(seconds).ok()
}

/// One `Name { ... }` block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Block {
    pub name: String,
    params: HashMap<String, String>,
    blocks: Vec<Block>,
}

impl Block {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Parameter value by case-insensitive key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(&key.to_lowercase()).map(String::as_str)
    }

    /// First direct sub-block with this name
    pub fn block(&self, name: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.name.eq_ignore_ascii_case(name))
    }

    /// All direct sub-blocks with this name
    pub fn blocks_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Block> + 'a {
        self.blocks
            .iter()
            .filter(move |b| b.name.eq_ignore_ascii_case(name))
    }

    pub fn keys(&self) -> Vec<&str> {
        self.params.keys().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Open,
    Close,
    Assign,
    Semi,
    Comma,
}

fn tokenize(content: &str) -> Result<Vec<(usize, Token)>, ConfigError> {
    let mut tokens = Vec::new();
    let mut chars = content.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while chars.peek().is_some_and(|c| *c != '\n') {
                    chars.next();
                }
            }
            '{' | '}' | '=' | ';' | ',' => {
                chars.next();
                let tok = match c {
                    '{' => Token::Open,
                    '}' => Token::Close,
                    '=' => Token::Assign,
                    ';' => Token::Semi,
                    _ => Token::Comma,
                };
                tokens.push((line, tok));
            }
            '"' | '\'' => {
                let start = line;
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some(q) if q == c => break,
                        Some('\n') => {
                            line += 1;
                            value.push('\n');
                        }
                        Some(other) => value.push(other),
                        None => return Err(ConfigError::parse(start, "unterminated string")),
                    }
                }
                tokens.push((start, Token::Quoted(value)));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || "{}=;,#\"'".contains(c) {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push((line, Token::Word(word)));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |(l, _)| *l)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        tok
    }

    /// Parse statements until `}` (nested) or end of input (top level)
    fn parse_body(&mut self, block: &mut Block, nested: bool) -> Result<(), ConfigError> {
        loop {
            let line = self.line();
            let name = match self.next() {
                None if nested => return Err(ConfigError::parse(line, "missing '}'")),
                None => return Ok(()),
                Some(Token::Close) if nested => return Ok(()),
                Some(Token::Semi) => continue,
                Some(Token::Word(w)) => w,
                Some(other) => {
                    return Err(ConfigError::parse(
                        line,
                        format!("expected a name, found {:?}", other),
                    ))
                }
            };
            match self.next() {
                Some(Token::Open) => {
                    let mut child = Block::new(&name);
                    self.parse_body(&mut child, true)?;
                    block.blocks.push(child);
                }
                Some(Token::Assign) => {
                    let value = self.parse_value(line)?;
                    block.params.insert(name.to_lowercase(), value);
                }
                _ => {
                    return Err(ConfigError::parse(
                        line,
                        format!("expected '=' or '{{' after {}", name),
                    ))
                }
            }
        }
    }

    /// Value tokens up to `;`; a closing brace also ends the statement
    fn parse_value(&mut self, line: usize) -> Result<String, ConfigError> {
        let mut parts: Vec<String> = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Semi) => {
                    self.pos += 1;
                    break;
                }
                Some(Token::Close) | None => break,
                Some(Token::Comma) => {
                    self.pos += 1;
                }
                Some(Token::Word(_)) | Some(Token::Quoted(_)) => {
                    if let Some(Token::Word(w) | Token::Quoted(w)) = self.next() {
                        parts.push(w);
                    }
                }
                Some(other) => {
                    return Err(ConfigError::parse(
                        line,
                        format!("unexpected {:?} in value", other),
                    ))
                }
            }
        }
        if parts.is_empty() {
            return Err(ConfigError::parse(line, "empty value"));
        }
        Ok(parts.join(", "))
    }
}

/// A parsed configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BlockConfig {
    root: Block,
}

impl BlockConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut parser = Parser {
            tokens: tokenize(content)?,
            pos: 0,
        };
        let mut root = Block::new("");
        parser.parse_body(&mut root, false)?;
        Ok(Self { root })
    }

    /// Walk a path of block names from the top level
    pub fn find(&self, path: &[&str]) -> Option<&Block> {
        path.iter()
            .try_fold(&self.root, |block, name| block.block(name))
    }

    /// First block with this name anywhere in the tree, depth first
    pub fn find_anywhere(&self, name: &str) -> Option<&Block> {
        fn walk<'a>(block: &'a Block, name: &str) -> Option<&'a Block> {
            block
                .blocks
                .iter()
                .find_map(|b| {
                    if b.name.eq_ignore_ascii_case(name) {
                        Some(b)
                    } else {
                        walk(b, name)
                    }
                })
        }
        walk(&self.root, name)
    }

    pub fn root(&self) -> &Block {
        &self.root
    }
}

/// Define a struct of typed options loaded from one block
///
/// ```
/// use proxyconfig::{define_options, BlockConfig, Count, Size};
///
/// define_options! {
///     pub struct ServerOptions {
///         nfs_port: Count = Count(2049),
///         nfs_sendsize: Size = Size(32768),
///     }
/// }
///
/// let config = BlockConfig::parse("Server { NFS_SendSize = 1M; }").unwrap();
/// let opts = ServerOptions::from_block(config.find(&["server"]).unwrap()).unwrap();
/// assert_eq!(opts.nfs_port.0, 2049);
/// assert_eq!(opts.nfs_sendsize.0, 1 << 20);
/// ```
#[macro_export]
macro_rules! define_options {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field:ident: $ty:ty = $default:expr
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            $(
                $(#[$field_meta])*
                pub $field: $ty,
            )*
        }

        impl $name {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: $default,
                    )*
                }
            }

            /// Load from a block; keys match field names case-insensitively
            pub fn from_block(
                block: &$crate::Block,
            ) -> ::core::result::Result<Self, $crate::ConfigError> {
                ::core::result::Result::Ok(Self {
                    $(
                        $field: $crate::ConfigOption::new(stringify!($field), $default)
                            .get(block)?,
                    )*
                })
            }

            pub fn option_names() -> &'static [&'static str] {
                &[
                    $(stringify!($field),)*
                ]
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}
