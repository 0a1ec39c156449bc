//! Lexer and parser for the node console.
//!
//! The lexer uses `regal` to produce a bounded token stream; the parser walks
//! those tokens against the [`catalog`](super::catalog) to build [`Command`]
//! values. `set` values are taken from the raw line so that passwords and SSIDs
//! keep whatever characters they contain.

use core::fmt;
use core::ops::Range;

use heapless::Vec as HeaplessVec;
use regal::IncrementalError;
use regal::TokenCache;
use regal_macros::RegalLexer;

use super::catalog::{self, ArgumentSpec, CLEAR_TARGET_KEYWORDS, CommandTag, RESET_KEYWORDS};
use crate::config::SettingKey;
use crate::version::FirmwareVersion;

/// Maximum number of tokens produced per console line.
pub const MAX_TOKENS: usize = 16;
const MAX_CACHE_RECORDS: usize = MAX_TOKENS * 2;

/// Lexical token kinds recognized by the console grammar.
#[derive(RegalLexer, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TokenKind {
    /// Dotted `major.minor.patch` version with optional `v` prefix.
    #[regex(r"[vV]?[0-9]+\.[0-9]+\.[0-9]+", priority = 2)]
    Version,
    #[regex(r"[0-9]+")]
    Integer,
    /// Identifier or keyword (case-insensitive match performed later).
    #[regex(r"[A-Za-z][A-Za-z0-9_-]*")]
    Ident,
    #[regex(r"[ \t]+", skip)]
    Whitespace,
    #[token("\r\n")]
    #[token("\n")]
    #[token("\r")]
    Eol,
    /// Pseudo variant used when the lexer encounters unsupported input.
    #[default]
    #[regex(r".", priority = 1024)]
    Error,
}

/// Token emitted by the lexer with a byte span back into the source line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub lexeme: &'a str,
    pub span: Range<usize>,
}

pub type TokenBuffer<'a> = HeaplessVec<Token<'a>, MAX_TOKENS>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LexError {
    /// Input produced more tokens than the static buffer allows.
    TooManyTokens { processed: usize },
    Engine,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexError::TooManyTokens { processed } => {
                write!(f, "token buffer exhausted after {processed} items")
            }
            LexError::Engine => write!(f, "lexer engine error"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrammarErrorKind<'a> {
    UnexpectedToken {
        expected: &'static str,
        found: TokenKind,
        lexeme: &'a str,
        span: Range<usize>,
    },
    UnexpectedEnd {
        expected: &'static str,
    },
    UnknownCommand {
        lexeme: &'a str,
    },
    UnknownSetting {
        lexeme: &'a str,
    },
    InvalidVersion {
        lexeme: &'a str,
    },
    InvalidToken {
        span: Range<usize>,
        lexeme: &'a str,
    },
}

impl fmt::Display for GrammarErrorKind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrammarErrorKind::UnexpectedToken {
                expected, lexeme, ..
            } => write!(f, "expected {expected}, found `{lexeme}`"),
            GrammarErrorKind::UnexpectedEnd { expected } => {
                write!(f, "unexpected end of input, expected {expected}")
            }
            GrammarErrorKind::UnknownCommand { lexeme } => {
                write!(f, "unknown command `{lexeme}` (try `help`)")
            }
            GrammarErrorKind::UnknownSetting { lexeme } => {
                write!(f, "unknown setting `{lexeme}` (try `help set`)")
            }
            GrammarErrorKind::InvalidVersion { lexeme } => {
                write!(f, "`{lexeme}` is not a major.minor.patch version")
            }
            GrammarErrorKind::InvalidToken { span, lexeme } => {
                write!(f, "unsupported token `{lexeme}` at {span:?}")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrammarError<'a> {
    pub kind: GrammarErrorKind<'a>,
}

impl fmt::Display for GrammarError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl<'a> GrammarError<'a> {
    fn unexpected(expected: &'static str, token: Option<&Token<'a>>) -> Self {
        GrammarError {
            kind: match token {
                Some(tok) => GrammarErrorKind::UnexpectedToken {
                    expected,
                    found: tok.kind,
                    lexeme: tok.lexeme,
                    span: tok.span.clone(),
                },
                None => GrammarErrorKind::UnexpectedEnd { expected },
            },
        }
    }

    fn invalid_token(token: &Token<'a>) -> Self {
        GrammarError {
            kind: GrammarErrorKind::InvalidToken {
                span: token.span.clone(),
                lexeme: token.lexeme,
            },
        }
    }
}

/// Combined lex/parse error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseError<'a> {
    Lex(LexError),
    Grammar(GrammarError<'a>),
}

impl fmt::Display for ParseError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Lex(err) => err.fmt(f),
            ParseError::Grammar(err) => err.fmt(f),
        }
    }
}

impl<'a> From<GrammarError<'a>> for ParseError<'a> {
    fn from(error: GrammarError<'a>) -> Self {
        ParseError::Grammar(error)
    }
}

/// Target given to `otaver`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OtaTarget {
    Set(FirmwareVersion),
    Clear,
}

/// Structured commands produced by the parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Show,
    Set { key: SettingKey, value: &'a str },
    Save,
    Reset,
    NoSleep,
    Sleep,
    Reboot,
    /// `None` shows the current target.
    OtaVersion(Option<OtaTarget>),
    Status,
    Help { topic: Option<&'a str> },
}

type Input<'src, 'slice> = &'slice [Token<'src>];

/// Tokenize the provided line.
pub fn lex(line: &str) -> Result<TokenBuffer<'_>, LexError> {
    let compiled = TokenKind::lexer();
    let mut cache: TokenCache<TokenKind, MAX_CACHE_RECORDS> = TokenCache::new();
    let partial = cache
        .rebuild(compiled, line)
        .map_err(map_incremental_error)?;
    let mut buffer = TokenBuffer::new();

    for record in cache.tokens() {
        if record.skipped {
            continue;
        }

        let span = record.start..record.end;
        let lexeme = &line[span.clone()];
        if buffer
            .push(Token {
                kind: record.token,
                lexeme,
                span,
            })
            .is_err()
        {
            return Err(LexError::TooManyTokens {
                processed: buffer.len() + 1,
            });
        }
    }

    if let Some(partial) = partial.filter(|partial| !partial.fragment.is_empty()) {
        let start = partial.start;
        let end = start + partial.fragment.len();
        if buffer
            .push(Token {
                kind: TokenKind::Error,
                lexeme: partial.fragment,
                span: start..end,
            })
            .is_err()
        {
            return Err(LexError::TooManyTokens {
                processed: buffer.len() + 1,
            });
        }
    }

    Ok(buffer)
}

fn map_incremental_error(error: IncrementalError) -> LexError {
    match error {
        IncrementalError::TokenOverflow => LexError::TooManyTokens {
            processed: MAX_TOKENS,
        },
        _ => LexError::Engine,
    }
}

/// Parse a console command from the provided line.
pub fn parse(line: &str) -> Result<Command<'_>, ParseError<'_>> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (head, raw_value) = split_raw_value(line);
    let tokens = lex(head).map_err(ParseError::Lex)?;

    if let Some(token) = tokens.iter().find(|token| token.kind == TokenKind::Error) {
        return Err(GrammarError::invalid_token(token).into());
    }

    let mut input = tokens.as_slice();
    let keyword = expect_kind(&mut input, TokenKind::Ident, "command keyword")?;
    let Some(spec) = catalog::find(keyword.lexeme) else {
        return Err(GrammarError {
            kind: GrammarErrorKind::UnknownCommand {
                lexeme: keyword.lexeme,
            },
        }
        .into());
    };

    let command = match spec.tag {
        CommandTag::Show => Command::Show,
        CommandTag::Save => Command::Save,
        CommandTag::NoSleep => Command::NoSleep,
        CommandTag::Sleep => Command::Sleep,
        CommandTag::Reboot => Command::Reboot,
        CommandTag::Status => Command::Status,
        CommandTag::Reset => {
            if let Some(token) = optional_ident(&mut input)? {
                if !RESET_KEYWORDS
                    .iter()
                    .any(|keyword| keyword.eq_ignore_ascii_case(token.lexeme))
                {
                    return Err(GrammarError::unexpected(spec.usage, Some(&token)).into());
                }
            }
            Command::Reset
        }
        CommandTag::Set => {
            let key_token = expect_kind(&mut input, TokenKind::Ident, "setting name")?;
            let Some(key) = SettingKey::from_name(key_token.lexeme) else {
                return Err(GrammarError {
                    kind: GrammarErrorKind::UnknownSetting {
                        lexeme: key_token.lexeme,
                    },
                }
                .into());
            };
            Command::Set {
                key,
                value: raw_value.unwrap_or_default(),
            }
        }
        CommandTag::OtaVersion => Command::OtaVersion(ota_target(&mut input)?),
        CommandTag::Help => Command::Help {
            topic: optional_ident(&mut input)?.map(|token| token.lexeme),
        },
    };

    expect_end(input)?;
    Ok(command)
}

/// Splits `set <key> <value>` so the value bypasses the lexer.
fn split_raw_value(line: &str) -> (&str, Option<&str>) {
    let command_start = line.len() - line.trim_start().len();
    let rest = &line[command_start..];
    let command_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let is_set = catalog::find(&rest[..command_end])
        .is_some_and(|spec| spec.arguments == ArgumentSpec::SettingValue);
    if !is_set {
        return (line, None);
    }

    let after_command = &rest[command_end..];
    let key_start = after_command.len() - after_command.trim_start().len();
    let key_rest = &after_command[key_start..];
    let key_end = key_rest.find(char::is_whitespace).unwrap_or(key_rest.len());

    let head_len = command_start + command_end + key_start + key_end;
    let value = key_rest[key_end..].trim();
    (&line[..head_len], Some(value))
}

fn expect_kind<'src>(
    input: &mut Input<'src, '_>,
    kind: TokenKind,
    label: &'static str,
) -> Result<Token<'src>, GrammarError<'src>> {
    match input.split_first() {
        Some((token, rest)) if token.kind == kind => {
            *input = rest;
            Ok(token.clone())
        }
        Some((token, _)) => Err(GrammarError::unexpected(label, Some(token))),
        None => Err(GrammarError::unexpected(label, None)),
    }
}

fn optional_ident<'src>(
    input: &mut Input<'src, '_>,
) -> Result<Option<Token<'src>>, GrammarError<'src>> {
    match input.first() {
        None => Ok(None),
        Some(token) if token.kind == TokenKind::Eol => Ok(None),
        Some(_) => expect_kind(input, TokenKind::Ident, "keyword").map(Some),
    }
}

fn ota_target<'src>(
    input: &mut Input<'src, '_>,
) -> Result<Option<OtaTarget>, GrammarError<'src>> {
    let Some((token, rest)) = input.split_first() else {
        return Ok(None);
    };

    let target = match token.kind {
        TokenKind::Eol => return Ok(None),
        TokenKind::Version => FirmwareVersion::parse(token.lexeme)
            .map(OtaTarget::Set)
            .map_err(|_| GrammarError {
                kind: GrammarErrorKind::InvalidVersion {
                    lexeme: token.lexeme,
                },
            })?,
        TokenKind::Ident
            if CLEAR_TARGET_KEYWORDS
                .iter()
                .any(|keyword| keyword.eq_ignore_ascii_case(token.lexeme)) =>
        {
            OtaTarget::Clear
        }
        TokenKind::Integer | TokenKind::Ident => {
            return Err(GrammarError {
                kind: GrammarErrorKind::InvalidVersion {
                    lexeme: token.lexeme,
                },
            });
        }
        _ => return Err(GrammarError::unexpected("version", Some(token))),
    };

    *input = rest;
    Ok(Some(target))
}

fn expect_end<'src>(mut rest: Input<'src, '_>) -> Result<(), GrammarError<'src>> {
    while let Some((token, remaining)) = rest.split_first() {
        if token.kind == TokenKind::Eol {
            rest = remaining;
        } else {
            return Err(GrammarError::unexpected("end of command", Some(token)));
        }
    }
    Ok(())
}
