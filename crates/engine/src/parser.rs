//! Script Parser - splits a SQL migration script into statements per direction
//!
//! Scripts are annotated with directive comments:
//!
//! ```sql
//! -- +gomigrate Up
//! CREATE TABLE t(id int);
//! -- +gomigrate StatementBegin
//! CREATE FUNCTION ... $$ ... $$;
//! -- +gomigrate StatementEnd
//! -- +gomigrate Down
//! DROP TABLE t;
//! ```
//!
//! Outside a `StatementBegin`/`StatementEnd` block a statement ends at a line whose
//! last token (ignoring a trailing `--` comment) ends with `;`. Inside a block the
//! whole block is one statement.

use std::io::BufRead;
use thiserror::Error;
use tracing::debug;

use crate::definitions::{Direction, DEFAULT_DIRECTIVE_TOOL};

/// Grammar violations found while scanning a script
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: duplicate Up directive")]
    DuplicateUp { line: usize },

    #[error("line {line}: Down directive must follow the Up section")]
    MisplacedDown { line: usize },

    #[error("line {line}: StatementBegin is not allowed here")]
    MisplacedStatementBegin { line: usize },

    #[error("line {line}: StatementEnd without a matching StatementBegin")]
    UnmatchedStatementEnd { line: usize },

    #[error("no Up directive found")]
    MissingUp,

    #[error("missing StatementEnd for an open StatementBegin block")]
    UnterminatedBlock,

    #[error("unexpected unfinished statement (missing semicolon?): {pending}")]
    UnterminatedStatement { pending: String },

    #[error("failed to read script: {0}")]
    Io(#[from] std::io::Error),
}

/// Scanner states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Start,
    InUp,
    StatementBeginUp,
    StatementEndUp,
    InDown,
    StatementBeginDown,
    StatementEndDown,
}

impl ParserState {
    fn direction(&self) -> Option<Direction> {
        match self {
            ParserState::Start => None,
            ParserState::InUp | ParserState::StatementBeginUp | ParserState::StatementEndUp => {
                Some(Direction::Up)
            }
            ParserState::InDown
            | ParserState::StatementBeginDown
            | ParserState::StatementEndDown => Some(Direction::Down),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    Up,
    Down,
    StatementBegin,
    StatementEnd,
    NoTransaction,
}

/// Statements for one direction of a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedScript {
    pub statements: Vec<String>,
    /// False when the script carries a `NoTransaction` directive
    pub transactional: bool,
}

/// Directive-driven scanner for migration scripts
#[derive(Debug, Clone)]
pub struct ScriptParser {
    tool: String,
}

impl Default for ScriptParser {
    fn default() -> Self {
        Self::new(DEFAULT_DIRECTIVE_TOOL)
    }
}

impl ScriptParser {
    /// Create a parser recognising `-- +<tool> ...` directives
    pub fn new(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Parse script text for `direction`.
    pub fn parse_str(&self, script: &str, direction: Direction) -> Result<ParsedScript, ParseError> {
        self.parse(script.as_bytes(), direction)
    }

    /// Parse a script from a reader for `direction`.
    pub fn parse<R: BufRead>(&self, reader: R, direction: Direction) -> Result<ParsedScript, ParseError> {
        let mut state = ParserState::Start;
        let mut transactional = true;
        let mut statements = Vec::new();
        let mut buffer = String::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            let line_no = index + 1;

            if let Some(comment) = line.strip_prefix("--") {
                match self.directive(comment.trim()) {
                    Some(Directive::Up) => {
                        if state != ParserState::Start {
                            return Err(ParseError::DuplicateUp { line: line_no });
                        }
                        state = ParserState::InUp;
                        // Text before the Up section belongs to no direction.
                        buffer.clear();
                    }
                    Some(Directive::Down) => {
                        if !matches!(state, ParserState::InUp | ParserState::StatementEndUp) {
                            return Err(ParseError::MisplacedDown { line: line_no });
                        }
                        let pending = buffer.trim();
                        if !pending.is_empty() {
                            return Err(ParseError::UnterminatedStatement {
                                pending: pending.to_string(),
                            });
                        }
                        state = ParserState::InDown;
                    }
                    Some(Directive::StatementBegin) => {
                        state = match state {
                            ParserState::InUp | ParserState::StatementEndUp => {
                                ParserState::StatementBeginUp
                            }
                            ParserState::InDown | ParserState::StatementEndDown => {
                                ParserState::StatementBeginDown
                            }
                            _ => return Err(ParseError::MisplacedStatementBegin { line: line_no }),
                        };
                    }
                    Some(Directive::StatementEnd) => {
                        state = match state {
                            ParserState::StatementBeginUp => ParserState::StatementEndUp,
                            ParserState::StatementBeginDown => ParserState::StatementEndDown,
                            _ => return Err(ParseError::UnmatchedStatementEnd { line: line_no }),
                        };
                        if state.direction() != Some(direction) {
                            buffer.clear();
                            continue;
                        }
                        flush(&mut buffer, &mut statements);
                        state = match state {
                            ParserState::StatementEndUp => ParserState::InUp,
                            _ => ParserState::InDown,
                        };
                    }
                    Some(Directive::NoTransaction) => transactional = false,
                    None => {}
                }
                debug!(line = line_no, state = ?state, "script directive scanned");
                continue;
            }

            if line.trim().is_empty() {
                continue;
            }

            buffer.push_str(line);
            buffer.push('\n');

            if state.direction() != Some(direction) {
                if state != ParserState::Start {
                    buffer.clear();
                }
                continue;
            }

            if matches!(state, ParserState::InUp | ParserState::InDown) && ends_with_semicolon(line) {
                flush(&mut buffer, &mut statements);
            }
        }

        if state == ParserState::Start {
            return Err(ParseError::MissingUp);
        }
        if matches!(
            state,
            ParserState::StatementBeginUp | ParserState::StatementBeginDown
        ) {
            return Err(ParseError::UnterminatedBlock);
        }
        let pending = buffer.trim();
        if !pending.is_empty() {
            return Err(ParseError::UnterminatedStatement {
                pending: pending.to_string(),
            });
        }

        Ok(ParsedScript {
            statements,
            transactional,
        })
    }

    fn directive(&self, comment: &str) -> Option<Directive> {
        let command = comment.strip_prefix('+')?.strip_prefix(self.tool.as_str())?;
        if !command.starts_with(char::is_whitespace) {
            return None;
        }
        match command.trim() {
            "Up" => Some(Directive::Up),
            "Down" => Some(Directive::Down),
            "StatementBegin" => Some(Directive::StatementBegin),
            "StatementEnd" => Some(Directive::StatementEnd),
            "NoTransaction" | "NO TRANSACTION" => Some(Directive::NoTransaction),
            _ => None,
        }
    }
}

fn flush(buffer: &mut String, statements: &mut Vec<String>) {
    if !buffer.trim().is_empty() {
        statements.push(std::mem::take(buffer));
    }
    buffer.clear();
}

/// Whether the last token before any `--` comment ends with a semicolon
fn ends_with_semicolon(line: &str) -> bool {
    line.split_whitespace()
        .take_while(|word| !word.starts_with("--"))
        .last()
        .map_or(false, |word| word.ends_with(';'))
}
