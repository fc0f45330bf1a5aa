#![forbid(unsafe_code)]

//! Splitting of heuristics command lines into argument vectors.
//!
//! The rules are a small subset of a POSIX shell: whitespace separates
//! arguments, `"` groups characters (including whitespace) into one
//! argument, and `\` takes the next character literally. Inside quotes a
//! backslash only escapes `"` and `\`; before anything else it is kept.
//! A line break ends the command, as does the end of input. A dangling
//! backslash is dropped.

use std::iter::Peekable;
use std::str::Chars;

/// Split `command` into arguments.
pub fn split_command(command: &str) -> Vec<String> {
    Lexer::new(command).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Word,
    Escape,
    Quoted,
    QuotedEscape,
}

#[derive(Debug)]
pub struct Lexer<'a> {
    input: Peekable<Chars<'a>>,
    finished: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input: input.chars().peekable(),
            finished: false,
        }
    }

    fn skip_spaces(&mut self) {
        while let Some(&ch) = self.input.peek() {
            if is_line_break(ch) || !ch.is_ascii_whitespace() {
                return;
            }
            self.input.next();
        }
    }
}

impl Iterator for Lexer<'_> {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        self.skip_spaces();
        match self.input.peek() {
            None => {
                self.finished = true;
                return None;
            }
            Some(&ch) if is_line_break(ch) => {
                self.finished = true;
                return None;
            }
            Some(_) => {}
        }

        let mut token = String::new();
        let mut state = State::Word;

        loop {
            let Some(&ch) = self.input.peek() else {
                break;
            };

            match state {
                State::Word => {
                    if ch == '\\' {
                        state = State::Escape;
                    } else if ch == '"' {
                        state = State::Quoted;
                    } else if ch.is_ascii_whitespace() {
                        break;
                    } else {
                        token.push(ch);
                    }
                }
                State::Escape => {
                    if is_line_break(ch) {
                        break;
                    }
                    token.push(ch);
                    state = State::Word;
                }
                State::Quoted => {
                    if is_line_break(ch) {
                        break;
                    } else if ch == '\\' {
                        state = State::QuotedEscape;
                    } else if ch == '"' {
                        state = State::Word;
                    } else {
                        token.push(ch);
                    }
                }
                State::QuotedEscape => {
                    if is_line_break(ch) {
                        break;
                    }
                    if ch != '\\' && ch != '"' {
                        token.push('\\');
                    }
                    token.push(ch);
                    state = State::Quoted;
                }
            }
            self.input.next();
        }

        Some(token)
    }
}

fn is_line_break(ch: char) -> bool {
    ch == '\n' || ch == '\r'
}
