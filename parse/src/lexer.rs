use std::fmt::{Debug, Display, Formatter};

/// Reflects an offset in the input. This can be translated to a line+column
/// Position using Lexer::to_position.
#[derive(Copy, Clone, Debug)]
pub struct Pos(usize); // Only obtainable from a token, so it is always valid.

#[derive(Debug, PartialEq, Eq)]
pub struct Position {
    pub filename: Option<String>,
    pub line: usize,
    pub column: usize,
}

impl Position {
    fn new(filename: Option<String>, line: usize, column: usize) -> Position {
        Position {
            filename,
            line,
            column,
        }
    }

    #[cfg(test)]
    fn untitled(line: usize, column: usize) -> Position {
        Position {
            filename: None,
            line,
            column,
        }
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.filename.as_deref().unwrap_or(""),
            self.line,
            self.column
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Token<'a> {
    /// `<path` at column 0. Carries the trimmed path.
    Include(&'a str),
    /// The `var` keyword. Switches the lexer into declaration mode.
    Var,
    /// The `ruletype` keyword.
    Ruletype,
    Colon,
    Equals,
    /// A bareword. The slice is exactly as written, which may embed `:` and
    /// `"` characters; dependency tokens rely on this.
    Word(&'a str),
    /// A double-quoted string, quotes included.
    Str(&'a str),
    /// A single-quoted regular expression, quotes included.
    Regex(&'a str),
    /// A variable name inside a `var` declaration.
    Ident(&'a str),
    /// A recipe line: column-0 TAB, content to end of line (untrimmed).
    RecipeLine(&'a str),
    Comment(&'a str),
    Newline,
    Illegal(char),
}

impl<'a> Display for Token<'a> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                Token::Include(_) => "include",
                Token::Var => "var",
                Token::Ruletype => "ruletype",
                Token::Colon => ":",
                Token::Equals => "=",
                Token::Word(_) => "word",
                Token::Str(_) => "string",
                Token::Regex(_) => "regex",
                Token::Ident(_) => "identifier",
                Token::RecipeLine(_) => "recipe line",
                Token::Comment(_) => "comment",
                Token::Newline => "newline",
                Token::Illegal(_) => "illegal character",
            }
        )
    }
}

impl<'a> Token<'a> {
    pub fn value(&self) -> &'a str {
        match *self {
            Token::Include(v)
            | Token::Word(v)
            | Token::Str(v)
            | Token::Regex(v)
            | Token::Ident(v)
            | Token::RecipeLine(v)
            | Token::Comment(v) => v,
            _ => panic!("Incorrect token type"),
        }
    }
}

/// The sublanguage of `var NAME = value` declarations is lexed statefully:
/// a name and `=` are expected, then value tokens until the newline.
#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Root,
    VarName,
    VarValue,
}

pub struct Lexer<'a> {
    data: &'a str,
    filename: Option<String>,
    offset: usize,
    line_offsets: Vec<usize>,
    mode: Mode,
}

impl<'a> Lexer<'a> {
    pub fn new(data: &'a str, filename: Option<String>) -> Lexer<'a> {
        Lexer {
            data,
            filename,
            offset: 0,
            line_offsets: vec![0],
            mode: Mode::Root,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.data.as_bytes().get(self.offset).copied()
    }

    fn bump(&mut self) {
        self.offset += 1;
    }

    fn done(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn at_line_start(&self) -> bool {
        *self.line_offsets.last().unwrap() == self.offset
    }

    fn record_line(&mut self) {
        self.line_offsets.push(self.offset);
    }

    /// May only be called once the stream is consumed, so the line table is
    /// complete when a conversion to Position is requested.
    pub fn last_pos(&self) -> Pos {
        assert!(self.done());
        Pos(self.data.len())
    }

    pub fn to_position(&self, pos: Pos) -> Position {
        if pos.0 > self.data.len() {
            panic!("position {} past end of data {}", pos.0, self.data.len());
        }

        match self.line_offsets.binary_search(&pos.0) {
            Ok(idx) => Position::new(self.filename.clone(), idx + 1, 1),
            Err(idx) => {
                // Since 0 is the first element in the vec, nothing can be
                // inserted before it, at position 0.
                assert!(idx > 0);
                Position::new(
                    self.filename.clone(),
                    idx,
                    pos.0 - self.line_offsets[idx - 1] + 1,
                )
            }
        }
    }

    /// Panics if position.line is not valid.
    pub fn retrieve_line(&self, position: &Position) -> &'a str {
        assert!(position.line >= 1 && position.line <= self.line_offsets.len());
        let idx = position.line - 1;
        let start = self.line_offsets[idx];
        let end = if idx == self.line_offsets.len() - 1 {
            // Last recorded line. Either we haven't lexed its newline yet, or
            // it is EOF, so look for the line end by hand.
            let bytes = self.data.as_bytes();
            let mut i = start;
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            i
        } else {
            // Subtract 1 to exclude the newline itself.
            self.line_offsets[idx + 1].saturating_sub(1)
        };

        &self.data[start..end]
    }

    fn scan_to_eol(&mut self) -> &'a str {
        let start = self.offset;
        while let Some(c) = self.peek() {
            if c == b'\n' {
                break;
            }
            self.bump();
        }
        &self.data[start..self.offset]
    }

    /// Barewords run until whitespace, a single quote or a backslash. Colons
    /// and double quotes do not stop a word, so `parts:"fresh"` is one token.
    fn scan_word(&mut self) -> &'a str {
        let start = self.offset;
        while let Some(c) = self.peek() {
            if c == b'\'' || c == b'\\' || c.is_ascii_whitespace() {
                break;
            }
            self.bump();
        }
        &self.data[start..self.offset]
    }

    /// A backslash continues the line: the rest of the line, the newline and
    /// any following whitespace are discarded.
    fn scan_continuation(&mut self) {
        self.bump();
        self.scan_to_eol();
        if self.peek() == Some(b'\n') {
            self.bump();
            self.record_line();
        }
        while let Some(c) = self.peek() {
            if !c.is_ascii_whitespace() {
                break;
            }
            self.bump();
            if c == b'\n' {
                self.record_line();
            }
        }
    }

    /// Consumes a quoted run starting at the current offset (which must be
    /// the opening quote). Returns false if the closing quote is missing.
    fn scan_quoted_run(&mut self, quote: u8) -> bool {
        self.bump(); // opening quote
        while let Some(c) = self.peek() {
            self.bump();
            match c {
                b'\\' => {
                    // Escapes, notably \" and \'.
                    if self.peek().is_some() {
                        self.bump();
                    }
                }
                b'\n' => self.record_line(),
                c if c == quote => return true,
                _ => {}
            }
        }
        false
    }

    fn lex_quoted(&mut self, quote: u8) -> Token<'a> {
        let start = self.offset;
        if !self.scan_quoted_run(quote) {
            return Token::Illegal(quote as char);
        }
        // A colon directly after the closing quote glues the pieces into one
        // dependency token (`"parts":fresh`). A standalone colon, separated
        // by whitespace, stays a section separator.
        if self.mode == Mode::Root && self.peek() == Some(b':') {
            while let Some(c) = self.peek() {
                match c {
                    b'"' => {
                        self.scan_quoted_run(b'"');
                    }
                    c if c == b'\'' || c == b'\\' || c.is_ascii_whitespace() => break,
                    _ => self.bump(),
                }
            }
            return Token::Word(&self.data[start..self.offset]);
        }
        let slice = &self.data[start..self.offset];
        if quote == b'"' {
            Token::Str(slice)
        } else {
            Token::Regex(slice)
        }
    }

    fn lex_root(&mut self, ch: u8) -> Token<'a> {
        match ch {
            b':' => {
                self.bump();
                Token::Colon
            }
            b'"' => self.lex_quoted(b'"'),
            b'\'' => self.lex_quoted(b'\''),
            _ => match self.scan_word() {
                "var" => {
                    self.mode = Mode::VarName;
                    Token::Var
                }
                "ruletype" => Token::Ruletype,
                word => Token::Word(word),
            },
        }
    }

    fn lex_var_name(&mut self, ch: u8) -> Token<'a> {
        match ch {
            b'=' => {
                self.bump();
                self.mode = Mode::VarValue;
                Token::Equals
            }
            c if c.is_ascii_alphabetic() => {
                let start = self.offset;
                while let Some(c) = self.peek() {
                    if !(c.is_ascii_alphanumeric() || c == b'_' || c == b'-') {
                        break;
                    }
                    self.bump();
                }
                Token::Ident(&self.data[start..self.offset])
            }
            _ => {
                self.bump();
                Token::Illegal(ch as char)
            }
        }
    }

    fn lex_var_value(&mut self, ch: u8) -> Token<'a> {
        match ch {
            b'"' => self.lex_quoted(b'"'),
            b'\'' => {
                self.bump();
                Token::Illegal('\'')
            }
            _ => Token::Word(self.scan_word()),
        }
    }
}

impl<'a> Debug for Lexer<'a> {
    fn fmt(&self, fmt: &mut Formatter) -> std::fmt::Result {
        fmt.debug_struct("Lexer")
            .field("filename", &self.filename)
            .field("offset", &self.offset)
            .field("mode", &self.mode)
            .finish()
    }
}

pub type LexerItem<'a> = (Token<'a>, Pos);

impl<'a> Iterator for Lexer<'a> {
    type Item = LexerItem<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        // The loop only exists to skip whitespace and continuations;
        // everything else returns.
        loop {
            let ch = self.peek()?;
            let pos = Pos(self.offset);

            if self.mode == Mode::Root && self.at_line_start() {
                if ch == b'<' {
                    self.bump();
                    let line = self.scan_to_eol();
                    return Some((Token::Include(line.trim()), pos));
                }
                if ch == b'\t' {
                    self.bump();
                    return Some((Token::RecipeLine(self.scan_to_eol()), pos));
                }
            }

            match ch {
                b' ' | b'\t' | b'\r' | b'\x0c' => {
                    self.bump();
                    continue;
                }
                b'\n' => {
                    self.bump();
                    self.record_line();
                    // A newline terminates a var declaration.
                    self.mode = Mode::Root;
                    return Some((Token::Newline, pos));
                }
                b'#' if self.mode == Mode::Root => {
                    return Some((Token::Comment(self.scan_to_eol()), pos));
                }
                b'\\' => {
                    self.scan_continuation();
                    continue;
                }
                _ => {}
            }

            return Some((
                match self.mode {
                    Mode::Root => self.lex_root(ch),
                    Mode::VarName => self.lex_var_name(ch),
                    Mode::VarValue => self.lex_var_value(ch),
                },
                pos,
            ));
        }
    }
}
