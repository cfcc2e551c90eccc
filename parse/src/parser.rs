use std::fmt::{Display, Formatter};

use thiserror::Error;

use super::{
    ast::*,
    lexer::{self, Lexer, LexerItem, Position, Token},
};

#[derive(Debug, Error)]
pub struct ParseError {
    pub position: Position,
    pub line: String,
    pub message: String,
}

impl ParseError {
    fn new<S: Into<String>>(msg: S, pos: lexer::Pos, lexer: &Lexer) -> ParseError {
        let position = lexer.to_position(pos);
        let line = lexer.retrieve_line(&position).to_owned();
        ParseError {
            position,
            line,
            message: msg.into(),
        }
    }

    fn eof<S: Into<String>>(msg: S, lexer: &Lexer) -> ParseError {
        let pos = lexer.last_pos();
        ParseError::new(msg, pos, lexer)
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{position}: {msg}\n{line}\n{indent}^ near here",
            position = self.position,
            msg = self.message,
            line = self.line,
            indent = " ".repeat(self.position.column.saturating_sub(1)),
        )
    }
}

#[derive(Default)]
struct Peeker<'a> {
    peeked: Option<LexerItem<'a>>,
}

impl<'a> Peeker<'a> {
    /// Comments never matter to the grammar, so they are dropped here.
    fn next(&mut self, lexer: &mut Lexer<'a>) -> Option<LexerItem<'a>> {
        if self.peeked.is_some() {
            return self.peeked.take();
        }
        loop {
            match lexer.next() {
                Some((Token::Comment(_), _)) => continue,
                item => return item,
            }
        }
    }

    fn peek(&mut self, lexer: &mut Lexer<'a>) -> Option<&LexerItem<'a>> {
        if self.peeked.is_none() {
            self.peeked = self.next(lexer);
        }
        self.peeked.as_ref()
    }
}

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    peeker: Peeker<'a>,
    source_name: Option<String>,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str, source_name: Option<String>) -> Parser<'a> {
        Parser {
            lexer: Lexer::new(input, source_name.clone()),
            peeker: Default::default(),
            source_name,
        }
    }

    fn next_token(&mut self) -> Option<LexerItem<'a>> {
        self.peeker.next(&mut self.lexer)
    }

    fn peek_token(&mut self) -> Option<&LexerItem<'a>> {
        self.peeker.peek(&mut self.lexer)
    }

    fn unexpected(&self, expected: &str, token: &Token, pos: lexer::Pos) -> ParseError {
        ParseError::new(
            format!("Expected {}, got {}", expected, token),
            pos,
            &self.lexer,
        )
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.next_token() {
            None => Err(ParseError::eof("Expected identifier, got EOF", &self.lexer)),
            Some((Token::Ident(name), _)) => Ok(name.to_owned()),
            Some((token, pos)) => Err(self.unexpected("identifier", &token, pos)),
        }
    }

    fn expect_equals(&mut self) -> Result<(), ParseError> {
        match self.next_token() {
            None => Err(ParseError::eof("Expected =, got EOF", &self.lexer)),
            Some((Token::Equals, _)) => Ok(()),
            Some((token, pos)) => Err(self.unexpected("=", &token, pos)),
        }
    }

    /// A newline, or EOF, which is as good as one.
    fn expect_newline(&mut self) -> Result<(), ParseError> {
        match self.next_token() {
            None | Some((Token::Newline, _)) => Ok(()),
            Some((token, pos)) => Err(self.unexpected("newline", &token, pos)),
        }
    }

    fn token_to_element(token: &Token<'a>) -> Option<Element> {
        match token {
            Token::Word(s) => Some(Element::Word((*s).to_owned())),
            Token::Str(s) => Some(Element::Str((*s).to_owned())),
            Token::Regex(s) => Some(Element::Regex((*s).to_owned())),
            _ => None,
        }
    }

    /// Collects elements up to (not including) the next non-element token.
    fn collect_elements(&mut self) -> Vec<Element> {
        let mut elements = Vec::new();
        while let Some((token, _)) = self.peek_token() {
            match Parser::token_to_element(token) {
                Some(element) => {
                    elements.push(element);
                    self.next_token();
                }
                None => break,
            }
        }
        elements
    }

    fn parse_var(&mut self) -> Result<Var, ParseError> {
        let name = self.expect_ident()?;
        self.expect_equals()?;
        let mut value = Vec::new();
        loop {
            match self.next_token() {
                None | Some((Token::Newline, _)) => break,
                // Quoted tokens keep their inner spacing but drop the quotes.
                Some((Token::Str(s), _)) => {
                    value.push(s.trim_matches('"').to_owned());
                }
                Some((Token::Word(s), _)) => value.push(s.to_owned()),
                Some((Token::Ident(s), _)) => value.push(s.to_owned()),
                Some((token, pos)) => return Err(self.unexpected("value", &token, pos)),
            }
        }
        Ok(Var { name, value })
    }

    /// `: SecondPart [: ThirdPart] newline` followed by recipe lines.
    /// The leading colon has already been consumed.
    fn parse_section(&mut self) -> Result<RuleSection, ParseError> {
        let mut section = RuleSection {
            second: self.collect_elements(),
            ..Default::default()
        };
        if let Some((Token::Colon, _)) = self.peek_token() {
            self.next_token();
            section.has_third = true;
            section.third = self.collect_elements();
        }
        self.expect_newline()?;

        while let Some((Token::RecipeLine(line), _)) = self.peek_token() {
            section.lines.push(line.trim().to_owned());
            self.next_token();
            if let Some((Token::Newline, _)) = self.peek_token() {
                self.next_token();
            }
        }
        Ok(section)
    }

    /// Sections may sit on the target's line or on their own lines below
    /// the recipe block; blank lines in between are fine.
    fn parse_sections(&mut self) -> Result<Vec<RuleSection>, ParseError> {
        let mut sections = Vec::new();
        loop {
            match self.peek_token() {
                Some((Token::Colon, _)) => {
                    self.next_token();
                    sections.push(self.parse_section()?);
                }
                Some((Token::Newline, _)) => {
                    self.next_token();
                }
                _ => break,
            }
        }
        Ok(sections)
    }

    fn parse_rule(&mut self, first: Element) -> Result<Rule, ParseError> {
        let mut target = vec![first];
        target.extend(self.collect_elements());
        let sections = self.parse_sections()?;
        Ok(Rule { target, sections })
    }

    fn parse_ruletype(&mut self) -> Result<RuleTypeDecl, ParseError> {
        let name = match self.next_token() {
            None => {
                return Err(ParseError::eof(
                    "Expected rule-type name, got EOF",
                    &self.lexer,
                ))
            }
            Some((token, pos)) => Parser::token_to_element(&token)
                .ok_or_else(|| self.unexpected("rule-type name", &token, pos))?,
        };
        let sections = self.parse_sections()?;
        Ok(RuleTypeDecl { name, sections })
    }

    pub fn parse(mut self) -> Result<File, ParseError> {
        let mut directives = Vec::new();
        while let Some((token, pos)) = self.next_token() {
            match token {
                Token::Include(path) => {
                    directives.push(Directive::Include(path.to_owned()));
                }
                Token::Var => {
                    directives.push(Directive::Var(self.parse_var()?));
                }
                Token::Ruletype => {
                    directives.push(Directive::RuleType(self.parse_ruletype()?));
                }
                Token::Newline => {}
                Token::RecipeLine(_) => {
                    return Err(ParseError::new(
                        "Recipe line outside a rule",
                        pos,
                        &self.lexer,
                    ));
                }
                Token::Illegal(ch) => {
                    return Err(ParseError::new(
                        format!("Unexpected character '{}'", ch),
                        pos,
                        &self.lexer,
                    ));
                }
                Token::Word(_) | Token::Str(_) | Token::Regex(_) => {
                    let first = Parser::token_to_element(&token).unwrap();
                    directives.push(Directive::Rule(self.parse_rule(first)?));
                }
                token => {
                    return Err(self.unexpected("directive", &token, pos));
                }
            }
        }
        Ok(File {
            source: self.source_name,
            directives,
        })
    }
}
