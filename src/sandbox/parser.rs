// SPDX-License-Identifier: AGPL-3.0-or-later

//! Recursive-descent parser for the recipe shell dialect

use std::rc::Rc;

use super::{Limits, SandboxError};

#[derive(Debug, Clone, PartialEq)]
pub enum WordPart {
    /// Unquoted literal text
    Lit(String),
    /// Single-quoted or backslash-escaped text
    Quoted(String),
    /// Double-quoted section
    Double(Vec<WordPart>),
    Param(Box<ParamExp>),
    /// `$(...)` or backticks; commands never run, so this expands to nothing
    CmdSubst,
}

pub type Word = Vec<WordPart>;

#[derive(Debug, Clone, PartialEq)]
pub struct ParamExp {
    pub name: String,
    pub index: Option<Subscript>,
    pub length: bool,
    pub op: Option<ParamOp>,
}

impl ParamExp {
    fn plain(name: String) -> Self {
        Self {
            name,
            index: None,
            length: false,
            op: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Subscript {
    /// `[@]`
    All,
    /// `[*]`
    Joined,
    Key(Word),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamOp {
    Default { colon: bool, word: Word },
    Assign { colon: bool, word: Word },
    Alternate { colon: bool, word: Word },
    TrimPrefix { longest: bool, pattern: Word },
    TrimSuffix { longest: bool, pattern: Word },
    Replace { all: bool, pattern: Word, replacement: Word },
    Upper,
    Lower,
}

#[derive(Debug, Clone)]
pub struct Assign {
    pub name: String,
    pub index: Option<Word>,
    pub append: bool,
    pub value: AssignValue,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub enum AssignValue {
    Scalar(Word),
    Array(Vec<ArrayElem>),
}

#[derive(Debug, Clone)]
pub struct ArrayElem {
    pub key: Option<Word>,
    pub value: Word,
}

#[derive(Debug, Clone)]
pub enum DeclArg {
    Flag(String),
    Assign(Assign),
    Name(Word),
}

#[derive(Debug, Clone)]
pub enum TestToken {
    Op(String),
    Word(Word),
}

#[derive(Debug, Clone)]
pub struct CaseArm {
    pub patterns: Vec<Word>,
    pub body: Vec<AndOr>,
}

#[derive(Debug, Clone)]
pub enum Command {
    Simple {
        assigns: Vec<Assign>,
        words: Vec<Word>,
    },
    Declare {
        builtin: String,
        args: Vec<DeclArg>,
    },
    /// `[[ ... ]]`
    Test(Vec<TestToken>),
    FuncDef {
        name: String,
        body: Rc<Command>,
        line: u32,
    },
    If {
        branches: Vec<(Vec<AndOr>, Vec<AndOr>)>,
        otherwise: Option<Vec<AndOr>>,
    },
    For {
        var: String,
        items: Option<Vec<Word>>,
        body: Vec<AndOr>,
    },
    Case {
        subject: Word,
        arms: Vec<CaseArm>,
    },
    Group(Vec<AndOr>),
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    pub negated: bool,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone)]
pub struct AndOr {
    pub first: Pipeline,
    /// `true` for `&&`, `false` for `||`
    pub rest: Vec<(bool, Pipeline)>,
}

impl AndOr {
    pub fn pipelines(&self) -> impl Iterator<Item = &Pipeline> {
        std::iter::once(&self.first).chain(self.rest.iter().map(|(_, p)| p))
    }
}

const DECLARATION_BUILTINS: &[&str] = &["declare", "typeset", "local", "export", "readonly"];
const CLOSERS: &[&str] = &["}", "then", "elif", "else", "fi", "do", "done", "esac"];

fn is_word_end(c: char) -> bool {
    c.is_whitespace() || matches!(c, ';' | '&' | '|' | '(' | ')' | '<' | '>')
}

fn is_name_start(c: char) -> bool {
    c == '_' || c.is_ascii_alphabetic()
}

fn is_name_char(c: char) -> bool {
    c == '_' || c.is_ascii_alphanumeric()
}

/// Text of a word made only of literal parts
pub fn literal(word: &[WordPart]) -> Option<String> {
    let mut out = String::new();
    for part in word {
        match part {
            WordPart::Lit(s) | WordPart::Quoted(s) => out.push_str(s),
            _ => return None,
        }
    }
    Some(out)
}

/// Whether the word is literal text with no quoting at all
pub fn is_bare_literal(word: &[WordPart]) -> bool {
    word.iter().all(|part| matches!(part, WordPart::Lit(_)))
}

fn flush(lit: &mut String, parts: &mut Vec<WordPart>) {
    if !lit.is_empty() {
        parts.push(WordPart::Lit(std::mem::take(lit)));
    }
}

pub struct Parser {
    src: Vec<char>,
    pos: usize,
    line: u32,
    depth: usize,
    max_nesting: usize,
}

impl Parser {
    pub fn new(source: &str) -> Self {
        Self {
            src: source.chars().collect(),
            pos: 0,
            line: 1,
            depth: 0,
            max_nesting: Limits::default().max_nesting,
        }
    }

    /// Bound on how deeply commands and expansions may nest
    pub fn max_nesting(mut self, max_nesting: usize) -> Self {
        self.max_nesting = max_nesting;
        self
    }

    pub fn parse(mut self) -> Result<Vec<AndOr>, SandboxError> {
        let script = self.parse_list(&[])?;
        match self.peek() {
            None => Ok(script),
            Some(c) => Err(self.error(format!("unexpected `{c}`"))),
        }
    }

    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, SandboxError>,
    ) -> Result<T, SandboxError> {
        if self.depth >= self.max_nesting {
            return Err(self.error(format!("nested deeper than {} levels", self.max_nesting)));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn peek(&self) -> Option<char> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.src.get(self.pos + n).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars().enumerate().all(|(i, c)| self.peek_at(i) == Some(c))
    }

    fn eat(&mut self, s: &str) -> bool {
        if !self.starts_with(s) {
            return false;
        }
        for _ in s.chars() {
            self.bump();
        }
        true
    }

    fn rewind(&mut self, pos: usize, line: u32) {
        self.pos = pos;
        self.line = line;
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        self.starts_with(keyword)
            && self
                .peek_at(keyword.chars().count())
                .map_or(true, is_word_end)
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), SandboxError> {
        self.skip_blanks();
        if self.at_keyword(keyword) {
            self.eat(keyword);
            Ok(())
        } else {
            Err(self.error(format!("expected `{keyword}`")))
        }
    }

    fn error(&self, message: impl Into<String>) -> SandboxError {
        SandboxError::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn unsupported(&self, construct: &str) -> SandboxError {
        SandboxError::Unsupported {
            line: self.line,
            construct: construct.to_string(),
        }
    }

    fn unexpected(&self) -> SandboxError {
        match self.peek() {
            Some('\n') => self.error("unexpected end of line"),
            Some(c) => self.error(format!("unexpected `{c}`")),
            None => self.error("unexpected end of file"),
        }
    }

    fn skip_blanks(&mut self) {
        loop {
            match self.peek() {
                Some(' ' | '\t' | '\r') => {
                    self.bump();
                }
                Some('\\') if self.peek_at(1) == Some('\n') => {
                    self.bump();
                    self.bump();
                }
                _ => break,
            }
        }
    }

    fn skip_comment(&mut self) {
        if self.peek() == Some('#') {
            while let Some(c) = self.peek() {
                if c == '\n' {
                    break;
                }
                self.bump();
            }
        }
    }

    /// Skip blanks, comments and newlines; with `semicolons`, also `;` and `&`
    fn skip_separators(&mut self, semicolons: bool) {
        loop {
            self.skip_blanks();
            self.skip_comment();
            match self.peek() {
                Some('\n') => {
                    self.bump();
                }
                Some(';') if semicolons && self.peek_at(1) != Some(';') => {
                    self.bump();
                }
                Some('&') if semicolons && !matches!(self.peek_at(1), Some('&' | '>')) => {
                    self.bump();
                }
                _ => break,
            }
        }
    }

    fn parse_list(&mut self, terminators: &[&str]) -> Result<Vec<AndOr>, SandboxError> {
        let mut list = Vec::new();
        loop {
            self.skip_separators(true);
            if self.peek().is_none() {
                if terminators.is_empty() {
                    return Ok(list);
                }
                return Err(self.error(format!(
                    "unexpected end of file, expected `{}`",
                    terminators.join("` or `")
                )));
            }
            let at_terminator = terminators.iter().any(|t| {
                if *t == ";;" {
                    self.starts_with(";;")
                } else {
                    self.at_keyword(t)
                }
            });
            if at_terminator {
                return Ok(list);
            }
            list.push(self.parse_and_or()?);
        }
    }

    fn parse_and_or(&mut self) -> Result<AndOr, SandboxError> {
        let first = self.parse_pipeline()?;
        let mut rest = Vec::new();
        loop {
            self.skip_blanks();
            let and = if self.eat("&&") {
                true
            } else if self.eat("||") {
                false
            } else {
                break;
            };
            self.skip_separators(false);
            rest.push((and, self.parse_pipeline()?));
        }
        Ok(AndOr { first, rest })
    }

    fn parse_pipeline(&mut self) -> Result<Pipeline, SandboxError> {
        self.skip_blanks();
        let negated = self.at_keyword("!");
        if negated {
            self.bump();
        }
        let mut commands = vec![self.parse_command()?];
        loop {
            self.skip_blanks();
            if self.peek() == Some('|') && self.peek_at(1) != Some('|') {
                self.bump();
                self.eat("&");
                self.skip_separators(false);
                commands.push(self.parse_command()?);
            } else {
                break;
            }
        }
        Ok(Pipeline { negated, commands })
    }

    fn parse_command(&mut self) -> Result<Command, SandboxError> {
        self.nested(Self::parse_nested_command)
    }

    fn parse_nested_command(&mut self) -> Result<Command, SandboxError> {
        self.skip_blanks();
        if let Some(closer) = CLOSERS.iter().find(|c| self.at_keyword(c)) {
            return Err(self.error(format!("unexpected `{closer}`")));
        }
        for keyword in ["while", "until", "select", "coproc"] {
            if self.at_keyword(keyword) {
                return Err(self.unsupported(&format!("`{keyword}` loop")));
            }
        }

        let command = if self.at_keyword("if") {
            self.parse_if()?
        } else if self.at_keyword("for") {
            self.parse_for()?
        } else if self.at_keyword("case") {
            self.parse_case()?
        } else if self.at_keyword("function") {
            self.parse_function_keyword()?
        } else if self.at_keyword("{") {
            self.bump();
            let body = self.parse_list(&["}"])?;
            self.expect_keyword("}")?;
            Command::Group(body)
        } else if self.at_keyword("[[") {
            self.parse_test()?
        } else if self.starts_with("((") {
            return Err(self.unsupported("arithmetic command"));
        } else if self.peek() == Some('(') {
            return Err(self.unsupported("subshell"));
        } else {
            return self.parse_simple();
        };

        self.skip_redirections()?;
        Ok(command)
    }

    fn parse_if(&mut self) -> Result<Command, SandboxError> {
        self.expect_keyword("if")?;
        let mut branches = Vec::new();
        let mut otherwise = None;
        loop {
            let condition = self.parse_list(&["then"])?;
            self.expect_keyword("then")?;
            let body = self.parse_list(&["elif", "else", "fi"])?;
            branches.push((condition, body));
            if self.at_keyword("elif") {
                self.expect_keyword("elif")?;
                continue;
            }
            if self.at_keyword("else") {
                self.expect_keyword("else")?;
                otherwise = Some(self.parse_list(&["fi"])?);
            }
            self.expect_keyword("fi")?;
            return Ok(Command::If {
                branches,
                otherwise,
            });
        }
    }

    fn parse_for(&mut self) -> Result<Command, SandboxError> {
        self.expect_keyword("for")?;
        self.skip_blanks();
        if self.starts_with("((") {
            return Err(self.unsupported("arithmetic `for` loop"));
        }
        let var = self
            .parse_name()
            .ok_or_else(|| self.error("expected loop variable"))?;
        self.skip_separators(false);

        let items = if self.at_keyword("in") {
            self.eat("in");
            let mut items = Vec::new();
            loop {
                self.skip_blanks();
                match self.peek() {
                    None | Some('\n' | ';') => break,
                    Some('#') => {
                        self.skip_comment();
                        break;
                    }
                    _ => items.push(self.parse_word()?),
                }
            }
            Some(items)
        } else {
            None
        };

        self.skip_separators(true);
        self.expect_keyword("do")?;
        let body = self.parse_list(&["done"])?;
        self.expect_keyword("done")?;
        Ok(Command::For { var, items, body })
    }

    fn parse_case(&mut self) -> Result<Command, SandboxError> {
        self.expect_keyword("case")?;
        self.skip_blanks();
        let subject = self.parse_word()?;
        self.skip_separators(false);
        self.expect_keyword("in")?;

        let mut arms = Vec::new();
        loop {
            self.skip_separators(false);
            if self.at_keyword("esac") {
                break;
            }
            if self.peek().is_none() {
                return Err(self.error("unexpected end of file, expected `esac`"));
            }
            self.eat("(");
            let mut patterns = Vec::new();
            loop {
                self.skip_blanks();
                patterns.push(self.parse_word()?);
                self.skip_blanks();
                if self.eat("|") {
                    continue;
                }
                if self.eat(")") {
                    break;
                }
                return Err(self.error("expected `)` after case pattern"));
            }
            let body = self.parse_list(&[";;", "esac"])?;
            if !self.eat(";;&") && !self.eat(";;") {
                self.eat(";&");
            }
            arms.push(CaseArm { patterns, body });
        }

        self.expect_keyword("esac")?;
        Ok(Command::Case { subject, arms })
    }

    fn parse_function_keyword(&mut self) -> Result<Command, SandboxError> {
        let line = self.line;
        self.expect_keyword("function")?;
        self.skip_blanks();
        let name = self.parse_function_name()?;
        self.skip_blanks();
        if self.eat("(") {
            self.skip_blanks();
            if !self.eat(")") {
                return Err(self.error("expected `)` in function definition"));
            }
        }
        self.parse_function_body(name, line)
    }

    fn parse_function_name(&mut self) -> Result<String, SandboxError> {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if is_word_end(c) || matches!(c, '$' | '\'' | '"' | '`') {
                break;
            }
            name.push(c);
            self.bump();
        }
        if name.is_empty() {
            return Err(self.error("expected function name"));
        }
        Ok(name)
    }

    fn parse_function_body(&mut self, name: String, line: u32) -> Result<Command, SandboxError> {
        self.skip_separators(false);
        let body = self.parse_command()?;
        if matches!(body, Command::Simple { .. } | Command::Declare { .. }) {
            return Err(SandboxError::Parse {
                line,
                message: format!("function `{name}` needs a compound body"),
            });
        }
        Ok(Command::FuncDef {
            name,
            body: Rc::new(body),
            line,
        })
    }

    fn parse_test(&mut self) -> Result<Command, SandboxError> {
        self.expect_keyword("[[")?;
        let mut tokens = Vec::new();
        loop {
            self.skip_blanks();
            if self.at_keyword("]]") {
                self.eat("]]");
                return Ok(Command::Test(tokens));
            }
            match self.peek() {
                None | Some('\n') => return Err(self.error("expected `]]`")),
                Some(c @ ('(' | ')' | '<' | '>')) => {
                    self.bump();
                    tokens.push(TestToken::Op(c.to_string()));
                }
                _ if self.starts_with("&&") || self.starts_with("||") => {
                    let op: String = [self.bump(), self.bump()].into_iter().flatten().collect();
                    tokens.push(TestToken::Op(op));
                }
                _ => tokens.push(TestToken::Word(self.parse_word()?)),
            }
        }
    }

    fn parse_simple(&mut self) -> Result<Command, SandboxError> {
        let line = self.line;
        let mut assigns = Vec::new();
        let mut words: Vec<Word> = Vec::new();

        loop {
            self.skip_blanks();
            match self.peek() {
                None | Some('\n' | ';' | '|' | ')') => break,
                Some('&') if self.peek_at(1) != Some('>') => break,
                Some('#') => {
                    self.skip_comment();
                    break;
                }
                Some('(') => {
                    let name = match words.as_slice() {
                        [only] if assigns.is_empty() && is_bare_literal(only) => literal(only),
                        _ => None,
                    };
                    let Some(name) = name else {
                        return Err(self.unexpected());
                    };
                    self.bump();
                    self.skip_blanks();
                    if !self.eat(")") {
                        return Err(self.error("expected `)` in function definition"));
                    }
                    return self.parse_function_body(name, line);
                }
                Some('<' | '>' | '&') => {
                    self.skip_redirection()?;
                    continue;
                }
                _ => {}
            }

            if self.at_fd_redirection() {
                self.skip_redirection()?;
                continue;
            }
            if words.is_empty() {
                if let Some(assign) = self.try_parse_assign()? {
                    assigns.push(assign);
                    continue;
                }
            }

            let word = self.parse_word()?;
            if words.is_empty() && is_bare_literal(&word) {
                if let Some(builtin) = literal(&word) {
                    if DECLARATION_BUILTINS.contains(&builtin.as_str()) {
                        return self.parse_declaration(builtin);
                    }
                }
            }
            words.push(word);
        }

        if assigns.is_empty() && words.is_empty() {
            return Err(self.unexpected());
        }
        Ok(Command::Simple { assigns, words })
    }

    fn parse_declaration(&mut self, builtin: String) -> Result<Command, SandboxError> {
        let mut args = Vec::new();
        loop {
            self.skip_blanks();
            match self.peek() {
                None | Some('\n' | ';' | '&' | '|' | ')') => break,
                Some('#') => {
                    self.skip_comment();
                    break;
                }
                Some('<' | '>') => {
                    self.skip_redirection()?;
                    continue;
                }
                _ => {}
            }
            if let Some(assign) = self.try_parse_assign()? {
                args.push(DeclArg::Assign(assign));
                continue;
            }
            let word = self.parse_word()?;
            match literal(&word) {
                Some(flag) if flag.starts_with('-') || flag.starts_with('+') => {
                    args.push(DeclArg::Flag(flag))
                }
                _ => args.push(DeclArg::Name(word)),
            }
        }
        Ok(Command::Declare { builtin, args })
    }

    fn parse_name(&mut self) -> Option<String> {
        if !self.peek().map_or(false, is_name_start) {
            return None;
        }
        let mut name = String::new();
        while let Some(c) = self.peek().filter(|c| is_name_char(*c)) {
            name.push(c);
            self.bump();
        }
        Some(name)
    }

    fn try_parse_assign(&mut self) -> Result<Option<Assign>, SandboxError> {
        let (start, line) = (self.pos, self.line);
        let Some(name) = self.parse_name() else {
            return Ok(None);
        };

        let index = if self.peek() == Some('[') {
            self.bump();
            let word = self.parse_word_until(&|c| c == ']' || is_word_end(c))?;
            if !self.eat("]") {
                self.rewind(start, line);
                return Ok(None);
            }
            Some(word)
        } else {
            None
        };

        let append = self.eat("+=");
        if !append && !self.eat("=") {
            self.rewind(start, line);
            return Ok(None);
        }

        let value = if self.peek() == Some('(') {
            self.bump();
            AssignValue::Array(self.parse_array_elems()?)
        } else {
            AssignValue::Scalar(self.parse_word_until(&is_word_end)?)
        };

        Ok(Some(Assign {
            name,
            index,
            append,
            value,
            line,
        }))
    }

    fn parse_array_elems(&mut self) -> Result<Vec<ArrayElem>, SandboxError> {
        let line = self.line;
        let mut elems = Vec::new();
        loop {
            self.skip_separators(false);
            match self.peek() {
                None => {
                    return Err(SandboxError::Parse {
                        line,
                        message: "unterminated array literal".into(),
                    })
                }
                Some(')') => {
                    self.bump();
                    return Ok(elems);
                }
                Some('[') => {
                    let (start, start_line) = (self.pos, self.line);
                    self.bump();
                    let key = self.parse_word_until(&|c| c == ']')?;
                    if self.eat("]=") {
                        let value = self.parse_word_until(&is_word_end)?;
                        elems.push(ArrayElem {
                            key: Some(key),
                            value,
                        });
                        continue;
                    }
                    self.rewind(start, start_line);
                }
                _ => {}
            }
            elems.push(ArrayElem {
                key: None,
                value: self.parse_word()?,
            });
        }
    }

    fn at_fd_redirection(&self) -> bool {
        let mut i = 0;
        while self.peek_at(i).map_or(false, |c| c.is_ascii_digit()) {
            i += 1;
        }
        i > 0 && matches!(self.peek_at(i), Some('<' | '>'))
    }

    /// Redirections are parsed and dropped; the sandbox never opens files
    fn skip_redirection(&mut self) -> Result<(), SandboxError> {
        while self.peek().map_or(false, |c| c.is_ascii_digit()) {
            self.bump();
        }
        if self.starts_with("<<") {
            return Err(self.unsupported("here-document"));
        }
        if self.starts_with("<(") || self.starts_with(">(") {
            return Err(self.unsupported("process substitution"));
        }
        let mut consumed = 0;
        while consumed < 3 && matches!(self.peek(), Some('<' | '>' | '&' | '|')) {
            self.bump();
            consumed += 1;
        }
        self.skip_blanks();
        self.parse_word()?;
        Ok(())
    }

    fn skip_redirections(&mut self) -> Result<(), SandboxError> {
        loop {
            self.skip_blanks();
            let at_redirection = matches!(self.peek(), Some('<' | '>'))
                || (self.peek() == Some('&') && self.peek_at(1) == Some('>'))
                || self.at_fd_redirection();
            if !at_redirection {
                return Ok(());
            }
            self.skip_redirection()?;
        }
    }

    fn parse_word(&mut self) -> Result<Word, SandboxError> {
        let word = self.parse_word_until(&is_word_end)?;
        if word.is_empty() {
            return Err(self.unexpected());
        }
        Ok(word)
    }

    fn parse_word_until(&mut self, stop: &dyn Fn(char) -> bool) -> Result<Word, SandboxError> {
        self.nested(|parser| parser.parse_word_parts(stop))
    }

    fn parse_word_parts(&mut self, stop: &dyn Fn(char) -> bool) -> Result<Word, SandboxError> {
        let mut parts = Vec::new();
        let mut lit = String::new();
        while let Some(c) = self.peek() {
            if stop(c) {
                break;
            }
            match c {
                '\'' => {
                    flush(&mut lit, &mut parts);
                    parts.push(WordPart::Quoted(self.parse_single_quoted()?));
                }
                '"' => {
                    flush(&mut lit, &mut parts);
                    parts.push(WordPart::Double(self.parse_double_quoted()?));
                }
                '$' => {
                    flush(&mut lit, &mut parts);
                    parts.push(self.parse_dollar()?);
                }
                '`' => {
                    flush(&mut lit, &mut parts);
                    self.skip_backticks()?;
                    parts.push(WordPart::CmdSubst);
                }
                '\\' => {
                    self.bump();
                    match self.bump() {
                        Some('\n') => {}
                        Some(escaped) => {
                            flush(&mut lit, &mut parts);
                            parts.push(WordPart::Quoted(escaped.to_string()));
                        }
                        None => lit.push('\\'),
                    }
                }
                _ => {
                    lit.push(c);
                    self.bump();
                }
            }
        }
        flush(&mut lit, &mut parts);
        Ok(parts)
    }

    fn parse_single_quoted(&mut self) -> Result<String, SandboxError> {
        let line = self.line;
        self.bump();
        let mut text = String::new();
        loop {
            match self.bump() {
                Some('\'') => return Ok(text),
                Some(c) => text.push(c),
                None => {
                    return Err(SandboxError::Parse {
                        line,
                        message: "unterminated single quote".into(),
                    })
                }
            }
        }
    }

    fn parse_double_quoted(&mut self) -> Result<Vec<WordPart>, SandboxError> {
        let line = self.line;
        self.bump();
        let mut parts = Vec::new();
        let mut lit = String::new();
        loop {
            match self.peek() {
                None => {
                    return Err(SandboxError::Parse {
                        line,
                        message: "unterminated double quote".into(),
                    })
                }
                Some('"') => {
                    self.bump();
                    break;
                }
                Some('\\') => {
                    self.bump();
                    match self.bump() {
                        Some('\n') | None => {}
                        Some(c @ ('$' | '`' | '"' | '\\')) => lit.push(c),
                        Some(c) => {
                            lit.push('\\');
                            lit.push(c);
                        }
                    }
                }
                Some('$') => {
                    flush(&mut lit, &mut parts);
                    parts.push(self.parse_dollar()?);
                }
                Some('`') => {
                    flush(&mut lit, &mut parts);
                    self.skip_backticks()?;
                    parts.push(WordPart::CmdSubst);
                }
                Some(c) => {
                    lit.push(c);
                    self.bump();
                }
            }
        }
        flush(&mut lit, &mut parts);
        Ok(parts)
    }

    fn parse_dollar(&mut self) -> Result<WordPart, SandboxError> {
        self.bump();
        match self.peek() {
            Some('(') if self.peek_at(1) == Some('(') => Err(self.unsupported("arithmetic expansion")),
            Some('(') => {
                self.skip_command_substitution()?;
                Ok(WordPart::CmdSubst)
            }
            Some('{') => {
                self.bump();
                self.parse_braced_param()
            }
            Some(c) if is_name_start(c) => {
                let name = self.parse_name().unwrap_or_default();
                Ok(WordPart::Param(Box::new(ParamExp::plain(name))))
            }
            Some(c @ ('@' | '*' | '#' | '?' | '$' | '!' | '-' | '0'..='9')) => {
                self.bump();
                Ok(WordPart::Param(Box::new(ParamExp::plain(c.to_string()))))
            }
            _ => Ok(WordPart::Lit("$".into())),
        }
    }

    fn parse_braced_param(&mut self) -> Result<WordPart, SandboxError> {
        let length = self.peek() == Some('#') && self.peek_at(1).map_or(false, |c| c != '}');
        if length {
            self.bump();
        }

        let name = match self.peek() {
            Some(c) if is_name_start(c) => self.parse_name().unwrap_or_default(),
            Some(c @ ('@' | '*' | '#' | '?' | '0'..='9')) => {
                self.bump();
                c.to_string()
            }
            _ => return Err(self.error("bad substitution")),
        };

        let index = if self.eat("[") {
            if self.eat("@]") {
                Some(Subscript::All)
            } else if self.eat("*]") {
                Some(Subscript::Joined)
            } else {
                let key = self.parse_word_until(&|c| c == ']')?;
                if !self.eat("]") {
                    return Err(self.error("bad substitution"));
                }
                Some(Subscript::Key(key))
            }
        } else {
            None
        };

        let op = if length { None } else { self.parse_param_op()? };
        if !self.eat("}") {
            return Err(self.error("bad substitution"));
        }
        Ok(WordPart::Param(Box::new(ParamExp {
            name,
            index,
            length,
            op,
        })))
    }

    fn parse_param_op(&mut self) -> Result<Option<ParamOp>, SandboxError> {
        let close = |c: char| c == '}';
        let op = if self.eat(":-") {
            ParamOp::Default {
                colon: true,
                word: self.parse_word_until(&close)?,
            }
        } else if self.eat(":=") {
            ParamOp::Assign {
                colon: true,
                word: self.parse_word_until(&close)?,
            }
        } else if self.eat(":+") {
            ParamOp::Alternate {
                colon: true,
                word: self.parse_word_until(&close)?,
            }
        } else if self.starts_with(":?") || self.starts_with("?") {
            return Err(self.unsupported("`${name:?message}` expansion"));
        } else if self.starts_with(":") {
            return Err(self.unsupported("substring expansion"));
        } else if self.eat("-") {
            ParamOp::Default {
                colon: false,
                word: self.parse_word_until(&close)?,
            }
        } else if self.eat("=") {
            ParamOp::Assign {
                colon: false,
                word: self.parse_word_until(&close)?,
            }
        } else if self.eat("+") {
            ParamOp::Alternate {
                colon: false,
                word: self.parse_word_until(&close)?,
            }
        } else if self.starts_with("#") || self.starts_with("%") {
            let prefix = self.peek() == Some('#');
            let longest = self.eat("##") || self.eat("%%");
            if !longest {
                self.bump();
            }
            let pattern = self.parse_word_until(&close)?;
            if prefix {
                ParamOp::TrimPrefix { longest, pattern }
            } else {
                ParamOp::TrimSuffix { longest, pattern }
            }
        } else if self.starts_with("/") {
            let all = self.eat("//");
            if !all {
                self.bump();
            }
            let pattern = self.parse_word_until(&|c| c == '/' || c == '}')?;
            let replacement = if self.eat("/") {
                self.parse_word_until(&close)?
            } else {
                Vec::new()
            };
            ParamOp::Replace {
                all,
                pattern,
                replacement,
            }
        } else if self.eat("^^") {
            ParamOp::Upper
        } else if self.eat(",,") {
            ParamOp::Lower
        } else if self.peek() == Some('}') {
            return Ok(None);
        } else {
            return Err(self.error("bad substitution"));
        };
        Ok(Some(op))
    }

    fn skip_command_substitution(&mut self) -> Result<(), SandboxError> {
        let line = self.line;
        let mut depth = 0usize;
        while let Some(c) = self.bump() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                '\\' => {
                    self.bump();
                }
                '\'' => {
                    while !matches!(self.bump(), Some('\'') | None) {}
                }
                '"' => loop {
                    match self.bump() {
                        Some('"') | None => break,
                        Some('\\') => {
                            self.bump();
                        }
                        Some(_) => {}
                    }
                },
                _ => {}
            }
        }
        Err(SandboxError::Parse {
            line,
            message: "unterminated command substitution".into(),
        })
    }

    fn skip_backticks(&mut self) -> Result<(), SandboxError> {
        let line = self.line;
        self.bump();
        loop {
            match self.bump() {
                Some('`') => return Ok(()),
                Some('\\') => {
                    self.bump();
                }
                Some(_) => {}
                None => {
                    return Err(SandboxError::Parse {
                        line,
                        message: "unterminated backquote".into(),
                    })
                }
            }
        }
    }
}
