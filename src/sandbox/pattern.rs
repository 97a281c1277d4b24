// SPDX-License-Identifier: AGPL-3.0-or-later

//! Glob patterns as used by `case`, `[[ == ]]` and parameter trimming.
//! A backslash makes the following character literal.

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Char(char),
    Any,
    Star,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                tokens.push(Token::Char(chars[i + 1]));
                i += 2;
                continue;
            }
            '*' => tokens.push(Token::Star),
            '?' => tokens.push(Token::Any),
            '[' => {
                if let Some((class, next)) = parse_class(&chars, i) {
                    tokens.push(class);
                    i = next;
                    continue;
                }
                tokens.push(Token::Char('['));
            }
            c => tokens.push(Token::Char(c)),
        }
        i += 1;
    }
    tokens
}

/// Parse a bracket expression starting at `start`; returns the token and the
/// index after the closing bracket
fn parse_class(chars: &[char], start: usize) -> Option<(Token, usize)> {
    let mut i = start + 1;
    let negated = matches!(chars.get(i), Some('!' | '^'));
    if negated {
        i += 1;
    }
    let mut ranges = Vec::new();
    let mut first = true;
    loop {
        let mut c = *chars.get(i)?;
        if c == ']' && !first {
            return Some((Token::Class { negated, ranges }, i + 1));
        }
        first = false;
        if c == '\\' {
            i += 1;
            c = *chars.get(i)?;
        }
        if chars.get(i + 1) == Some(&'-') && chars.get(i + 2).map_or(false, |e| *e != ']') {
            ranges.push((c, chars[i + 2]));
            i += 3;
        } else {
            ranges.push((c, c));
            i += 1;
        }
    }
}

fn token_matches(token: &Token, c: char) -> bool {
    match token {
        Token::Char(expected) => *expected == c,
        Token::Any => true,
        Token::Star => true,
        Token::Class { negated, ranges } => {
            ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&c)) != *negated
        }
    }
}

/// Pattern matching ran past its work allowance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted;

/// Work allowance for all pattern matching in one evaluation. One unit is
/// one character stepped through the matcher for one pattern token.
#[derive(Debug)]
pub struct Fuel {
    remaining: usize,
}

impl Fuel {
    pub fn new(units: usize) -> Self {
        Self { remaining: units }
    }

    fn burn(&mut self, units: usize) -> Result<(), Exhausted> {
        match self.remaining.checked_sub(units) {
            Some(left) => {
                self.remaining = left;
                Ok(())
            }
            None => {
                self.remaining = 0;
                Err(Exhausted)
            }
        }
    }
}

/// Mark the states reachable without consuming input
fn close(tokens: &[Token], active: &mut [bool]) {
    for t in 0..tokens.len() {
        if active[t] && tokens[t] == Token::Star {
            active[t + 1] = true;
        }
    }
}

/// Every `end` such that `text[start..end]` matches the pattern, ascending.
/// Runs the pattern as a set of states, one pass over the text.
fn match_ends(
    tokens: &[Token],
    text: &[char],
    start: usize,
    fuel: &mut Fuel,
) -> Result<Vec<usize>, Exhausted> {
    let m = tokens.len();
    let mut active = vec![false; m + 1];
    active[0] = true;
    close(tokens, &mut active);

    let mut next = vec![false; m + 1];
    let mut ends = Vec::new();
    let mut pos = start;
    loop {
        if active[m] {
            ends.push(pos);
        }
        if pos == text.len() || !active.contains(&true) {
            return Ok(ends);
        }
        fuel.burn(m + 1)?;

        next.fill(false);
        for (t, token) in tokens.iter().enumerate() {
            if !active[t] {
                continue;
            }
            match token {
                Token::Star => next[t] = true,
                token if token_matches(token, text[pos]) => next[t + 1] = true,
                _ => {}
            }
        }
        close(tokens, &mut next);
        std::mem::swap(&mut active, &mut next);
        pos += 1;
    }
}

/// Whether `text` matches `pattern` in full
pub fn matches(pattern: &str, text: &str, fuel: &mut Fuel) -> Result<bool, Exhausted> {
    let tokens = tokenize(pattern);
    let text: Vec<char> = text.chars().collect();
    Ok(match_ends(&tokens, &text, 0, fuel)?.last() == Some(&text.len()))
}

/// Quote every pattern metacharacter in `text`
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `${var#pattern}` and `${var##pattern}`
pub fn trim_prefix(
    text: &str,
    pattern: &str,
    longest: bool,
    fuel: &mut Fuel,
) -> Result<String, Exhausted> {
    let tokens = tokenize(pattern);
    let chars: Vec<char> = text.chars().collect();
    let ends = match_ends(&tokens, &chars, 0, fuel)?;
    let cut = if longest { ends.last() } else { ends.first() };
    Ok(match cut {
        Some(&cut) => chars[cut..].iter().collect(),
        None => text.to_string(),
    })
}

/// `${var%pattern}` and `${var%%pattern}`; matched as a prefix of the
/// reversed text
pub fn trim_suffix(
    text: &str,
    pattern: &str,
    longest: bool,
    fuel: &mut Fuel,
) -> Result<String, Exhausted> {
    let mut tokens = tokenize(pattern);
    tokens.reverse();
    let reversed: Vec<char> = text.chars().rev().collect();
    let ends = match_ends(&tokens, &reversed, 0, fuel)?;
    let cut = if longest { ends.last() } else { ends.first() };
    Ok(match cut {
        Some(&cut) => reversed[cut..].iter().rev().collect(),
        None => text.to_string(),
    })
}

/// `${var/pattern/replacement}` and `${var//pattern/replacement}`
pub fn replace(
    text: &str,
    pattern: &str,
    replacement: &str,
    all: bool,
    fuel: &mut Fuel,
) -> Result<String, Exhausted> {
    if pattern.is_empty() {
        return Ok(text.to_string());
    }
    let tokens = tokenize(pattern);
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let longest = match_ends(&tokens, &chars, i, fuel)?
            .last()
            .copied()
            .filter(|&end| end > i);
        match longest {
            Some(end) => {
                out.push_str(replacement);
                i = end;
                if !all {
                    out.extend(&chars[i..]);
                    break;
                }
            }
            None => {
                out.push(chars[i]);
                i += 1;
            }
        }
    }
    Ok(out)
}
