//! Subject grammar.
//!
//! Subjects are dot-separated tokens (`fleet.compute.n1.out.msgs`).
//! Subscription patterns may use `*` for exactly one token and a trailing
//! `>` for one or more tokens.

use crate::utils::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Single,
    Tail,
}

/// A parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPattern {
    raw: String,
    tokens: Vec<Token>,
}

impl SubjectPattern {
    pub fn parse(pattern: &str) -> Result<Self, TransportError> {
        if pattern.is_empty() {
            return Err(TransportError::InvalidSubject(pattern.to_string()));
        }
        let parts: Vec<&str> = pattern.split('.').collect();
        let mut tokens = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let token = match *part {
                "" => return Err(TransportError::InvalidSubject(pattern.to_string())),
                "*" => Token::Single,
                ">" if i == parts.len() - 1 => Token::Tail,
                ">" => return Err(TransportError::InvalidSubject(pattern.to_string())),
                literal => Token::Literal(literal.to_string()),
            };
            tokens.push(token);
        }
        Ok(Self {
            raw: pattern.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, subject: &str) -> bool {
        let mut parts = subject.split('.');
        for token in &self.tokens {
            match token {
                Token::Tail => return parts.next().is_some_and(|p| !p.is_empty()),
                Token::Single => match parts.next() {
                    Some(p) if !p.is_empty() => {}
                    _ => return false,
                },
                Token::Literal(lit) => match parts.next() {
                    Some(p) if p == lit => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }
}

/// Validates a concrete publish subject: no wildcards, no empty tokens.
pub fn validate_subject(subject: &str) -> Result<(), TransportError> {
    let valid = !subject.is_empty()
        && subject
            .split('.')
            .all(|t| !t.is_empty() && t != "*" && t != ">");
    if valid {
        Ok(())
    } else {
        Err(TransportError::InvalidSubject(subject.to_string()))
    }
}
