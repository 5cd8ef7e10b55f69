use crate::candidates::{Candidate, CandidateSet};
use crate::domain_utils::DomainUtils;
use crate::error::{MxblError, Result};
use crate::pattern::PatternType;
use ipnetwork::IpNetwork;
use regex::{Regex, RegexBuilder};
use std::net::IpAddr;

/// An executable pattern.
///
/// Compilation is pure: the same text and dialect always produce a matcher
/// that accepts the same candidates.
#[derive(Debug, Clone)]
pub struct Matcher {
    kind: PatternType,
    source: String,
    rule: Rule,
}

#[derive(Debug, Clone)]
enum Rule {
    Domain(String),
    Ip(IpAddr),
    Cidr(IpNetwork),
    Glob(Regex),
    Regex(Regex),
}

impl Matcher {
    pub fn compile(text: &str, kind: PatternType) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(MxblError::invalid_pattern(text, "empty pattern"));
        }

        let (source, rule) = match kind {
            PatternType::Domain => {
                let name = DomainUtils::normalize_host(text);
                if name.is_empty() {
                    return Err(MxblError::invalid_pattern(text, "empty domain"));
                }
                (name.clone(), Rule::Domain(name))
            }
            PatternType::Ip => {
                let addr = DomainUtils::parse_address(text)
                    .ok_or_else(|| MxblError::invalid_pattern(text, "not an IP address"))?;
                (addr.to_string(), Rule::Ip(addr))
            }
            PatternType::Cidr => {
                let network = parse_cidr(text)?;
                (network.to_string(), Rule::Cidr(network))
            }
            PatternType::Glob => {
                let glob = text.to_lowercase();
                let regex = build_regex(&glob_to_regex(&glob), text)?;
                (glob, Rule::Glob(regex))
            }
            PatternType::Regex => {
                let regex = build_regex(text, text)?;
                (text.to_string(), Rule::Regex(regex))
            }
        };

        Ok(Matcher { kind, source, rule })
    }

    pub fn kind(&self) -> PatternType {
        self.kind
    }

    /// Normalized pattern text
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, candidate: &Candidate) -> bool {
        match &self.rule {
            Rule::Domain(name) => DomainUtils::normalize_host(candidate.value()) == *name,
            Rule::Ip(addr) => candidate.address() == Some(*addr),
            Rule::Cidr(network) => candidate
                .address()
                .map(|addr| network.contains(addr))
                .unwrap_or(false),
            Rule::Glob(regex) | Rule::Regex(regex) => regex.is_match(candidate.value()),
        }
    }

    pub fn matches_str(&self, value: &str) -> bool {
        self.matches(&Candidate::new(value))
    }

    /// First candidate, in set order, accepted by this matcher
    pub fn first_match<'a>(&self, candidates: &'a CandidateSet) -> Option<&'a Candidate> {
        candidates.iter().find(|candidate| self.probes(candidate) && self.matches(candidate))
    }

    /// Cheap shape filter: address rules only look at addresses, domain rules
    /// only at names. Globs and regexes see everything.
    fn probes(&self, candidate: &Candidate) -> bool {
        match self.rule {
            Rule::Ip(_) | Rule::Cidr(_) => candidate.is_address(),
            Rule::Domain(_) => !candidate.is_address() || DomainUtils::is_address(&self.source),
            Rule::Glob(_) | Rule::Regex(_) => true,
        }
    }
}

fn parse_cidr(text: &str) -> Result<IpNetwork> {
    let (addr, prefix) = text
        .split_once('/')
        .ok_or_else(|| MxblError::invalid_pattern(text, "expected address/prefix"))?;
    let addr: IpAddr = addr
        .trim()
        .parse()
        .map_err(|_| MxblError::invalid_pattern(text, "invalid network address"))?;
    let prefix: u8 = prefix
        .trim()
        .parse()
        .map_err(|_| MxblError::invalid_pattern(text, "invalid prefix length"))?;
    IpNetwork::new(addr, prefix).map_err(|e| MxblError::invalid_pattern(text, e))
}

fn build_regex(expression: &str, original: &str) -> Result<Regex> {
    RegexBuilder::new(expression)
        .case_insensitive(true)
        .build()
        .map_err(|e| MxblError::invalid_pattern(original, e))
}

/// Translate a shell wildcard into an anchored regular expression.
///
/// `*` and `?` match any run / any single character (dots included), and
/// `[...]` is a character class where a leading `!` negates. An unterminated
/// `[` is taken literally.
fn glob_to_regex(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::from("^(?:");
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        i += 1;
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut j = i;
                if j < chars.len() && chars[j] == '!' {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ']' {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j >= chars.len() {
                    out.push_str("\\[");
                    continue;
                }

                let mut body = &chars[i..j];
                i = j + 1;
                let negate = body.first() == Some(&'!');
                if negate {
                    body = &body[1..];
                }

                let mut class = String::new();
                let mut k = 0;
                while k < body.len() {
                    if k + 2 < body.len() && body[k + 1] == '-' {
                        // Reversed ranges such as z-a are empty and dropped
                        if body[k] <= body[k + 2] {
                            push_class_char(&mut class, body[k]);
                            class.push('-');
                            push_class_char(&mut class, body[k + 2]);
                        }
                        k += 3;
                    } else {
                        push_class_char(&mut class, body[k]);
                        k += 1;
                    }
                }

                if class.is_empty() {
                    // Nothing left: never matches, or matches any one character when negated
                    out.push_str(if negate { "." } else { "\\b\\B" });
                } else {
                    out.push('[');
                    if negate {
                        out.push('^');
                    }
                    out.push_str(&class);
                    out.push(']');
                }
            }
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }

    out.push_str(")$");
    out
}

fn push_class_char(class: &mut String, ch: char) {
    if ch.is_ascii_punctuation() {
        class.push('\\');
    }
    class.push(ch);
}
