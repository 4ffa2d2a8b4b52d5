//! Node-name expressions.
//!
//! An expression is a comma separated list of patterns. A pattern is a
//! sequence of literal parts and bracket expressions, e.g. `n[0-3,7]` or
//! `rack[1-2]n[00-15]`. A bracket expression holds inclusive ranges that are
//! either decimal (leading zeros set the field width), single letters
//! (`[a-d]`) or fixed-width base-36 (`[0A-1F]`).
use chumsky::Parser;
use chumsky::error::{Simple, SimpleReason};
use chumsky::primitive::{end, filter, just};
use thiserror::Error;

pub const MAX_HOSTLIST_SIZE: usize = 1 << 20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostlistError {
    #[error("{0}")]
    Syntax(String),
    #[error("expression expands to more than {MAX_HOSTLIST_SIZE} names")]
    TooLarge,
}

type ParseError = Simple<char>;

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Ranges(Vec<HostRange>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostRange {
    Decimal { start: u64, end: u64, width: usize },
    Letters { start: char, end: char },
    Base36 { start: u64, end: u64, width: usize },
}

impl HostRange {
    fn parse(start: &str, end: Option<&str>) -> Result<HostRange, String> {
        let end = end.unwrap_or(start);
        let range = if is_decimal(start) && is_decimal(end) {
            let width = if start.len() > 1 && start.starts_with('0') {
                start.len()
            } else {
                0
            };
            HostRange::Decimal {
                start: start.parse().map_err(|_| format!("number `{start}` is too large"))?,
                end: end.parse().map_err(|_| format!("number `{end}` is too large"))?,
                width,
            }
        } else if let (Some(s), Some(e)) = (single_letter(start), single_letter(end)) {
            if s.is_ascii_uppercase() != e.is_ascii_uppercase() {
                return Err(format!("letters `{s}` and `{e}` differ in case"));
            }
            HostRange::Letters { start: s, end: e }
        } else if start.len() == end.len() && is_base36(start) && is_base36(end) {
            HostRange::Base36 {
                start: u64::from_str_radix(start, 36)
                    .map_err(|_| format!("value `{start}` is too large"))?,
                end: u64::from_str_radix(end, 36).map_err(|_| format!("value `{end}` is too large"))?,
                width: start.len(),
            }
        } else {
            return Err(format!("invalid range `{start}-{end}`"));
        };
        if range.is_reversed() {
            return Err(format!("range start `{start}` exceeds end `{end}`"));
        }
        Ok(range)
    }

    fn is_reversed(&self) -> bool {
        match self {
            HostRange::Decimal { start, end, .. } | HostRange::Base36 { start, end, .. } => {
                start > end
            }
            HostRange::Letters { start, end } => start > end,
        }
    }

    /// Number of values in the range, `None` when it does not fit into `u64`.
    fn len(&self) -> Option<u64> {
        match *self {
            HostRange::Decimal { start, end, .. } | HostRange::Base36 { start, end, .. } => {
                end.checked_sub(start)?.checked_add(1)
            }
            HostRange::Letters { start, end } => {
                (end as u64).checked_sub(start as u64)?.checked_add(1)
            }
        }
    }

    fn values(&self) -> Vec<String> {
        match *self {
            HostRange::Decimal { start, end, width } => {
                (start..=end).map(|v| format!("{v:0width$}")).collect()
            }
            HostRange::Letters { start, end } => (start..=end).map(|c| c.to_string()).collect(),
            HostRange::Base36 { start, end, width } => {
                (start..=end).map(|v| to_base36(v, width)).collect()
            }
        }
    }
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_base36(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
}

fn single_letter(s: &str) -> Option<char> {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Some(c),
        _ => None,
    }
}

fn to_base36(mut value: u64, width: usize) -> String {
    const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut out = Vec::new();
    loop {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
        if value == 0 {
            break;
        }
    }
    while out.len() < width {
        out.push(b'0');
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn literal() -> impl Parser<char, String, Error = ParseError> {
    filter(|c: &char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .repeated()
        .at_least(1)
        .collect::<String>()
        .labelled("name")
}

fn bound() -> impl Parser<char, String, Error = ParseError> {
    filter(|c: &char| c.is_ascii_alphanumeric())
        .repeated()
        .at_least(1)
        .collect::<String>()
        .labelled("range bound")
}

fn range() -> impl Parser<char, HostRange, Error = ParseError> {
    bound()
        .then(just('-').ignore_then(bound()).or_not())
        .try_map(|(start, end), span| {
            HostRange::parse(&start, end.as_deref()).map_err(|msg| Simple::custom(span, msg))
        })
}

fn brackets() -> impl Parser<char, Vec<HostRange>, Error = ParseError> {
    range()
        .separated_by(just(','))
        .at_least(1)
        .delimited_by(just('['), just(']'))
}

fn pattern() -> impl Parser<char, Vec<Segment>, Error = ParseError> {
    literal()
        .map(Segment::Literal)
        .or(brackets().map(Segment::Ranges))
        .repeated()
        .at_least(1)
}

fn hostlist() -> impl Parser<char, Vec<Vec<Segment>>, Error = ParseError> {
    pattern().separated_by(just(',')).at_least(1).then_ignore(end())
}

fn describe_errors(input: &str, errors: &[ParseError]) -> String {
    let Some(error) = errors.first() else {
        return format!("cannot parse `{input}`");
    };
    let at = error.span().start;
    match error.reason() {
        SimpleReason::Custom(msg) => format!("{msg} at position {at} in `{input}`"),
        _ => match error.found() {
            Some(c) => format!("unexpected character `{c}` at position {at} in `{input}`"),
            None => format!("unexpected end of input in `{input}`"),
        },
    }
}

/// Expands a node-name expression into names, in the order they are written.
pub fn expand_hostlist(expr: &str) -> Result<Vec<String>, HostlistError> {
    let expr = expr.trim();
    let patterns = hostlist()
        .parse(expr)
        .map_err(|errors| HostlistError::Syntax(describe_errors(expr, &errors)))?;

    let mut names = Vec::new();
    for segments in patterns {
        let mut current = vec![String::new()];
        for segment in segments {
            match segment {
                Segment::Literal(text) => current.iter_mut().for_each(|name| name.push_str(&text)),
                Segment::Ranges(ranges) => {
                    let total = ranges
                        .iter()
                        .try_fold(0u64, |acc, r| acc.checked_add(r.len()?))
                        .and_then(|count| count.checked_mul(current.len() as u64))
                        .and_then(|total| total.checked_add(names.len() as u64));
                    if total.is_none_or(|total| total > MAX_HOSTLIST_SIZE as u64) {
                        return Err(HostlistError::TooLarge);
                    }
                    let values: Vec<String> = ranges.iter().flat_map(|r| r.values()).collect();
                    current = current
                        .iter()
                        .flat_map(|prefix| values.iter().map(move |v| format!("{prefix}{v}")))
                        .collect();
                }
            }
        }
        names.extend(current);
    }
    Ok(names)
}

struct NameGroup {
    prefix: String,
    // Some(w) when numbers are zero padded to `w` digits
    width: Option<usize>,
    numbers: Vec<u64>,
}

impl NameGroup {
    fn accepts(&self, prefix: &str, digits: &str) -> bool {
        if self.prefix != prefix {
            return false;
        }
        match self.width {
            Some(width) => digits.len() == width,
            None => !has_leading_zero(digits),
        }
    }

    fn format_number(&self, value: u64) -> String {
        match self.width {
            Some(width) => format!("{value:0width$}"),
            None => value.to_string(),
        }
    }

    fn render(&self, out: &mut Vec<String>) {
        if let [single] = self.numbers.as_slice() {
            out.push(format!("{}{}", self.prefix, self.format_number(*single)));
            return;
        }
        let mut runs: Vec<(u64, u64)> = Vec::new();
        for &n in &self.numbers {
            match runs.last_mut() {
                Some((_, end)) if end.checked_add(1) == Some(n) => *end = n,
                _ => runs.push((n, n)),
            }
        }
        let ranges = runs
            .iter()
            .map(|&(start, end)| {
                if start == end {
                    self.format_number(start)
                } else {
                    format!("{}-{}", self.format_number(start), self.format_number(end))
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        out.push(format!("{}[{}]", self.prefix, ranges));
    }
}

fn has_leading_zero(digits: &str) -> bool {
    digits.len() > 1 && digits.starts_with('0')
}

fn split_numeric_suffix(name: &str) -> Option<(&str, &str)> {
    let split = name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    (split < name.len()).then(|| name.split_at(split))
}

/// Compresses names into an expression that [`expand_hostlist`] turns back
/// into the same sequence. Consecutive names sharing a prefix are merged.
pub fn compress_hostlist<I, S>(names: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Vec::new();
    let mut group: Option<NameGroup> = None;
    for name in names {
        let name = name.as_ref();
        let parsed = split_numeric_suffix(name)
            .and_then(|(prefix, digits)| digits.parse::<u64>().ok().map(|n| (prefix, digits, n)));
        let Some((prefix, digits, number)) = parsed else {
            if let Some(g) = group.take() {
                g.render(&mut out);
            }
            out.push(name.to_string());
            continue;
        };
        match group.as_mut() {
            Some(g) if g.accepts(prefix, digits) => g.numbers.push(number),
            _ => {
                if let Some(g) = group.take() {
                    g.render(&mut out);
                }
                group = Some(NameGroup {
                    prefix: prefix.to_string(),
                    width: has_leading_zero(digits).then_some(digits.len()),
                    numbers: vec![number],
                });
            }
        }
    }
    if let Some(g) = group {
        g.render(&mut out);
    }
    out.join(",")
}
