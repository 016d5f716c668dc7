use thiserror::Error;

/// A configured CIDR token that cannot be turned into a rule.
///
/// Always fatal at startup: a rule set with a silently dropped entry would be
/// weaker than the one the operator wrote.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("invalid prefix length in rule '{rule}'")]
    InvalidPrefix { rule: String },
    #[error("invalid IP address in rule '{rule}'")]
    InvalidAddress { rule: String },
}

/// Per-request problems. Each one rejects the request it came from and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("malformed forwarded URL '{url}': {source}")]
    MalformedTargetUrl {
        url: String,
        #[source]
        source: TargetUrlFault,
    },
}

/// Why a forwarded URL was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TargetUrlFault {
    #[error("illegal character {character:?} at index {index}")]
    IllegalCharacter { character: char, index: usize },
    #[error("invalid percent-escape at index {index}")]
    InvalidEscape { index: usize },
    #[error(transparent)]
    Parse(#[from] url::ParseError),
}
