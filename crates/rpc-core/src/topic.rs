//! Topic pattern parsing, token substitution, and subscription filter matching.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TopicError {
    #[error("topic pattern `{0}` is empty")]
    Empty(String),
    #[error("topic pattern `{pattern}` is missing token `{token}`")]
    MissingToken { pattern: String, token: String },
    #[error("token `{token}` value `{value}` is not a valid single-level topic segment")]
    InvalidTokenValue { token: String, value: String },
    #[error("topic `{0}` does not match the subscribed filter")]
    NoMatch(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Token(String),
}

/// A `/`-separated pattern containing literal segments and `{token}` placeholders.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, TopicError> {
        if pattern.is_empty() {
            return Err(TopicError::Empty(pattern.to_string()));
        }
        let segments = pattern
            .split('/')
            .map(|segment| {
                if segment.starts_with('{') && segment.ends_with('}') && segment.len() > 2 {
                    Segment::Token(segment[1..segment.len() - 1].to_string())
                } else {
                    Segment::Literal(segment.to_string())
                }
            })
            .collect();
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Substitutes every `{token}` with its value from `tokens`, producing a concrete topic.
    pub fn resolve(&self, tokens: &HashMap<String, String>) -> Result<String, TopicError> {
        let mut out = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(literal) => out.push(literal.clone()),
                Segment::Token(token) => {
                    let value = tokens.get(token).ok_or_else(|| TopicError::MissingToken {
                        pattern: self.raw.clone(),
                        token: token.clone(),
                    })?;
                    if value.is_empty() || value.contains(['/', '+', '#']) {
                        return Err(TopicError::InvalidTokenValue {
                            token: token.clone(),
                            value: value.clone(),
                        });
                    }
                    out.push(value.clone());
                }
            }
        }
        Ok(out.join("/"))
    }

    /// Replaces every occurrence of `{token}` with `value`, leaving any other tokens as
    /// literal placeholders for a later `resolve()`. Used to bind a single well-known token
    /// (the invoker's own client id) before the rest of the pattern's tokens are known.
    pub fn substitute_token(&self, token: &str, value: &str) -> Result<Self, TopicError> {
        if value.is_empty() || value.contains(['/', '+', '#']) {
            return Err(TopicError::InvalidTokenValue {
                token: token.to_string(),
                value: value.to_string(),
            });
        }
        let segments: Vec<Segment> = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Token(name) if name == token => Segment::Literal(value.to_string()),
                other => other.clone(),
            })
            .collect();
        let raw = segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(literal) => literal.clone(),
                Segment::Token(name) => format!("{{{name}}}"),
            })
            .collect::<Vec<_>>()
            .join("/");
        Ok(Self { raw, segments })
    }

    /// Renders this pattern as a subscription filter, replacing every token with `+`.
    pub fn as_filter(&self) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(literal) => literal.clone(),
                Segment::Token(_) => "+".to_string(),
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Wraps a filter in a shared-subscription prefix: `$share/{group}/{filter}`.
    pub fn shared_filter(&self, group: &str) -> String {
        format!("$share/{group}/{}", self.as_filter())
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Checks whether `topic` matches `filter`, honoring `+` (single level) and `#` (multi level).
/// A leading `$share/{group}/` on `filter` is stripped before matching, since brokers deliver
/// the unwrapped topic to shared subscribers.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let filter = strip_share_prefix(filter);
    let filter_segments: Vec<&str> = filter.split('/').collect();
    let topic_segments: Vec<&str> = topic.split('/').collect();

    let mut fi = 0;
    let mut ti = 0;
    while fi < filter_segments.len() {
        match filter_segments[fi] {
            "#" => return true,
            "+" => {
                if ti >= topic_segments.len() {
                    return false;
                }
            }
            literal => {
                if ti >= topic_segments.len() || topic_segments[ti] != literal {
                    return false;
                }
            }
        }
        fi += 1;
        ti += 1;
    }
    ti == topic_segments.len()
}

fn strip_share_prefix(filter: &str) -> &str {
    if let Some(rest) = filter.strip_prefix("$share/") {
        if let Some(idx) = rest.find('/') {
            return &rest[idx + 1..];
        }
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_tokens() {
        let pattern = TopicPattern::parse("clients/{clientId}/{request}").unwrap();
        let mut tokens = HashMap::new();
        tokens.insert("clientId".to_string(), "x".to_string());
        tokens.insert("request".to_string(), "req".to_string());
        assert_eq!(pattern.resolve(&tokens).unwrap(), "clients/x/req");
    }

    #[test]
    fn missing_token_errors() {
        let pattern = TopicPattern::parse("rpc/{name}").unwrap();
        let err = pattern.resolve(&HashMap::new()).unwrap_err();
        assert!(matches!(err, TopicError::MissingToken { .. }));
    }

    #[test]
    fn filter_rendering_and_matching() {
        let pattern = TopicPattern::parse("rpc/{clientId}/req").unwrap();
        assert_eq!(pattern.as_filter(), "rpc/+/req");
        assert!(filter_matches(&pattern.as_filter(), "rpc/x/req"));
        assert!(!filter_matches(&pattern.as_filter(), "rpc/x/y/req"));
    }

    #[test]
    fn shared_filter_strips_for_matching() {
        let pattern = TopicPattern::parse("rpc/{clientId}/req").unwrap();
        let shared = pattern.shared_filter("group1");
        assert_eq!(shared, "$share/group1/rpc/+/req");
        assert!(filter_matches(&shared, "rpc/x/req"));
    }

    #[test]
    fn hash_wildcard_matches_remaining_levels() {
        assert!(filter_matches("rpc/#", "rpc/x/req/extra"));
    }

    #[test]
    fn substitute_token_binds_every_occurrence_and_leaves_others() {
        let pattern = TopicPattern::parse("clients/{clientId}/rpc/{clientId}/{request}").unwrap();
        let bound = pattern.substitute_token("clientId", "invoker-1").unwrap();
        assert_eq!(bound.as_str(), "clients/invoker-1/rpc/invoker-1/{request}");
    }
}
