use std::fmt;

/// Topic selector used by a subscription.
///
/// Parsing rules:
/// - `"*"` matches every topic.
/// - `"prefix/*"` matches every topic starting with `"prefix/"`, at any depth.
/// - anything else matches one topic exactly; a `*` elsewhere is literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicFilter {
    /// Exactly one topic.
    Exact(String),
    /// All topics sharing a prefix (stored with its trailing `/`).
    Prefix(String),
    /// Every topic.
    All,
}

impl TopicFilter {
    /// Parses a subscription topic string.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw == "*" {
            Self::All
        } else if let Some(prefix) = raw.strip_suffix('*').filter(|p| p.ends_with('/')) {
            Self::Prefix(prefix.to_string())
        } else {
            Self::Exact(raw.to_string())
        }
    }

    /// Whether a publish on `topic` reaches this filter.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::Exact(name) => name == topic,
            Self::Prefix(prefix) => topic.starts_with(prefix.as_str()),
            Self::All => true,
        }
    }

    /// True for `All` and `Prefix`.
    #[must_use]
    pub const fn is_wildcard(&self) -> bool {
        !matches!(self, Self::Exact(_))
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(name) => f.write_str(name),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
            Self::All => f.write_str("*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wildcards() {
        assert_eq!(TopicFilter::parse("*"), TopicFilter::All);
        assert_eq!(
            TopicFilter::parse("sensors/*"),
            TopicFilter::Prefix("sensors/".into())
        );
        assert_eq!(
            TopicFilter::parse("sensors*"),
            TopicFilter::Exact("sensors*".into())
        );
        assert_eq!(TopicFilter::parse("a/*/b"), TopicFilter::Exact("a/*/b".into()));
    }

    #[test]
    fn prefix_matches_nested_topics() {
        let filter = TopicFilter::parse("sensors/*");
        assert!(filter.matches("sensors/lidar"));
        assert!(filter.matches("sensors/camera/front"));
        assert!(!filter.matches("sensors"));
        assert!(!filter.matches("actuators/wheel"));
        assert_eq!(filter.to_string(), "sensors/*");
        assert!(filter.is_wildcard());
        assert!(!TopicFilter::parse("cmd_vel").is_wildcard());
    }
}
