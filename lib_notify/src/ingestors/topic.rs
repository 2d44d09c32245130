//! AMQP topic bindings: `*` matches exactly one dot-separated word, `#`
//! matches zero or more.

/// Routing keys the gateway consumes unless configured otherwise.
pub const DEFAULT_BINDINGS: &[&str] = &[
    "*.workspace.*.v1",
    "*.artifact.*.v1",
    "*.discovery.*.v1",
    "*.learning.*.v1",
    "*.conductor.*.v1",
    "*.conductor.*.*.v1",
    "*.guidance.*.v1",
    "*.capability.*.v1",
    "*.notification.*.v1",
    "*.audit.*.v1",
    "*.error.*.v1",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    patterns: Vec<String>,
}

impl TopicFilter {
    /// An empty pattern list binds everything.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(Into::into)
            .filter(|p| !p.trim().is_empty())
            .collect();
        if patterns.is_empty() {
            return Self::match_all();
        }
        Self { patterns }
    }

    pub fn match_all() -> Self {
        Self {
            patterns: vec!["#".to_string()],
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        self.patterns.iter().any(|p| topic_matches(p, routing_key))
    }
}

impl Default for TopicFilter {
    fn default() -> Self {
        Self::new(DEFAULT_BINDINGS.iter().copied())
    }
}

pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}
