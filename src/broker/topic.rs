/// Maps tickers to bus channels and back.
///
/// The ticker is the topic as far as clients and the registry are concerned;
/// only the bus connection sees the prefixed channel name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNames {
    prefix: String,
}

impl TopicNames {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn channel(&self, ticker: &str) -> String {
        format!("{}{}", self.prefix, ticker)
    }

    /// `None` for channels outside the price namespace or with an empty ticker.
    pub fn ticker<'a>(&self, channel: &'a str) -> Option<&'a str> {
        channel
            .strip_prefix(self.prefix.as_str())
            .filter(|ticker| !ticker.is_empty())
    }
}
