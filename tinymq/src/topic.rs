use std::fmt::{self, Write};
use std::{ops, str::FromStr};

use serde::{Deserialize, Serialize};

fn is_metadata<T: AsRef<str>>(s: T) -> bool {
    s.as_ref().starts_with('$')
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("InvalidTopic({0})")]
    InvalidTopic(String),
    #[error("InvalidLevel({0})")]
    InvalidLevel(String),
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    Metadata(String), // $SYS
    Blank,
    SingleWildcard, // Single level wildcard +
    MultiWildcard,  // Multi-level wildcard #
}

impl Level {
    #[inline]
    pub fn value(&self) -> Option<&str> {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        matches!(*self, Level::Metadata(_))
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        matches!(*self, Level::SingleWildcard | Level::MultiWildcard)
    }
}

impl FromStr for Level {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        match s {
            "+" => Ok(Level::SingleWildcard),
            "#" => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            _ => {
                if s.contains(['+', '#']) {
                    Err(TopicError::InvalidLevel(format!("invalid level `{}` contains +|#", s)))
                } else if is_metadata(s) {
                    Ok(Level::Metadata(String::from(s)))
                } else {
                    Ok(Level::Normal(String::from(s)))
                }
            }
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => f.write_str(s.as_str()),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_char('+'),
            Level::MultiWildcard => f.write_char('#'),
        }
    }
}

/// A tokenized topic filter or topic name.
///
/// Parsing with [`FromStr`] accepts filters (wildcards allowed); [`Topic::parse_name`] accepts only
/// names a client may publish to.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub struct Topic(Vec<Level>);

impl Topic {
    /// Parses a topic name, rejecting wildcard levels.
    pub fn parse_name(s: &str) -> Result<Topic, TopicError> {
        let topic = Topic::from_str(s)?;
        if topic.has_wildcard() {
            return Err(TopicError::InvalidTopic(format!("topic name `{}` contains wildcards", s)));
        }
        Ok(topic)
    }

    #[inline]
    pub fn levels(&self) -> &Vec<Level> {
        &self.0
    }

    #[inline]
    pub fn has_wildcard(&self) -> bool {
        self.0.iter().any(Level::is_wildcard)
    }

    /// True when a name starting with a `$` level meets a filter starting with a wildcard.
    #[inline]
    pub(crate) fn metadata_guarded(filter_first: Option<&Level>, name_first: Option<&Level>) -> bool {
        matches!(
            (filter_first, name_first),
            (Some(Level::SingleWildcard | Level::MultiWildcard), Some(Level::Metadata(_)))
        )
    }

    /// Whether this filter matches the topic name `name`.
    pub fn matches(&self, name: &Topic) -> bool {
        if Self::metadata_guarded(self.0.first(), name.0.first()) {
            return false;
        }

        let mut names = name.0.iter();
        for level in self.0.iter() {
            match (level, names.next()) {
                (Level::MultiWildcard, _) => return true,
                (Level::SingleWildcard, Some(_)) => continue,
                (l, Some(n)) if l == n => continue,
                _ => return false,
            }
        }
        names.next().is_none()
    }

    pub fn matches_str<S: AsRef<str> + ?Sized>(&self, name: &S) -> bool {
        match Topic::parse_name(name.as_ref()) {
            Ok(name) => self.matches(&name),
            Err(_) => false,
        }
    }

    fn check(&self) -> Result<(), String> {
        let last = self.0.len().saturating_sub(1);
        for (pos, level) in self.0.iter().enumerate() {
            match level {
                Level::MultiWildcard if pos != last => return Err("`#` must be the last level".into()),
                Level::Metadata(_) if pos != 0 => return Err("`$` level must be the first level".into()),
                _ => {}
            }
        }
        Ok(())
    }
}

impl From<Vec<Level>> for Topic {
    fn from(v: Vec<Level>) -> Self {
        Topic(v)
    }
}

impl ops::Deref for Topic {
    type Target = Vec<Level>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        if s.is_empty() {
            return Err(TopicError::InvalidTopic("empty topic".into()));
        }
        let topic = s.split('/').map(Level::from_str).collect::<Result<Vec<_>, TopicError>>().map(Topic)?;
        topic.check().map_err(|e| TopicError::InvalidTopic(format!("invalid topic `{}`, {}", s, e)))?;
        Ok(topic)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;

        for level in &self.0 {
            if first {
                first = false;
            } else {
                f.write_char('/')?;
            }

            level.fmt(f)?;
        }

        Ok(())
    }
}

#[macro_export]
macro_rules! topic {
    ($s:expr) => {
        $s.parse::<$crate::topic::Topic>()
    };
}
