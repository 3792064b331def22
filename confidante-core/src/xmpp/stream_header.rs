use super::jid::Jid;
use super::stream::StreamId;

/// An IETF language tag, as carried by `xml:lang`. Not validated against
/// BCP 47 beyond being present in the attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageTag(pub(crate) String);

impl LanguageTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LanguageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The attributes of an opening `<stream:stream>` tag, in either direction.
#[derive(Debug, Clone)]
pub struct StreamHeader {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: Option<StreamId>,
    pub language: Option<LanguageTag>,
}
