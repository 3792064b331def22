use crate::xml::Element;

/// A first-level child of `<stream:stream>` bound for routing: `iq`,
/// `message`, or `presence`. Kind checking happens at the routing layer,
/// not here.
#[derive(Debug)]
pub struct Stanza {
    pub element: Element,
}

impl Stanza {
    pub fn to(&self) -> Option<&str> {
        self.element.attribute("to", None)
    }

    pub fn from(&self) -> Option<&str> {
        self.element.attribute("from", None)
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attribute("id", None)
    }
}
