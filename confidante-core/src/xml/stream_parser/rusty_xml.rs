use std::collections::HashMap;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use anyhow::{anyhow, Error};
use rustyxml::{Element as RustyXmlElement, ElementBuilder, Event, Parser, Xml};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_stream::Stream;

use crate::xml::namespaces;
use crate::xml::Element;
use crate::xml::Node;
use crate::xmpp::stream_header::{LanguageTag, StreamHeader};

use super::{Frame, StreamParser as StreamParserTrait};

const READ_BUFFER_SIZE: usize = 4096;

fn is_stream_tag(name: &str, namespace: &Option<String>) -> bool {
    name == "stream" && namespace.as_deref() == Some(namespaces::XMPP_STREAMS)
}

fn convert_xml_node(xml: Xml) -> Node {
    match xml {
        Xml::ElementNode(element) => Node::Element(element.into()),
        Xml::CharacterNode(text) => Node::Text(text),
        Xml::CDATANode(text) => Node::CData(text),
        Xml::CommentNode(text) => Node::Comment(text),
        Xml::PINode(text) => Node::ProcessingInstruction(text),
    }
}

impl From<RustyXmlElement> for Element {
    fn from(element: RustyXmlElement) -> Self {
        let RustyXmlElement {
            name,
            ns,
            attributes,
            children,
            ..
        } = element;

        let mut converted = Element::new(&name, ns.as_deref());
        for ((attr_name, attr_ns), value) in attributes {
            converted.set_attribute(&attr_name, attr_ns.as_deref(), value);
        }
        for child in children {
            converted.children.push(convert_xml_node(child));
        }

        converted
    }
}

fn stream_header_from_attributes(attributes: &HashMap<(String, Option<String>), String>) -> StreamHeader {
    StreamHeader {
        from: attributes
            .get(&("from".to_string(), None))
            .and_then(|value| value.parse().ok()),
        to: attributes
            .get(&("to".to_string(), None))
            .and_then(|value| value.parse().ok()),
        id: None,
        language: attributes
            .get(&("lang".to_string(), Some(namespaces::XML.to_string())))
            .map(|lang| LanguageTag::new(lang.clone())),
    }
}

/// Incrementally parses an XMPP byte stream into [`Frame`]s using the
/// `rustyxml` SAX-style parser, reassembling top-level child elements of the
/// outer `<stream:stream>` into complete [`Element`] trees.
pub struct RustyXmlStreamParser<R> {
    reader: R,
    buf: Box<[u8]>,
    parser: Parser,
    element_builder: ElementBuilder,
}

impl<R: AsyncRead + Unpin> StreamParserTrait<R> for RustyXmlStreamParser<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            parser: Parser::new(),
            element_builder: ElementBuilder::new(),
        }
    }

    fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: AsyncRead + Unpin> Stream for RustyXmlStreamParser<R> {
    type Item = Result<Frame, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            for parser_result in &mut this.parser {
                match parser_result {
                    Ok(Event::ElementStart(tag)) if is_stream_tag(&tag.name, &tag.ns) => {
                        return Poll::Ready(Some(Ok(Frame::StreamStart(
                            stream_header_from_attributes(&tag.attributes),
                        ))));
                    }
                    Ok(Event::ElementEnd(tag)) if is_stream_tag(&tag.name, &tag.ns) => {
                        return Poll::Ready(Some(Ok(Frame::StreamEnd)));
                    }
                    Err(err) => {
                        return Poll::Ready(Some(Err(anyhow!(err))));
                    }
                    other => {
                        if let Some(builder_result) = this.element_builder.handle_event(other) {
                            let frame_result = match builder_result {
                                Ok(element) => Ok(Frame::XmlFragment(element.into())),
                                Err(err) => Err(anyhow!(err)),
                            };
                            return Poll::Ready(Some(frame_result));
                        }
                    }
                }
            }

            let mut read_buf = ReadBuf::new(&mut this.buf);
            ready!(Pin::new(&mut this.reader).poll_read(cx, &mut read_buf))?;
            let bytes_read = read_buf.filled().len();

            if bytes_read == 0 {
                return Poll::Ready(None);
            }

            match std::str::from_utf8(read_buf.filled()) {
                Ok(text) => {
                    tracing::trace!(%text, "read from stream");
                    this.parser.feed_str(text);
                }
                Err(err) => {
                    return Poll::Ready(Some(Err(anyhow!(err))));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp::jid::Jid;
    use std::str::FromStr;
    use tokio::io::AsyncWriteExt;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn parses_stream_header() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut parser = RustyXmlStreamParser::new(server);

        client
            .write_all(
                b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' \
                   xmlns='jabber:client' to='example.com' version='1.0'>",
            )
            .await
            .unwrap();

        let frame = parser.next().await.unwrap().unwrap();
        match frame {
            Frame::StreamStart(header) => {
                assert_eq!(header.to, Some(Jid::from_str("example.com").unwrap()));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn parses_child_element_and_stream_end() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut parser = RustyXmlStreamParser::new(server);

        client
            .write_all(
                b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' xmlns='jabber:client'>",
            )
            .await
            .unwrap();
        parser.next().await.unwrap().unwrap();

        client
            .write_all(b"<message to='a@b'><body>hi</body></message>")
            .await
            .unwrap();

        let frame = parser.next().await.unwrap().unwrap();
        match frame {
            Frame::XmlFragment(element) => {
                assert!(element.validate("message", Some("jabber:client")));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        client.write_all(b"</stream:stream>").await.unwrap();
        let frame = parser.next().await.unwrap().unwrap();
        assert!(matches!(frame, Frame::StreamEnd));
    }
}
