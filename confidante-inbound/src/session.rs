use anyhow::{Error, bail};
use tokio::io::ReadHalf;

use confidante_core::{
    xml::{Element, namespaces, stream_parser::StreamParser},
    xmpp::stream::{Connection, XmppStream},
};

/// RFC 3921 Session establishment, folded in as the handshake step that
/// immediately follows Resource Binding. Most modern clients skip it
/// entirely (RFC 6121 dropped the mandatory-to-implement requirement);
/// this negotiator only answers it when a client still sends it.
pub(super) struct SessionNegotiator {
    _private: (),
}

impl SessionNegotiator {
    pub fn advertise_feature() -> Element {
        let mut session = Element::new("session", Some(namespaces::XMPP_SESSION));
        session.set_attribute("xmlns", None, namespaces::XMPP_SESSION);

        session
    }

    pub async fn negotiate_feature<C, P>(
        stream: &mut XmppStream<C, P>,
        element: &Element,
    ) -> Result<(), Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
    {
        if !element.validate("iq", Some(namespaces::XMPP_CLIENT)) {
            bail!("expected IQ stanza");
        }

        if element.attribute("type", None) != Some("set") {
            bail!("IQ stanza is not of type set");
        }

        let Some(request_id) = element.attribute("id", None) else {
            bail!("IQ stanza does not have an id");
        };

        if element
            .find_child("session", Some(namespaces::XMPP_SESSION))
            .is_none()
        {
            bail!("IQ stanza does not contain a session request");
        }

        let mut response = Element::new("iq", None);
        response.set_attribute("id", None, request_id.to_string());
        response.set_attribute("type", None, "result".to_string());

        stream.writer().write_xml_element(&response).await
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};

    use confidante_core::xml::stream_parser::rusty_xml::RustyXmlStreamParser;

    use super::*;

    struct FakeConnection(DuplexStream);

    impl AsyncRead for FakeConnection {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for FakeConnection {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    impl Connection for FakeConnection {
        type Upgrade = std::future::Ready<Result<Self, Error>>;

        fn upgrade(self) -> Result<Self::Upgrade, Error> {
            bail!("not supported by this test double")
        }

        fn is_starttls_allowed(&self) -> bool {
            false
        }

        fn is_secure(&self) -> bool {
            true
        }

        fn is_authenticated(&self) -> bool {
            false
        }
    }

    fn test_stream() -> (
        XmppStream<FakeConnection, RustyXmlStreamParser<ReadHalf<FakeConnection>>>,
        DuplexStream,
    ) {
        let (peer, ours) = tokio::io::duplex(8192);
        (XmppStream::new(FakeConnection(ours)), peer)
    }

    fn session_request(id: &str) -> Element {
        let mut iq = Element::new("iq", None);
        iq.set_attribute("id", None, id.to_string());
        iq.set_attribute("type", None, "set".to_string());
        iq.with_child("session", Some(namespaces::XMPP_SESSION), |session| {
            session.set_attribute("xmlns", None, namespaces::XMPP_SESSION.to_string());
        });
        iq
    }

    #[tokio::test]
    async fn answers_session_request_with_result() {
        let (mut stream, mut peer) = test_stream();

        SessionNegotiator::negotiate_feature(&mut stream, &session_request("sess1"))
            .await
            .unwrap();

        let mut buf = vec![0u8; 8192];
        let n = peer.read(&mut buf).await.unwrap();
        let written = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(written.contains("id=\"sess1\""));
        assert!(written.contains("type=\"result\""));
    }

    #[tokio::test]
    async fn rejects_element_without_session_child() {
        let (mut stream, _peer) = test_stream();

        let mut iq = Element::new("iq", None);
        iq.set_attribute("id", None, "sess2".to_string());
        iq.set_attribute("type", None, "set".to_string());

        let result = SessionNegotiator::negotiate_feature(&mut stream, &iq).await;
        assert!(result.is_err());
    }
}
