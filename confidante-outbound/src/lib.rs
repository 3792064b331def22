use std::collections::{HashMap, VecDeque};

use anyhow::{Error, anyhow, bail};
use tokio::io::ReadHalf;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;

use confidante_core::xml::stream_parser::{Frame, StreamParser};
use confidante_core::xml::{Element, namespaces};
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stream::{Connection, StreamId, XmppStream};
use confidante_core::xmpp::stream_header::StreamHeader;

mod bind;
pub mod connection;
mod sasl;
mod session;
mod starttls;

/// What a client needs to authenticate against and bind a resource on a
/// server. Mirrors `confidante-inbound`'s server-side settings, but there
/// is no TLS material here: the client only ever verifies, never presents,
/// a certificate (mutual TLS for SASL EXTERNAL is the one exception, out
/// of scope for this revision).
pub struct ClientSettings {
    pub host: Jid,
    pub username: String,
    pub password: String,
}

/// Drives the client (initiator) side of a stream: opens the stream,
/// negotiates whichever of StartTLS/SASL/Bind/Session the server offers,
/// in that order, then exposes IQ request/response correlation and
/// generic stanza receipt for the application built on top.
pub struct OutboundStream<C, P>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
{
    stream: XmppStream<C, P>,
    secured: bool,
    authenticated: bool,
    bound_jid: Option<Jid>,
    pending_iqs: HashMap<String, oneshot::Sender<Element>>,
    inbox: VecDeque<Element>,
}

impl<C, P> OutboundStream<C, P>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
{
    pub fn new(connection: C) -> Self {
        Self {
            stream: XmppStream::new(connection),
            secured: false,
            authenticated: false,
            bound_jid: None,
            pending_iqs: HashMap::new(),
            inbox: VecDeque::new(),
        }
    }

    /// Opens the stream and negotiates every feature the server offers,
    /// in protocol order, until resource binding (and, if still offered,
    /// session establishment) completes. Returns the bound full JID.
    pub async fn connect(&mut self, settings: &ClientSettings) -> Result<Jid, Error> {
        self.open_stream(settings).await?;
        self.negotiate_features(settings).await?;

        self.bound_jid
            .clone()
            .ok_or_else(|| anyhow!("stream negotiation ended without binding a resource"))
    }

    pub fn bound_jid(&self) -> Option<&Jid> {
        self.bound_jid.as_ref()
    }

    async fn open_stream(&mut self, settings: &ClientSettings) -> Result<(), Error> {
        let from = Jid::new(
            Some(settings.username.clone()),
            settings.host.domain().to_string(),
            None,
        );
        let header = StreamHeader {
            from: Some(from),
            to: Some(settings.host.to_bare()),
            id: None,
            language: None,
        };
        self.stream.writer().write_stream_header(&header, true).await?;

        let Some(Ok(Frame::StreamStart(_))) = self.stream.reader().next().await else {
            bail!("expected a stream header from the server");
        };

        Ok(())
    }

    async fn read_features(&mut self) -> Result<Element, Error> {
        let Some(Ok(Frame::XmlFragment(features))) = self.stream.reader().next().await else {
            bail!("expected <stream:features> from the server");
        };

        if !features.validate("features", Some(namespaces::XMPP_STREAMS)) {
            bail!("expected <stream:features>, got something else");
        }

        Ok(features)
    }

    async fn negotiate_features(&mut self, settings: &ClientSettings) -> Result<(), Error> {
        loop {
            let features = self.read_features().await?;

            if !self.secured
                && self.stream.is_starttls_allowed()
                && features
                    .find_child("starttls", Some(namespaces::XMPP_STARTTLS))
                    .is_some()
            {
                starttls::negotiate(&mut self.stream).await?;
                self.secured = true;
                self.stream.reset();
                self.open_stream(settings).await?;
                continue;
            }

            if !self.authenticated {
                if let Some(mechanisms) =
                    features.find_child("mechanisms", Some(namespaces::XMPP_SASL))
                {
                    sasl::negotiate(&mut self.stream, mechanisms, settings).await?;
                    self.authenticated = true;
                    self.stream.reset();
                    self.open_stream(settings).await?;
                    continue;
                }

                bail!("server did not offer SASL mechanisms after securing the stream");
            }

            if features.find_child("bind", Some(namespaces::XMPP_BIND)).is_none() {
                bail!("server did not advertise resource binding after authentication");
            }

            self.bound_jid = Some(self.bind().await?);

            if features
                .find_child("session", Some(namespaces::XMPP_SESSION))
                .is_some()
            {
                self.establish_session().await?;
            }

            return Ok(());
        }
    }

    /// Sends an `iq` of the given type wrapping `body`, and awaits the
    /// matching `result`/`error` reply by `id`. Any other element read off
    /// the wire while waiting — a pushed `message`/`presence`, or an `iq`
    /// whose `id` matches nothing pending — is queued for `recv_stanza`
    /// rather than dropped.
    pub async fn iq_request(&mut self, kind: &str, body: Element) -> Result<Element, Error> {
        let id = StreamId::new().to_string();

        let mut iq = Element::new("iq", None);
        iq.set_attribute("id", None, id.clone());
        iq.set_attribute("type", None, kind.to_string());
        iq.add_child(body);

        let (response_tx, mut response_rx) = oneshot::channel();
        self.pending_iqs.insert(id.clone(), response_tx);
        self.stream.writer().write_xml_element(&iq).await?;

        loop {
            if let Ok(response) = response_rx.try_recv() {
                return Ok(response);
            }

            tokio::select! {
                result = &mut response_rx => {
                    return result.map_err(|_| anyhow!("iq `{id}` was dropped without a reply"));
                }
                frame = self.stream.reader().next() => {
                    self.handle_incoming_frame(frame)?;
                }
            }
        }
    }

    /// Returns the next stanza not already claimed by a pending
    /// `iq_request`: either one queued from an earlier call, or the next
    /// one read off the wire.
    pub async fn recv_stanza(&mut self) -> Result<Element, Error> {
        loop {
            if let Some(element) = self.inbox.pop_front() {
                return Ok(element);
            }

            let frame = self.stream.reader().next().await;
            if let Some(element) = self.handle_incoming_frame(frame)? {
                return Ok(element);
            }
        }
    }

    /// Dispatches one incoming frame: a matching `iq` reply resolves its
    /// pending request; anything else is returned to the caller (and,
    /// from `iq_request`'s loop, queued rather than lost).
    fn handle_incoming_frame(
        &mut self,
        frame: Option<Result<Frame, Error>>,
    ) -> Result<Option<Element>, Error> {
        match frame {
            Some(Ok(Frame::XmlFragment(element))) => {
                if element.validate("iq", Some(namespaces::XMPP_CLIENT))
                    && let Some(id) = element.attribute("id", None)
                    && let Some(pending) = self.pending_iqs.remove(id)
                {
                    let _ = pending.send(element);
                    return Ok(None);
                }

                self.inbox.push_back(element.clone());
                Ok(Some(element))
            }
            Some(Ok(Frame::StreamStart(_))) => bail!("unexpected stream header mid-stream"),
            Some(Ok(Frame::StreamEnd)) | None => bail!("stream closed by the peer"),
            Some(Err(err)) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

    use confidante_core::xml::stream_parser::rusty_xml::RustyXmlStreamParser;

    use super::*;

    /// A duplex-backed connection that is already secure and unauthenticated,
    /// so tests can exercise `iq_request`/`bind`/`establish_session` directly
    /// without driving a full StartTLS/SASL handshake.
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
            Err(anyhow!("not supported by this test double"))
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

    /// Returns an `OutboundStream` wired to a duplex pipe, plus the other end
    /// of that pipe playing the role of the remote server.
    fn test_stream() -> (OutboundStream<FakeConnection, RustyXmlStreamParser<ReadHalf<FakeConnection>>>, DuplexStream)
    {
        let (peer, ours) = tokio::io::duplex(8192);
        let stream = OutboundStream::new(FakeConnection(ours));
        (stream, peer)
    }

    #[tokio::test]
    async fn iq_request_matches_reply_by_id() {
        let (mut stream, mut server) = test_stream();

        let request = tokio::spawn(async move {
            let body = Element::new("ping", Some("urn:xmpp:ping"));
            stream.iq_request("get", body).await
        });

        // drain the outgoing <iq> so we can read its generated id back out
        let mut buf = vec![0u8; 8192];
        let n = server.read(&mut buf).await.unwrap();
        let written = String::from_utf8_lossy(&buf[..n]).to_string();
        let id_start = written.find("id=\"").unwrap() + 4;
        let id_end = written[id_start..].find('"').unwrap() + id_start;
        let id = &written[id_start..id_end];

        server
            .write_all(
                format!(r#"<iq id="{id}" type="result" xmlns="jabber:client"><pong/></iq>"#)
                    .as_bytes(),
            )
            .await
            .unwrap();

        let response = request.await.unwrap().unwrap();
        assert_eq!(response.attribute("type", None), Some("result"));
        assert!(response.find_child("pong", None).is_some());
    }

    #[tokio::test]
    async fn bind_parses_jid_from_result() {
        let (mut stream, mut server) = test_stream();

        let request = tokio::spawn(async move { stream.bind().await.map(|jid| (stream, jid)) });

        let mut buf = vec![0u8; 8192];
        let n = server.read(&mut buf).await.unwrap();
        let written = String::from_utf8_lossy(&buf[..n]).to_string();
        let id_start = written.find("id=\"").unwrap() + 4;
        let id_end = written[id_start..].find('"').unwrap() + id_start;
        let id = &written[id_start..id_end];

        server
            .write_all(
                format!(
                    r#"<iq id="{id}" type="result" xmlns="jabber:client"><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>user@example.com/resource</jid></bind></iq>"#
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let (_stream, jid) = request.await.unwrap().unwrap();
        assert_eq!(jid.to_string(), "user@example.com/resource");
    }

    #[tokio::test]
    async fn bind_rejected_by_server_is_an_error() {
        let (mut stream, mut server) = test_stream();

        let request = tokio::spawn(async move { stream.bind().await });

        let mut buf = vec![0u8; 8192];
        let n = server.read(&mut buf).await.unwrap();
        let written = String::from_utf8_lossy(&buf[..n]).to_string();
        let id_start = written.find("id=\"").unwrap() + 4;
        let id_end = written[id_start..].find('"').unwrap() + id_start;
        let id = &written[id_start..id_end];

        server
            .write_all(
                format!(r#"<iq id="{id}" type="error" xmlns="jabber:client"><error/></iq>"#)
                    .as_bytes(),
            )
            .await
            .unwrap();

        assert!(request.await.unwrap().is_err());
    }
}
