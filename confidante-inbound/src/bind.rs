use anyhow::{Error, bail};
use tokio::io::ReadHalf;
use tokio::sync::mpsc::Sender;

use confidante_core::{
    xml::{Element, namespaces, stream_parser::StreamParser},
    xmpp::{
        jid::Jid,
        stanza::Stanza,
        stream::{Connection, XmppStream},
    },
};
use confidante_services::router::RouterHandle;

/// Number of times a colliding resource is retried with a freshly generated
/// identifier before giving up and reporting a conflict to the peer.
const MAX_BIND_ATTEMPTS: usize = 3;

pub struct ResourceBindingNegotiator {
    _private: (),
}

impl ResourceBindingNegotiator {
    pub fn advertise_feature() -> Element {
        let mut bind = Element::new("bind", Some(namespaces::XMPP_BIND));
        bind.set_attribute("xmlns", None, namespaces::XMPP_BIND.to_string());

        bind
    }

    /// Negotiates resource binding, retrying with a freshly generated
    /// resource when the router reports the requested full JID is already
    /// taken. Returns `Ok(None)` after exhausting retries, having already
    /// written a `<conflict/>` error to the peer, so the caller can keep the
    /// stream open without treating this as a fatal error.
    pub async fn negotiate_feature<C, P>(
        stream: &mut XmppStream<C, P>,
        element: &Element,
        entity: &Option<Jid>,
        router: &RouterHandle,
        stanza_tx: Sender<Stanza>,
    ) -> Result<Option<Jid>, Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
    {
        if !element.validate("iq", Some(namespaces::XMPP_CLIENT)) {
            bail!("expected IQ stanza");
        }

        if element.attribute("type", None) != Some("set") {
            bail!("IQ stanza is not of type set");
        };

        let Some(request_id) = element.attribute("id", None) else {
            bail!("IQ stanza does not have an id");
        };

        let Some(bind_request) = element.find_child("bind", Some(namespaces::XMPP_BIND)) else {
            bail!("IQ stanza does not contain a bind request");
        };

        let requested_resource =
            bind_request.find_child("resource", Some(namespaces::XMPP_BIND));

        let Some(entity) = entity else {
            bail!("entity to bind is unknown");
        };

        let attempts = if requested_resource.is_some() {
            1
        } else {
            MAX_BIND_ATTEMPTS
        };

        for _ in 0..attempts {
            let resource = match requested_resource {
                Some(requested_resource) => requested_resource.text(),
                None => uuid::Uuid::new_v4().to_string(),
            };

            let bound_entity = entity.bind(resource);

            if router
                .try_register(bound_entity.clone(), stanza_tx.clone())
                .await
            {
                let mut bind_response = Element::new("iq", None);
                bind_response.set_attribute("id", None, request_id.to_string());
                bind_response.set_attribute("type", None, "result".to_string());
                bind_response.with_child("bind", Some(namespaces::XMPP_BIND), |bind| {
                    bind.set_attribute("xmlns", None, namespaces::XMPP_BIND.to_string());
                    bind.with_child("jid", None, |jid| {
                        jid.add_text(format!("{}", bound_entity));
                    });
                });

                stream.writer().write_xml_element(&bind_response).await?;

                return Ok(Some(bound_entity));
            }

            tracing::debug!(%bound_entity, "resource already bound, retrying");
        }

        let mut bind_error = Element::new("iq", None);
        bind_error.set_attribute("id", None, request_id.to_string());
        bind_error.set_attribute("type", None, "error".to_string());
        bind_error.with_child("error", None, |error| {
            error.set_attribute("type", None, "cancel".to_string());
            error.with_child("conflict", Some(namespaces::XMPP_STANZA_ERRORS), |conflict| {
                conflict.set_attribute("xmlns", None, namespaces::XMPP_STANZA_ERRORS);
            });
        });

        stream.writer().write_xml_element(&bind_error).await?;

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};
    use tokio::sync::mpsc;

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

    fn bind_request(id: &str, resource: Option<&str>) -> Element {
        let mut iq = Element::new("iq", None);
        iq.set_attribute("id", None, id.to_string());
        iq.set_attribute("type", None, "set".to_string());
        iq.with_child("bind", Some(namespaces::XMPP_BIND), |bind| {
            bind.set_attribute("xmlns", None, namespaces::XMPP_BIND.to_string());
            if let Some(resource) = resource {
                bind.with_child("resource", Some(namespaces::XMPP_BIND), |el| {
                    el.add_text(resource.to_string());
                });
            }
        });
        iq
    }

    async fn read_all(peer: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 8192];
        let n = peer.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[tokio::test]
    async fn binds_requested_resource_and_registers_with_router() {
        let (mut stream, mut peer) = test_stream();
        let router = RouterHandle::new();
        let (stanza_tx, _stanza_rx) = mpsc::channel(1);
        let entity: Option<Jid> = Some("user@example.com".parse().unwrap());

        let request = bind_request("bind1", Some("home"));
        let bound = ResourceBindingNegotiator::negotiate_feature(
            &mut stream,
            &request,
            &entity,
            &router,
            stanza_tx,
        )
        .await
        .unwrap();

        assert_eq!(bound.unwrap().to_string(), "user@example.com/home");

        let written = read_all(&mut peer).await;
        assert!(written.contains("type=\"result\""));
        assert!(written.contains("user@example.com/home"));
    }

    #[tokio::test]
    async fn retries_with_fresh_resource_on_collision_then_succeeds() {
        let (mut stream, _peer) = test_stream();
        let router = RouterHandle::new();
        let (existing_tx, _existing_rx) = mpsc::channel(1);
        let (stanza_tx, _stanza_rx) = mpsc::channel(1);
        let entity: Option<Jid> = Some("user@example.com".parse().unwrap());

        // Pre-register a distinct resource name so an auto-generated (UUID)
        // candidate is overwhelmingly unlikely to collide, proving a
        // requested-resource collision is what's under test, not luck.
        assert!(
            router
                .try_register("user@example.com/home".parse().unwrap(), existing_tx)
                .await
        );

        let request = bind_request("bind2", None); // server-generated resource
        let bound = ResourceBindingNegotiator::negotiate_feature(
            &mut stream,
            &request,
            &entity,
            &router,
            stanza_tx,
        )
        .await
        .unwrap();

        assert!(bound.is_some());
        assert_ne!(bound.unwrap().to_string(), "user@example.com/home");
    }

    #[tokio::test]
    async fn reports_conflict_when_requested_resource_is_already_taken() {
        let (mut stream, mut peer) = test_stream();
        let router = RouterHandle::new();
        let (existing_tx, _existing_rx) = mpsc::channel(1);
        let (stanza_tx, _stanza_rx) = mpsc::channel(1);
        let entity: Option<Jid> = Some("user@example.com".parse().unwrap());

        assert!(
            router
                .try_register("user@example.com/home".parse().unwrap(), existing_tx)
                .await
        );

        // A requested (not auto-generated) resource is never retried, so
        // a live collision is reported as a conflict immediately.
        let request = bind_request("bind3", Some("home"));
        let bound = ResourceBindingNegotiator::negotiate_feature(
            &mut stream,
            &request,
            &entity,
            &router,
            stanza_tx,
        )
        .await
        .unwrap();

        assert!(bound.is_none());

        let written = read_all(&mut peer).await;
        assert!(written.contains("type=\"error\""));
        assert!(written.contains("conflict"));
    }

    #[tokio::test]
    async fn rejects_non_set_iq() {
        let (mut stream, _peer) = test_stream();
        let router = RouterHandle::new();
        let (stanza_tx, _stanza_rx) = mpsc::channel(1);
        let entity: Option<Jid> = Some("user@example.com".parse().unwrap());

        let mut request = bind_request("bind4", Some("home"));
        request.set_attribute("type", None, "get".to_string());

        let result = ResourceBindingNegotiator::negotiate_feature(
            &mut stream,
            &request,
            &entity,
            &router,
            stanza_tx,
        )
        .await;

        assert!(result.is_err());
    }
}
