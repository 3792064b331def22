use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Error, anyhow, bail};
use sasl::StoredPasswordLookup;
use tokio::io::ReadHalf;
use tokio::select;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_stream::StreamExt;

use confidante_core::xml::namespaces;
use confidante_core::xml::stream_parser::StreamParser;
use confidante_core::xml::{Element, stream_parser::Frame};
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::Stanza;
use confidante_core::xmpp::stream::Connection;
use confidante_core::xmpp::stream::StreamId;
use confidante_core::xmpp::stream::XmppStream;
use confidante_core::xmpp::stream_header::LanguageTag;
use confidante_core::xmpp::stream_header::StreamHeader;
use confidante_services::router::ManagementCommand;
use confidante_services::router::RouterHandle;

use self::sasl::SaslNegotiator;
use bind::ResourceBindingNegotiator;
use session::SessionNegotiator;
use starttls::StarttlsNegotiator;

mod bind;
pub mod connection;
pub mod sasl;
mod session;
mod starttls;

const STANZA_CHANNEL_BUFFER_SIZE: usize = 8;

/// Upper bound on a graceful close: a peer that stops reading after we've
/// written `</stream:stream>` must not keep the connection's task (and its
/// Router registration) alive indefinitely.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy)]
pub enum ConnectionType {
    Client,
    Server,
}

#[derive(Debug, Hash, Eq, PartialEq)]
enum StreamFeatures {
    Tls,
    Authentication,
    ResourceBinding,
    Session,
}

struct StreamInfo {
    stream_id: StreamId,
    jid: Option<Jid>,
    peer_jid: Option<Jid>,
    peer_language: Option<LanguageTag>,
    connection_type: Option<ConnectionType>,
    features: HashSet<StreamFeatures>,
}

impl Default for StreamInfo {
    fn default() -> Self {
        StreamInfo {
            stream_id: StreamId::new(),
            jid: None,
            peer_jid: None,
            peer_language: None,
            connection_type: None,
            features: HashSet::new(),
        }
    }
}

pub struct InboundStreamSettings {
    pub connection_type: ConnectionType,
    pub domain: Jid,
    pub tls_required: bool,
}

pub struct InboundStream<C, P, S>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
    S: StoredPasswordLookup + Send + Sync,
{
    stream: XmppStream<C, P>,
    info: StreamInfo,
    router: RouterHandle,
    stanza_tx: Sender<Stanza>,
    stanza_rx: Receiver<Stanza>,
    store: S,
    settings: InboundStreamSettings,
}

impl<C, P, S> InboundStream<C, P, S>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
    S: StoredPasswordLookup + Send + Sync,
{
    pub fn new(
        connection: C,
        router: RouterHandle,
        store: S,
        settings: InboundStreamSettings,
    ) -> Self {
        let stream = XmppStream::new(connection);
        let info = StreamInfo::default();
        let (stanza_tx, stanza_rx) = mpsc::channel(STANZA_CHANNEL_BUFFER_SIZE);

        InboundStream {
            stream,
            info,
            router,
            stanza_tx,
            stanza_rx,
            store,
            settings,
        }
    }

    pub async fn handle(&mut self) {
        match self.inner_handle().await {
            Ok(()) => (),
            Err(error) => {
                let _ = self.handle_unrecoverable_error(error).await;
            }
        }
    }

    async fn inner_handle(&mut self) -> Result<(), Error> {
        self.exchange_stream_headers().await?;
        self.advertise_features().await?;

        loop {
            select! {
                frame = self.stream.reader().next() => {
                    match frame {
                        Some(Ok(Frame::XmlFragment(element))) => self.process_element(element).await?,
                        Some(Ok(Frame::StreamEnd)) | None => {
                            self.graceful_close().await;
                            return Ok(());
                        }
                        Some(Ok(Frame::StreamStart(_))) => {
                            bail!("unexpected stream header after stream was already open");
                        }
                        Some(Err(err)) => return Err(err),
                    }
                }
                Some(Stanza { element }) = self.stanza_rx.recv() => {
                    self.stream.writer().write_xml_element(&element).await?;
                }
            }
        }
    }

    async fn process_element(&mut self, mut element: Element) -> Result<(), Error> {
        for feature in self.negotiable_features() {
            match self.negotiate_feature(feature, &element).await {
                Ok(()) => return Ok(()),
                Err(err) => tracing::trace!(%err, "element did not match feature negotiator"),
            }
        }

        // element must be a stanza at this point
        if let Some(jid) = &self.info.peer_jid
            && element.attribute("from", None).is_none()
        {
            element.set_attribute("from", None, jid.to_string());
        }

        self.router
            .stanzas
            .send(Stanza { element })
            .await
            .map_err(|_| anyhow!("failed to route stanza"))
    }

    fn negotiable_features(&self) -> Vec<StreamFeatures> {
        let mut features = vec![];

        if self.stream.is_starttls_allowed() && !self.info.features.contains(&StreamFeatures::Tls) {
            features.push(StreamFeatures::Tls);
        }

        if (!self.settings.tls_required || self.info.features.contains(&StreamFeatures::Tls))
            && !self.info.features.contains(&StreamFeatures::Authentication)
        {
            features.push(StreamFeatures::Authentication);
        }

        if let Some(ConnectionType::Client) = self.info.connection_type
            && self.info.features.contains(&StreamFeatures::Authentication)
        {
            if !self
                .info
                .features
                .contains(&StreamFeatures::ResourceBinding)
            {
                features.push(StreamFeatures::ResourceBinding);
            }

            if !self.info.features.contains(&StreamFeatures::Session) {
                features.push(StreamFeatures::Session);
            }
        }

        features
    }

    async fn negotiate_feature(
        &mut self,
        feature: StreamFeatures,
        element: &Element,
    ) -> Result<(), Error> {
        match feature {
            StreamFeatures::Tls => {
                StarttlsNegotiator::negotiate_feature(&mut self.stream, element).await?;
                self.info.features.insert(StreamFeatures::Tls);
                self.stream.reset();
                self.exchange_stream_headers().await?;
                self.advertise_features().await?;
            }
            StreamFeatures::Authentication => {
                let peer_jid = Some(
                    SaslNegotiator::negotiate_feature(
                        &mut self.stream,
                        element,
                        self.store.clone(),
                        self.settings.domain.domain(),
                    )
                    .await?,
                );
                self.register_peer_jid(peer_jid).await;
                self.info.features.insert(StreamFeatures::Authentication);
                self.stream.reset();
                self.exchange_stream_headers().await?;
                self.advertise_features().await?;
            }
            StreamFeatures::ResourceBinding => {
                let peer_jid = ResourceBindingNegotiator::negotiate_feature(
                    &mut self.stream,
                    element,
                    &self.info.peer_jid,
                    &self.router,
                    self.stanza_tx.clone(),
                )
                .await?;

                if let Some(ref jid) = peer_jid {
                    tracing::info!(%jid, "resource bound");
                    self.register_peer_jid(peer_jid).await;
                    self.info.features.insert(StreamFeatures::ResourceBinding);
                }
                // else: a `<conflict/>` error was already sent to the peer;
                // resource binding remains negotiable so the client can retry.
            }
            StreamFeatures::Session => {
                SessionNegotiator::negotiate_feature(&mut self.stream, element).await?;
                self.info.features.insert(StreamFeatures::Session);
            }
        }

        Ok(())
    }

    async fn register_peer_jid(&mut self, peer_jid: Option<Jid>) {
        if let Some(entity) = self.info.peer_jid.take() {
            self.router
                .management
                .send(ManagementCommand::Unregister(entity))
                .await
                .unwrap();
        }

        self.info.peer_jid = peer_jid;

        if let Some(entity) = self.info.peer_jid.clone() {
            self.router
                .management
                .send(ManagementCommand::Register(entity, self.stanza_tx.clone()))
                .await
                .unwrap();
        }
    }

    async fn advertise_features(&mut self) -> Result<(), Error> {
        let mut features = Element::new("features", Some(namespaces::XMPP_STREAMS));
        for feature in self.negotiable_features() {
            let feature = match feature {
                StreamFeatures::Tls => StarttlsNegotiator::advertise_feature(),
                StreamFeatures::Authentication => SaslNegotiator::advertise_feature(
                    self.stream.is_secure(),
                    self.stream.is_authenticated(),
                ),
                StreamFeatures::ResourceBinding => ResourceBindingNegotiator::advertise_feature(),
                StreamFeatures::Session => SessionNegotiator::advertise_feature(),
            };
            features.add_child(feature);
        }

        self.stream.writer().write_xml_element(&features).await
    }

    async fn exchange_stream_headers(&mut self) -> Result<(), Error> {
        let Ok(frame) = self
            .stream
            .reader()
            .next()
            .await
            .ok_or(anyhow!("stream closed by peer"))?
        else {
            self.send_stream_header(None).await?;
            self.handle_unrecoverable_error(anyhow!("expected xml frame"))
                .await?;
            bail!("expected xml frame");
        };

        let Frame::StreamStart(inbound_header) = frame else {
            self.send_stream_header(None).await?;
            self.handle_unrecoverable_error(anyhow!("expected stream header"))
                .await?;
            bail!("expected stream header");
        };

        self.info.jid = inbound_header.to;
        self.info.peer_language = inbound_header.language;
        self.info.connection_type = Some(self.settings.connection_type);

        self.send_stream_header(self.info.peer_jid.clone()).await
    }

    async fn send_stream_header(&mut self, to: Option<Jid>) -> Result<(), Error> {
        let outbound_header = StreamHeader {
            from: Some(self.settings.domain.clone()),
            to,
            id: Some(self.info.stream_id.clone()),
            language: None,
        };

        self.stream
            .writer()
            .write_stream_header(&outbound_header, true)
            .await
    }

    async fn handle_unrecoverable_error(&mut self, error: Error) -> Result<(), Error> {
        tracing::error!(%error, "closing stream after unrecoverable error");

        let mut error = Element::new("error", Some(namespaces::XMPP_STREAMS));
        error.with_child(
            "internal-server-error",
            Some(namespaces::XMPP_STREAM_ERRORS),
            |internal_server_error| {
                internal_server_error.set_attribute(
                    "xmlns",
                    None,
                    namespaces::XMPP_STREAM_ERRORS,
                );
            },
        );

        self.stream.writer().write_xml_element(&error).await?;
        self.graceful_close().await;
        Ok(())
    }

    /// Writes `</stream:stream>` and shuts the transport down, bounded by
    /// `CLOSE_TIMEOUT` so a peer that stops reading cannot wedge this task.
    async fn graceful_close(&mut self) {
        let close = async {
            let _ = self.stream.writer().write_stream_close().await;
            let _ = self.stream.writer().shutdown().await;
        };

        if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
            tracing::warn!("peer did not drain the close handshake within the timeout; forcing shutdown");
        }
    }
}

impl<C, P, S> Drop for InboundStream<C, P, S>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
    S: StoredPasswordLookup + Send + Sync,
{
    /// Unregisters this connection's bound JID even if the task unwinds
    /// without reaching a graceful close path — the Rust analogue of the
    /// spec's weak-reference cleanup-on-collection, since there is no
    /// async destructor to run an awaited `Unregister` send from here.
    fn drop(&mut self) {
        if let Some(entity) = self.info.peer_jid.take() {
            let _ = self
                .router
                .management
                .try_send(ManagementCommand::Unregister(entity));
        }
    }
}
