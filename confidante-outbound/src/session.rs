use anyhow::{Error, bail};
use tokio::io::ReadHalf;

use confidante_core::xml::{Element, namespaces, stream_parser::StreamParser};
use confidante_core::xmpp::stream::Connection;

use crate::OutboundStream;

impl<C, P> OutboundStream<C, P>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
{
    /// RFC 3921 session establishment, sent only when the server still
    /// advertises `<session/>` after Bind — most modern servers no longer
    /// require it (RFC 6121), but answering it when offered costs nothing.
    pub(crate) async fn establish_session(&mut self) -> Result<(), Error> {
        let session = Element::new("session", Some(namespaces::XMPP_SESSION));

        let response = self.iq_request("set", session).await?;

        if response.attribute("type", None) != Some("result") {
            bail!("session establishment was rejected by the server");
        }

        Ok(())
    }
}
