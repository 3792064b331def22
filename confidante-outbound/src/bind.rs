use anyhow::{Error, anyhow, bail};
use tokio::io::ReadHalf;

use confidante_core::xml::{Element, namespaces, stream_parser::StreamParser};
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stream::Connection;

use crate::OutboundStream;

impl<C, P> OutboundStream<C, P>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
{
    /// Requests resource binding, letting the server pick the resource
    /// string. Returns the full JID the server assigned.
    pub(crate) async fn bind(&mut self) -> Result<Jid, Error> {
        let mut bind = Element::new("bind", Some(namespaces::XMPP_BIND));
        bind.set_attribute("xmlns", None, namespaces::XMPP_BIND);

        let response = self.iq_request("set", bind).await?;

        if response.attribute("type", None) != Some("result") {
            bail!("resource binding was rejected by the server");
        }

        response
            .find_child("bind", Some(namespaces::XMPP_BIND))
            .and_then(|bind| bind.find_child("jid", Some(namespaces::XMPP_BIND)))
            .map(|jid| jid.text())
            .ok_or_else(|| anyhow!("bind result did not include a jid"))?
            .parse()
    }
}
