use anyhow::{Error, bail};
use tokio::io::ReadHalf;
use tokio_stream::StreamExt;

use confidante_core::xml::{
    Element, namespaces,
    stream_parser::{Frame, StreamParser},
};
use confidante_core::xmpp::stream::{Connection, XmppStream};

/// Client side of STARTTLS: offer is implicit (the server listed
/// `<starttls/>` in its features), so this only has to ask and then wait
/// for `<proceed/>` before handing the connection off to the TLS upgrade.
pub(crate) async fn negotiate<C, P>(stream: &mut XmppStream<C, P>) -> Result<(), Error>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
{
    let mut starttls = Element::new("starttls", Some(namespaces::XMPP_STARTTLS));
    starttls.set_attribute("xmlns", None, namespaces::XMPP_STARTTLS);
    stream.writer().write_xml_element(&starttls).await?;

    let Some(Ok(Frame::XmlFragment(response))) = stream.reader().next().await else {
        bail!("expected a starttls response");
    };

    if response.validate("failure", Some(namespaces::XMPP_STARTTLS)) {
        bail!("server refused to start TLS");
    }

    if !response.validate("proceed", Some(namespaces::XMPP_STARTTLS)) {
        bail!("expected <proceed/> or <failure/> in response to <starttls/>");
    }

    stream.upgrade_to_tls().await
}
