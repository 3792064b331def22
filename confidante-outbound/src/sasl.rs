use std::io::Cursor;
use std::sync::Arc;

use anyhow::{Error, anyhow, bail};
use base64::prelude::*;
use rsasl::callback::{Context, Request, SessionCallback, SessionData};
use rsasl::config::SASLConfig;
use rsasl::prelude::{MessageSent, SASLClient, SessionError, State};
use rsasl::property::{AuthId, Password};
use tokio::io::ReadHalf;
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tokio_stream::StreamExt;

use confidante_core::xml::namespaces;
use confidante_core::xml::stream_parser::{Frame, StreamParser};
use confidante_core::xml::Element;
use confidante_core::xmpp::stream::{Connection, XmppStream};

use crate::ClientSettings;

/// Mechanisms this client can speak, in the order it prefers to use them.
/// Mirrors the server's own default ordering (strongest channel-bound SCRAM
/// first, EXTERNAL last as a fallback for mutual-TLS-only deployments).
const MECHANISM_PREFERENCE: &[&str] = &[
    "SCRAM-SHA-256-PLUS",
    "SCRAM-SHA-256",
    "SCRAM-SHA-1-PLUS",
    "SCRAM-SHA-1",
    "PLAIN",
    "EXTERNAL",
];

struct ClientCallback {
    username: String,
    password: String,
}

impl SessionCallback for ClientCallback {
    fn callback(
        &self,
        _session_data: &SessionData,
        _context: &Context,
        request: &mut Request,
    ) -> Result<(), SessionError> {
        request.satisfy::<AuthId>(&self.username)?;
        request.satisfy::<Password>(self.password.as_bytes())?;
        Ok(())
    }
}

enum ClientStep {
    Data(Vec<u8>),
    Done,
}

fn authenticate(
    config: Arc<SASLConfig>,
    mechanism: &'static str,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    output_tx: mpsc::Sender<ClientStep>,
) -> Result<(), Error> {
    let mechname = mechanism.try_into()?;
    let client = SASLClient::new(config);
    let mut client_session = client.start_suggested(mechname)?;

    while {
        let mut client_out = Cursor::new(Vec::new());
        let state = if client_session.are_we_first() {
            client_session.step(None, &mut client_out)
        } else {
            let input = input_rx
                .blocking_recv()
                .ok_or_else(|| anyhow!("failed to receive sasl input"))?;
            client_session.step(Some(input.as_slice()), &mut client_out)
        };

        let running = state.as_ref().is_ok_and(|s| s.is_running());

        let output = match state {
            Ok(State::Running) => ClientStep::Data(client_out.into_inner()),
            Ok(State::Finished(MessageSent::Yes)) => ClientStep::Data(client_out.into_inner()),
            Ok(State::Finished(MessageSent::No)) => ClientStep::Done,
            Err(err) => return Err(anyhow!(err)),
        };

        output_tx
            .blocking_send(output)
            .map_err(|_| anyhow!("failed to send sasl output"))?;

        running
    } {}

    Ok(())
}

fn choose_mechanism(offered: &[String]) -> Result<&'static str, Error> {
    MECHANISM_PREFERENCE
        .iter()
        .find(|&&name| offered.iter().any(|o| o == name))
        .copied()
        .ok_or_else(|| anyhow!("no mutually supported SASL mechanism"))
}

/// Drives the client side of SASL negotiation: picks the strongest
/// mutually-supported mechanism, then shuttles challenge/response elements
/// between the wire and a blocking `rsasl` session running on its own task.
pub(crate) async fn negotiate<C, P>(
    stream: &mut XmppStream<C, P>,
    mechanisms_element: &Element,
    settings: &ClientSettings,
) -> Result<(), Error>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
{
    let offered: Vec<String> = mechanisms_element
        .child_elements("mechanism", Some(namespaces::XMPP_SASL))
        .map(|mechanism| mechanism.text())
        .collect();

    let mechanism = choose_mechanism(&offered)?;
    tracing::debug!(mechanism, "selected SASL mechanism");

    let callback = ClientCallback {
        username: settings.username.clone(),
        password: settings.password.clone(),
    };
    let config = SASLConfig::builder()
        .with_default_mechanisms()
        .with_callback(callback)?;

    let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(1);
    let (output_tx, mut output_rx) = mpsc::channel::<ClientStep>(1);

    let authenticator = spawn_blocking(move || authenticate(config, mechanism, input_rx, output_tx));

    let Some(first_step) = output_rx.recv().await else {
        bail!("sasl negotiation task exited before producing an initial response");
    };

    let ClientStep::Data(initial_response) = first_step else {
        bail!("sasl mechanism produced no initial response");
    };

    let mut auth = Element::new("auth", Some(namespaces::XMPP_SASL));
    auth.set_attribute("xmlns", None, namespaces::XMPP_SASL);
    auth.set_attribute("mechanism", None, mechanism.to_string());
    auth.add_text(if initial_response.is_empty() {
        "=".to_string()
    } else {
        BASE64_STANDARD.encode(&initial_response)
    });
    stream.writer().write_xml_element(&auth).await?;

    loop {
        let Some(Ok(Frame::XmlFragment(response))) = stream.reader().next().await else {
            bail!("stream closed during sasl negotiation");
        };

        if response.validate("failure", Some(namespaces::XMPP_SASL)) {
            bail!("sasl authentication failed");
        }

        if response.validate("success", Some(namespaces::XMPP_SASL)) {
            let data = response.text();
            if !data.is_empty() {
                let decoded = BASE64_STANDARD
                    .decode(data)
                    .map_err(|err| anyhow!(err))?;
                let _ = input_tx.send(decoded).await;
            }
            drop(input_tx);
            authenticator.await??;
            return Ok(());
        }

        if response.validate("challenge", Some(namespaces::XMPP_SASL)) {
            let decoded = BASE64_STANDARD
                .decode(response.text())
                .map_err(|err| anyhow!(err))?;
            input_tx
                .send(decoded)
                .await
                .map_err(|_| anyhow!("sasl negotiation task is gone"))?;

            let Some(step) = output_rx.recv().await else {
                bail!("sasl negotiation task exited unexpectedly");
            };

            match step {
                ClientStep::Data(data) => {
                    let mut reply = Element::new("response", Some(namespaces::XMPP_SASL));
                    reply.set_attribute("xmlns", None, namespaces::XMPP_SASL);
                    reply.add_text(BASE64_STANDARD.encode(&data));
                    stream.writer().write_xml_element(&reply).await?;
                }
                ClientStep::Done => {
                    let mut reply = Element::new("response", Some(namespaces::XMPP_SASL));
                    reply.set_attribute("xmlns", None, namespaces::XMPP_SASL);
                    stream.writer().write_xml_element(&reply).await?;
                }
            }

            continue;
        }

        bail!("unexpected element during sasl negotiation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_channel_bound_scram_over_plain() {
        let offered = vec!["PLAIN".to_string(), "SCRAM-SHA-256".to_string()];
        assert_eq!(choose_mechanism(&offered).unwrap(), "SCRAM-SHA-256");
    }

    #[test]
    fn falls_back_to_plain_when_nothing_stronger_is_offered() {
        let offered = vec!["PLAIN".to_string()];
        assert_eq!(choose_mechanism(&offered).unwrap(), "PLAIN");
    }

    #[test]
    fn rejects_mechanisms_with_no_overlap() {
        let offered = vec!["DIGEST-MD5".to_string(), "GSSAPI".to_string()];
        assert!(choose_mechanism(&offered).is_err());
    }
}
