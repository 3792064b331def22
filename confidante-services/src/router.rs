use std::collections::HashMap;

use tokio::{
    select,
    sync::{mpsc, oneshot},
};

use confidante_core::xmpp::{jid::Jid, stanza::Stanza};

const STANZA_CHANNEL_BUFFER_SIZE: usize = 8;
const MANAGEMENT_CHANNEL_BUFFER_SIZE: usize = 8;

#[derive(Debug)]
pub enum ManagementCommand {
    Register(Jid, mpsc::Sender<Stanza>),
    /// Registers `jid` only if it is not already taken, reporting the
    /// outcome on `reply`. Used by resource binding to detect and retry
    /// on a resource collision without racing another connection.
    TryRegister(Jid, mpsc::Sender<Stanza>, oneshot::Sender<bool>),
    Unregister(Jid),
}

/// The single point through which every bound entity's stanzas flow.
///
/// Entities register under the full JID they were bound to. There is no
/// separate index for bare-JID lookups: a stanza addressed to a bare JID
/// is fanned out to every full JID sharing that bare JID, computed by
/// scanning the (necessarily small, per-domain) entity table.
struct Router {
    stanzas: mpsc::Receiver<Stanza>,
    management: mpsc::Receiver<ManagementCommand>,
    entities: HashMap<Jid, mpsc::Sender<Stanza>>,
}

impl Router {
    async fn run(&mut self) {
        loop {
            select! {
                Some(stanza) = self.stanzas.recv() => {
                    self.route_stanza(stanza).await;
                }
                Some(command) = self.management.recv() => {
                    self.handle_management_command(command).await;
                }
                else => return,
            }
        }
    }

    async fn route_stanza(&mut self, stanza: Stanza) {
        let Some(to) = stanza.to() else {
            tracing::warn!("dropping stanza with no `to` attribute");
            return;
        };

        let to = match to.parse::<Jid>() {
            Ok(to) => to,
            Err(err) => {
                tracing::warn!(%err, to, "dropping stanza with unparseable `to` attribute");
                return;
            }
        };

        if to.is_full_jid() {
            if let Some(sender) = self.entities.get(&to) {
                if sender.send(stanza).await.is_err() {
                    self.entities.remove(&to);
                }
                return;
            }

            tracing::warn!(%to, "dropping stanza addressed to unknown full JID");
            return;
        }

        let recipients: Vec<_> = self
            .entities
            .iter()
            .filter(|(jid, _)| jid.to_bare() == to)
            .map(|(jid, sender)| (jid.clone(), sender.clone()))
            .collect();

        if recipients.is_empty() {
            tracing::warn!(%to, "dropping stanza addressed to unknown bare JID");
            return;
        }

        for (jid, sender) in recipients {
            if sender.send(Stanza { element: stanza.element.clone() }).await.is_err() {
                self.entities.remove(&jid);
            }
        }
    }

    async fn handle_management_command(&mut self, command: ManagementCommand) {
        match command {
            ManagementCommand::Register(jid, tx) => {
                tracing::debug!(%jid, "registering entity");
                self.entities.insert(jid, tx);
            }
            ManagementCommand::TryRegister(jid, tx, reply) => {
                let registered = if self.entities.contains_key(&jid) {
                    false
                } else {
                    tracing::debug!(%jid, "registering entity");
                    self.entities.insert(jid, tx);
                    true
                };
                let _ = reply.send(registered);
            }
            ManagementCommand::Unregister(jid) => {
                tracing::debug!(%jid, "unregistering entity");
                self.entities.remove(&jid);
            }
        }
    }
}

#[derive(Clone)]
pub struct RouterHandle {
    pub stanzas: mpsc::Sender<Stanza>,
    pub management: mpsc::Sender<ManagementCommand>,
}

impl Default for RouterHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterHandle {
    pub fn new() -> Self {
        let (stanzas_tx, stanzas_rx) = mpsc::channel(STANZA_CHANNEL_BUFFER_SIZE);
        let (management_tx, management_rx) = mpsc::channel(MANAGEMENT_CHANNEL_BUFFER_SIZE);
        let mut router = Router {
            stanzas: stanzas_rx,
            management: management_rx,
            entities: HashMap::new(),
        };
        tokio::spawn(async move {
            router.run().await;
        });

        RouterHandle {
            stanzas: stanzas_tx,
            management: management_tx,
        }
    }

    pub async fn send_stanza(&mut self, stanza: Stanza) {
        if self.stanzas.send(stanza).await.is_err() {
            tracing::error!("router task is gone");
        }
    }

    /// Registers `jid` atomically, returning `false` if it was already taken.
    pub async fn try_register(&self, jid: Jid, tx: mpsc::Sender<Stanza>) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .management
            .send(ManagementCommand::TryRegister(jid, tx, reply_tx))
            .await
            .is_err()
        {
            tracing::error!("router task is gone");
            return false;
        }

        reply_rx.await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confidante_core::xml::Element;

    fn stanza_to(to: &str) -> Stanza {
        let mut element = Element::new("message", None);
        element.set_attribute("to", None, to.to_string());
        Stanza { element }
    }

    #[tokio::test]
    async fn routes_to_full_jid() {
        let router = RouterHandle::new();
        let (tx, mut rx) = mpsc::channel(1);
        let full: Jid = "user@example.com/res".parse().unwrap();

        router
            .management
            .send(ManagementCommand::Register(full.clone(), tx))
            .await
            .unwrap();

        router
            .stanzas
            .send(stanza_to("user@example.com/res"))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.to(), Some("user@example.com/res"));
    }

    #[tokio::test]
    async fn fans_out_to_bare_jid() {
        let router = RouterHandle::new();
        let (tx_a, mut rx_a) = mpsc::channel(1);
        let (tx_b, mut rx_b) = mpsc::channel(1);

        router
            .management
            .send(ManagementCommand::Register(
                "user@example.com/a".parse().unwrap(),
                tx_a,
            ))
            .await
            .unwrap();
        router
            .management
            .send(ManagementCommand::Register(
                "user@example.com/b".parse().unwrap(),
                tx_b,
            ))
            .await
            .unwrap();

        router
            .stanzas
            .send(stanza_to("user@example.com"))
            .await
            .unwrap();

        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn try_register_detects_conflict() {
        let router = RouterHandle::new();
        let full: Jid = "user@example.com/res".parse().unwrap();
        let (tx_a, _rx_a) = mpsc::channel(1);
        let (tx_b, _rx_b) = mpsc::channel(1);

        assert!(router.try_register(full.clone(), tx_a).await);
        assert!(!router.try_register(full, tx_b).await);
    }

    #[tokio::test]
    async fn unregistered_jid_is_dropped_silently() {
        let router = RouterHandle::new();
        router
            .stanzas
            .send(stanza_to("nobody@example.com"))
            .await
            .unwrap();

        // no panic, no recipient; give the router a moment to process
        tokio::task::yield_now().await;
    }
}
