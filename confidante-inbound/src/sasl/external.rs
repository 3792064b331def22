use anyhow::{Error, anyhow};

use super::MechanismNegotiatorResult;

/// SASL EXTERNAL (RFC 4422 appendix A): the client is already authenticated
/// at the transport layer (a verified TLS client certificate) and this
/// exchange only carries the authorization identity it wants to assume.
///
/// Deriving an identity from the certificate itself is out of scope here;
/// the client must supply a non-empty authzid in its initial response.
pub struct ExternalNegotiator {
    authzid: Option<String>,
}

impl ExternalNegotiator {
    pub fn new() -> Self {
        Self { authzid: None }
    }

    pub async fn process(&mut self, payload: Vec<u8>) -> MechanismNegotiatorResult {
        match String::from_utf8(payload) {
            Ok(authzid) if !authzid.is_empty() => {
                self.authzid = Some(authzid);
                MechanismNegotiatorResult::Success(None)
            }
            Ok(_) => MechanismNegotiatorResult::Failure(anyhow!(
                "EXTERNAL requires an explicit authorization identity"
            )),
            Err(err) => MechanismNegotiatorResult::Failure(anyhow!(err)),
        }
    }

    pub async fn authentication_id(self) -> Result<String, Error> {
        self.authzid
            .ok_or_else(|| anyhow!("EXTERNAL negotiation did not complete"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_authzid_is_rejected() {
        let mut negotiator = ExternalNegotiator::new();
        let result = negotiator.process(Vec::new()).await;
        assert!(matches!(result, MechanismNegotiatorResult::Failure(_)));
    }

    #[tokio::test]
    async fn authzid_is_carried_through_to_authentication_id() {
        let mut negotiator = ExternalNegotiator::new();
        let result = negotiator.process(b"user@example.com".to_vec()).await;
        assert!(matches!(result, MechanismNegotiatorResult::Success(None)));
        assert_eq!(
            negotiator.authentication_id().await.unwrap(),
            "user@example.com"
        );
    }
}
