use std::{fmt::Display, str::FromStr};

use anyhow::{Error, anyhow};
use argon2::{
    Argon2,
    password_hash::{self, PasswordHash, PasswordHashString, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};

use confidante_core::xmpp::jid::Jid;

use super::{MechanismNegotiatorResult, StoredPassword, StoredPasswordLookup};

#[derive(Debug)]
pub struct StoredPasswordArgon2 {
    pub hash: PasswordHashString,
}

impl StoredPasswordArgon2 {
    pub fn verify(&self, plaintext: &str) -> bool {
        let hash = PasswordHash::new(self.hash.as_str());
        match hash {
            Ok(hash) => Argon2::default()
                .verify_password(plaintext.as_bytes(), &hash)
                .is_ok(),
            Err(_) => false,
        }
    }
}

impl StoredPassword for StoredPasswordArgon2 {
    fn new(plaintext: &str) -> Result<Self, Error> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let hash = argon2.hash_password(plaintext.as_bytes(), &salt)?.into();
        Ok(Self { hash })
    }
}

impl FromStr for StoredPasswordArgon2 {
    type Err = password_hash::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hash = PasswordHashString::new(s)?;
        Ok(Self { hash })
    }
}

impl Display for StoredPasswordArgon2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

/// SASL PLAIN (RFC 4616): a single client response carries
/// `authzid \0 authcid \0 password`. Only allowed over a secured
/// transport (enforced by the feature's own `mechanism_available` gate).
pub struct PlainNegotiator<S> {
    domain: String,
    store: S,
    authcid: Option<String>,
}

impl<S> PlainNegotiator<S>
where
    S: StoredPasswordLookup + Send + Sync,
{
    pub fn new(domain: String, store: S) -> Self {
        Self {
            domain,
            store,
            authcid: None,
        }
    }

    pub async fn process(&mut self, payload: Vec<u8>) -> MechanismNegotiatorResult {
        let text = match String::from_utf8(payload) {
            Ok(text) => text,
            Err(err) => return MechanismNegotiatorResult::Failure(anyhow!(err)),
        };

        let mut parts = text.splitn(3, '\0');
        let _authzid = parts.next().unwrap_or("");
        let (Some(authcid), Some(password)) = (parts.next(), parts.next()) else {
            return MechanismNegotiatorResult::Failure(anyhow!(
                "malformed PLAIN response: expected authzid\\0authcid\\0password"
            ));
        };

        let jid = Jid::new(Some(authcid.to_string()), self.domain.clone(), None);
        let stored = match self.store.get_stored_password_argon2(jid).await {
            Ok(stored) => stored,
            Err(_) => return MechanismNegotiatorResult::Failure(anyhow!("no such user")),
        };

        match stored.parse::<StoredPasswordArgon2>() {
            Ok(stored) if stored.verify(password) => {
                self.authcid = Some(authcid.to_string());
                MechanismNegotiatorResult::Success(None)
            }
            _ => MechanismNegotiatorResult::Failure(anyhow!("incorrect password")),
        }
    }

    pub async fn authentication_id(self) -> Result<String, Error> {
        self.authcid
            .ok_or_else(|| anyhow!("PLAIN negotiation did not complete"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_correct_password() {
        let stored = StoredPasswordArgon2::new("hunter2").unwrap();
        assert!(stored.verify("hunter2"));
        assert!(!stored.verify("wrong"));
    }

    #[test]
    fn round_trips_through_display_and_from_str() {
        let stored = StoredPasswordArgon2::new("hunter2").unwrap();
        let serialized = stored.to_string();
        let parsed: StoredPasswordArgon2 = serialized.parse().unwrap();
        assert!(parsed.verify("hunter2"));
    }
}
