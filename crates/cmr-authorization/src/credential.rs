//! Credential context: mints, attenuates and checks bearer credentials.
//!
//! Credentials are biscuit tokens signed by the model's root key. Declared
//! caveats live as facts in the authority block; expiry is a `time` check.
//! Attenuation re-mints from the same root key with the relation key bound,
//! so an attenuated credential never declares more than its parent.

use crate::caveats::DeclaredCaveats;
use crate::errors::CredentialError;
use biscuit_auth::{macros::*, Authorizer, Biscuit, KeyPair, PublicKey};
use cmr_core::params::Credential;
use cmr_core::{
    Clock, CmrError, CredentialConfig, ModelUuid, OfferUrl, RelationKey, Result, SystemClock,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Mints and verifies credentials on behalf of one model
pub struct CredentialContext {
    model_uuid: ModelUuid,
    root: KeyPair,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for CredentialContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialContext")
            .field("model_uuid", &self.model_uuid)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl CredentialContext {
    /// Context with a fresh random root key
    pub fn new(model_uuid: ModelUuid, config: &CredentialConfig) -> Self {
        Self::with_root_key(model_uuid, KeyPair::new(), config)
    }

    pub fn with_root_key(model_uuid: ModelUuid, root: KeyPair, config: &CredentialConfig) -> Self {
        Self {
            model_uuid,
            root,
            ttl: config.ttl(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used for expiry
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn model_uuid(&self) -> ModelUuid {
        self.model_uuid
    }

    pub fn root_public_key(&self) -> PublicKey {
        self.root.public()
    }

    /// Fresh credential scoped to one relation
    pub fn mint_relation_credential(
        &self,
        username: &str,
        source_model_uuid: ModelUuid,
        relation_key: &RelationKey,
    ) -> Result<Credential> {
        self.mint(&DeclaredCaveats::for_relation(
            username,
            source_model_uuid,
            relation_key.clone(),
        ))
    }

    /// Fresh credential scoped to an offer, before any relation exists
    pub fn mint_offer_credential(
        &self,
        username: &str,
        source_model_uuid: ModelUuid,
        offer_url: &OfferUrl,
    ) -> Result<Credential> {
        self.mint(&DeclaredCaveats::for_offer(
            username,
            source_model_uuid,
            offer_url.clone(),
        ))
    }

    /// Narrow a credential to `relation_key`
    ///
    /// The result keeps every caveat of `existing`, adds the relation key, and
    /// gets a fresh expiry. A credential already bound to another relation
    /// cannot be retargeted.
    pub fn attenuate_to_relation(
        &self,
        existing: &Credential,
        relation_key: &RelationKey,
    ) -> Result<Credential> {
        let mut caveats = self.declared(existing)?;
        match &caveats.relation_key {
            Some(declared) if declared != relation_key => {
                return Err(CredentialError::CaveatMismatch {
                    caveat: "relation-key",
                    declared: declared.to_string(),
                    required: relation_key.to_string(),
                }
                .into());
            }
            _ => caveats.relation_key = Some(relation_key.clone()),
        }
        tracing::debug!(relation = %relation_key, user = %caveats.username, "attenuating credential");
        self.mint(&caveats)
    }

    /// Accept the first credential scoped to `relation_key` and this model
    pub fn check_relation_credential(
        &self,
        credentials: &[Credential],
        relation_key: &RelationKey,
    ) -> Result<DeclaredCaveats> {
        self.check_any(credentials, |caveats| {
            self.require_local_model(caveats)?;
            match &caveats.relation_key {
                Some(declared) if declared == relation_key => Ok(()),
                Some(declared) => Err(CredentialError::CaveatMismatch {
                    caveat: "relation-key",
                    declared: declared.to_string(),
                    required: relation_key.to_string(),
                }),
                None => Err(CredentialError::MissingCaveat("relation-key")),
            }
        })
    }

    /// Accept the first credential naming offer `offer_name` in this model
    pub fn check_offer_credential(
        &self,
        credentials: &[Credential],
        offer_name: &str,
    ) -> Result<DeclaredCaveats> {
        self.check_any(credentials, |caveats| {
            self.require_local_model(caveats)?;
            match &caveats.offer_url {
                Some(url) if url.name == offer_name => Ok(()),
                Some(url) => Err(CredentialError::CaveatMismatch {
                    caveat: "offer-url",
                    declared: url.to_string(),
                    required: offer_name.to_string(),
                }),
                None => Err(CredentialError::MissingCaveat("offer-url")),
            }
        })
    }

    /// Verify signature and expiry, returning the declared caveats
    pub fn declared(&self, credential: &Credential) -> Result<DeclaredCaveats> {
        Ok(self.verify(credential)?)
    }

    fn check_any<F>(&self, credentials: &[Credential], check: F) -> Result<DeclaredCaveats>
    where
        F: Fn(&DeclaredCaveats) -> std::result::Result<(), CredentialError>,
    {
        let mut last_err = CredentialError::NoCredentials;
        for credential in credentials {
            match self.verify(credential).and_then(|caveats| {
                check(&caveats)?;
                Ok(caveats)
            }) {
                Ok(caveats) => return Ok(caveats),
                Err(err) => last_err = err,
            }
        }
        tracing::debug!(error = %last_err, "credential check failed");
        Err(CmrError::from(last_err))
    }

    fn require_local_model(
        &self,
        caveats: &DeclaredCaveats,
    ) -> std::result::Result<(), CredentialError> {
        if caveats.source_model_uuid != self.model_uuid {
            return Err(CredentialError::CaveatMismatch {
                caveat: "source-model-uuid",
                declared: caveats.source_model_uuid.to_string(),
                required: self.model_uuid.to_string(),
            });
        }
        Ok(())
    }

    fn mint(&self, caveats: &DeclaredCaveats) -> Result<Credential> {
        let expiry = self.clock.now() + self.ttl;
        let mint_err = |e: biscuit_auth::error::Token| CredentialError::Mint(e.to_string());

        let mut builder = biscuit!(
            r#"
            source_model_uuid({source_model_uuid});
            username({username});
            check if time($time), $time < {expiry};
        "#,
            source_model_uuid = caveats.source_model_uuid.to_string(),
            username = caveats.username.clone(),
            expiry = expiry
        );
        if let Some(offer_url) = &caveats.offer_url {
            builder
                .add_fact(fact!("offer_url({url})", url = offer_url.to_string()))
                .map_err(mint_err)?;
        }
        if let Some(relation_key) = &caveats.relation_key {
            builder
                .add_fact(fact!("relation_key({key})", key = relation_key.to_string()))
                .map_err(mint_err)?;
        }
        let token = builder.build(&self.root).map_err(mint_err)?;
        let encoded = token.to_base64().map_err(mint_err)?;
        Ok(Credential(encoded))
    }

    fn verify(
        &self,
        credential: &Credential,
    ) -> std::result::Result<DeclaredCaveats, CredentialError> {
        let verification =
            |e: biscuit_auth::error::Token| CredentialError::Verification(e.to_string());

        let token = Biscuit::from_base64(credential.as_str(), self.root.public())
            .map_err(verification)?;

        let mut authorizer = Authorizer::new();
        authorizer.add_token(&token).map_err(verification)?;
        authorizer
            .add_fact(fact!("time({now})", now = self.clock.now()))
            .map_err(verification)?;
        authorizer
            .add_policy(policy!("allow if true;"))
            .map_err(verification)?;
        authorizer.authorize().map_err(verification)?;

        let source_model: Vec<(String,)> = authorizer
            .query(rule!("data($uuid) <- source_model_uuid($uuid);"))
            .map_err(verification)?;
        let username: Vec<(String,)> = authorizer
            .query(rule!("data($name) <- username($name);"))
            .map_err(verification)?;
        let offer_url: Vec<(String,)> = authorizer
            .query(rule!("data($url) <- offer_url($url);"))
            .map_err(verification)?;
        let relation_key: Vec<(String,)> = authorizer
            .query(rule!("data($key) <- relation_key($key);"))
            .map_err(verification)?;

        let source_model_uuid = single(source_model, "source-model-uuid")?
            .ok_or(CredentialError::MissingCaveat("source-model-uuid"))?
            .parse::<ModelUuid>()
            .map_err(|e| CredentialError::Verification(e.to_string()))?;
        let username =
            single(username, "username")?.ok_or(CredentialError::MissingCaveat("username"))?;
        let offer_url = single(offer_url, "offer-url")?
            .map(|url| OfferUrl::parse(&url))
            .transpose()
            .map_err(|e| CredentialError::Verification(e.to_string()))?;
        let relation_key = single(relation_key, "relation-key")?
            .map(|key| RelationKey::parse(&key))
            .transpose()
            .map_err(|e| CredentialError::Verification(e.to_string()))?;

        Ok(DeclaredCaveats {
            source_model_uuid,
            username,
            offer_url,
            relation_key,
        })
    }
}

/// A caveat declared more than once is ambiguous and rejected
fn single(
    values: Vec<(String,)>,
    caveat: &'static str,
) -> std::result::Result<Option<String>, CredentialError> {
    let mut values = values.into_iter().map(|(value,)| value);
    let first = values.next();
    if values.next().is_some() {
        return Err(CredentialError::Verification(format!(
            "{caveat} declared more than once"
        )));
    }
    Ok(first)
}
