use std::path::PathBuf;
use std::time::Duration;

use billing_core::{
    AccountId, Capability, ConflictReport, Identity, TariffId, TariffLink, TariffLinkId,
    UpdateIntent, ValidationErrors,
};
use billing_store_sqlite::{SchemaStatus, SqliteStore, UpdateOutcome};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod auth;
mod error;

pub use error::ApiError;

use crate::auth::TokenIssuer;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Default lifetime of an access token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct BillingConfig {
    pub db_path: PathBuf,
    pub store_timeout: Duration,
    pub jwt_secret: String,
    pub token_ttl: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoginRequest {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginResult {
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub operator: Identity,
    pub capabilities: Vec<Capability>,
}

/// Body of a tariff change; `version` is the version the caller last saw.
/// Missing fields decode as zero and are reported by validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChangeTariffRequest {
    pub tariff_id: i64,
    pub version: i64,
}

impl ChangeTariffRequest {
    #[must_use]
    pub fn into_intent(self, link_id: TariffLinkId, acting: &Identity) -> UpdateIntent {
        UpdateIntent {
            link_id,
            requested_tariff_id: TariffId(self.tariff_id),
            expected_version: self.version,
            acting: acting.id,
        }
    }
}

/// Request-independent service object. Cheap to clone; every call opens its
/// own store connection, so clones can serve concurrent requests.
#[derive(Debug, Clone)]
pub struct BillingApi {
    db_path: PathBuf,
    store_timeout: Duration,
    tokens: TokenIssuer,
}

impl BillingApi {
    /// # Errors
    /// Returns an error when the token signing secret is empty.
    pub fn new(config: BillingConfig) -> anyhow::Result<Self> {
        if auth::dummy_password_hash().is_none() {
            return Err(anyhow::anyhow!("failed to prepare password verification"));
        }

        Ok(Self {
            tokens: TokenIssuer::new(&config.jwt_secret, config.token_ttl)?,
            db_path: config.db_path,
            store_timeout: config.store_timeout,
        })
    }

    fn open_store(&self) -> Result<SqliteStore, ApiError> {
        Ok(SqliteStore::open_with_timeout(&self.db_path, self.store_timeout)?)
    }

    /// Bring the database schema up to date.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn migrate(&self) -> Result<SchemaStatus, ApiError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store.schema_status()?)
    }

    /// Exchange operator credentials for an access token.
    ///
    /// # Errors
    /// Returns `Validation` for empty fields and `InvalidCredentials` for an
    /// unknown login or a wrong password alike.
    pub fn login(&self, request: &LoginRequest) -> Result<LoginResult, ApiError> {
        let mut errors = ValidationErrors::new();
        errors.check(!request.login.trim().is_empty(), "login", "must be provided");
        errors.check(!request.password.is_empty(), "password", "must be provided");
        errors.into_result()?;

        let store = self.open_store()?;
        let Some(record) = store.operator_by_login(&request.login)? else {
            if let Some(hash) = auth::dummy_password_hash() {
                auth::verify_password(&request.password, hash)?;
            }
            tracing::info!(login = %request.login, "login rejected: unknown operator");
            return Err(ApiError::InvalidCredentials);
        };
        if !auth::verify_password(&request.password, &record.password_hash)? {
            tracing::info!(login = %request.login, "login rejected: wrong password");
            return Err(ApiError::InvalidCredentials);
        }

        let capabilities = store.capabilities_for(record.identity.id)?;
        let issued = self.tokens.issue(&record.identity)?;
        tracing::info!(operator_id = record.identity.id.0, "operator logged in");
        Ok(LoginResult {
            token: issued.token,
            expires_at: issued.expires_at,
            operator: record.identity,
            capabilities,
        })
    }

    /// Resolve a bearer token to the operator it was issued for.
    ///
    /// # Errors
    /// Returns `Unauthorized` when the token does not verify or its operator no longer exists.
    pub fn authenticate(&self, token: &str) -> Result<Identity, ApiError> {
        let claims = self.tokens.verify(token)?;
        let operator_id = claims.operator_id()?;
        let store = self.open_store()?;
        store.operator_by_id(operator_id)?.ok_or(ApiError::Unauthorized)
    }

    /// # Errors
    /// Returns an error when the permission lookup fails.
    pub fn authorize(&self, identity: &Identity, capability: Capability) -> Result<bool, ApiError> {
        let store = self.open_store()?;
        Ok(store.has_capability(identity.id, capability)?)
    }

    /// Authenticate and authorize in one step. Runs before any tariff link
    /// access, so a rejection reveals nothing about the target record.
    ///
    /// # Errors
    /// Returns `Unauthorized` or `Forbidden` when the gate rejects the caller.
    pub fn require_capability(
        &self,
        token: &str,
        capability: Capability,
    ) -> Result<Identity, ApiError> {
        let identity = self.authenticate(token)?;
        if !self.authorize(&identity, capability)? {
            tracing::info!(operator_id = identity.id.0, %capability, "capability check failed");
            return Err(ApiError::Forbidden(capability));
        }
        Ok(identity)
    }

    /// # Errors
    /// Returns `NotFound` when no link has `id`.
    pub fn tariff_link(&self, id: TariffLinkId) -> Result<TariffLink, ApiError> {
        let store = self.open_store()?;
        store.get_tariff_link(id)?.ok_or(ApiError::NotFound { entity: "tariff_link" })
    }

    /// # Errors
    /// Returns `NotFound` when the account has no tariff link.
    pub fn tariff_link_for_account(&self, account_id: AccountId) -> Result<TariffLink, ApiError> {
        let store = self.open_store()?;
        store
            .get_tariff_link_by_account(account_id)?
            .ok_or(ApiError::NotFound { entity: "tariff_link" })
    }

    /// Apply `intent` under optimistic concurrency and return the canonical
    /// server view of the link. Makes at most one mutation attempt; a lost race
    /// comes back as `Conflict` carrying server and client state.
    ///
    /// # Errors
    /// Returns `Validation` before touching the store, `NotFound`, `Conflict`,
    /// `Transient` on lock timeout, or `Internal`.
    pub fn change_tariff(&self, intent: &UpdateIntent) -> Result<TariffLink, ApiError> {
        intent.validate()?;

        let mut store = self.open_store()?;
        let outcome = store.conditional_update(
            intent.link_id,
            intent.requested_tariff_id,
            intent.expected_version,
            intent.acting,
        )?;

        match outcome {
            UpdateOutcome::Applied { version, .. } => {
                tracing::info!(
                    link_id = intent.link_id.0,
                    tariff_id = intent.requested_tariff_id.0,
                    version,
                    operator_id = intent.acting.0,
                    "tariff changed"
                );
                store.get_tariff_link(intent.link_id)?.ok_or_else(|| {
                    ApiError::Internal(anyhow::anyhow!(
                        "tariff link {} vanished right after update",
                        intent.link_id
                    ))
                })
            }
            UpdateOutcome::Conflict => {
                let report = report_conflict(
                    &store,
                    intent.link_id,
                    intent.requested_tariff_id,
                    intent.expected_version,
                )?;
                tracing::info!(
                    link_id = intent.link_id.0,
                    expected_version = intent.expected_version,
                    server_version = report.server.meta.version,
                    "tariff change rejected: version conflict"
                );
                Err(ApiError::Conflict(Box::new(report)))
            }
            UpdateOutcome::NotFound => Err(ApiError::NotFound { entity: "tariff_link" }),
        }
    }
}

/// Re-read the current row after a failed conditional update. A `Conflict`
/// means the row existed a moment ago, so its absence here is a server error.
fn report_conflict(
    store: &SqliteStore,
    id: TariffLinkId,
    client_tariff_id: TariffId,
    expected_version: i64,
) -> Result<ConflictReport, ApiError> {
    let current = store.get_tariff_link(id)?.ok_or_else(|| {
        ApiError::Internal(anyhow::anyhow!("tariff link {id} vanished after a version conflict"))
    })?;
    Ok(ConflictReport::new(&current, client_tariff_id, expected_version))
}
