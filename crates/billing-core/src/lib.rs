use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Version assigned to a tariff link when it is provisioned.
pub const INITIAL_VERSION: i64 = 1;

/// Entity name reported in conflict details.
pub const TARIFF_LINK_ENTITY: &str = "tariff_link";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("unknown capability: {0}")]
    UnknownCapability(String),
}

/// Field-level validation failures, keyed by the offending request field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, String>);

impl ValidationErrors {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `message` for `field` unless `ok` holds. The first message per field wins.
    pub fn check(&mut self, ok: bool, field: &str, message: &str) {
        if !ok {
            self.0.entry(field.to_string()).or_insert_with(|| message.to_string());
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(field, message)| (field.as_str(), message.as_str()))
    }

    /// Convert into a `Result`, failing when any field was rejected.
    ///
    /// # Errors
    /// Returns the collected errors when at least one check failed.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl Display for ValidationErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (field, message) in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{field}: {message}")?;
            first = false;
        }
        Ok(())
    }
}

macro_rules! integer_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub i64);

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

integer_id!(
    /// Primary key of a tariff link row.
    TariffLinkId
);
integer_id!(AccountId);
integer_id!(TariffId);
integer_id!(
    /// Identity of a back-office operator (the acting user of a mutation).
    OperatorId
);
integer_id!(GroupId);

/// Named permission an operator must hold to call a protected operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Capability {
    #[serde(rename = "accounts.read")]
    AccountsRead,
    #[serde(rename = "tariffs.read")]
    TariffsRead,
    #[serde(rename = "tariffs.update")]
    TariffsUpdate,
}

impl Capability {
    pub const ALL: [Self; 3] = [Self::AccountsRead, Self::TariffsRead, Self::TariffsUpdate];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccountsRead => "accounts.read",
            Self::TariffsRead => "tariffs.read",
            Self::TariffsUpdate => "tariffs.update",
        }
    }

    /// Numeric function id used by legacy rights tables.
    #[must_use]
    pub fn fid(self) -> i64 {
        match self {
            Self::AccountsRead => 1,
            Self::TariffsRead => 2,
            Self::TariffsUpdate => 3,
        }
    }

    /// # Errors
    /// Returns [`CoreError::UnknownCapability`] for names outside [`Capability::ALL`].
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "accounts.read" => Ok(Self::AccountsRead),
            "tariffs.read" => Ok(Self::TariffsRead),
            "tariffs.update" => Ok(Self::TariffsUpdate),
            other => Err(CoreError::UnknownCapability(other.to_string())),
        }
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated operator.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Identity {
    pub id: OperatorId,
    pub login: String,
    pub display_name: String,
}

impl Identity {
    #[must_use]
    pub fn reference(&self) -> IdentityRef {
        IdentityRef { id: self.id, login: self.login.clone() }
    }
}

/// Lookup-only reference to an operator, rendered as id plus display label.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdentityRef {
    pub id: OperatorId,
    pub login: String,
}

/// Tariff assignment of one account, guarded by an optimistic version counter.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TariffLink {
    pub id: TariffLinkId,
    pub account_id: AccountId,
    pub tariff_id: TariffId,
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Operator id of the last mutation; `None` until a tracked operator changes the link.
    pub updated_by: Option<OperatorId>,
    /// Resolved label for `updated_by`, absent when the operator no longer exists.
    pub updated_by_operator: Option<IdentityRef>,
}

/// Request-scoped intent to move a tariff link to a new tariff.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UpdateIntent {
    pub link_id: TariffLinkId,
    pub requested_tariff_id: TariffId,
    pub expected_version: i64,
    pub acting: OperatorId,
}

impl UpdateIntent {
    /// Check the request fields before any store access.
    ///
    /// # Errors
    /// Returns field-level errors for a non-positive `tariff_id` or `version`.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        errors.check(self.requested_tariff_id.0 > 0, "tariff_id", "must be a positive integer");
        errors.check(self.expected_version > 0, "version", "must be a positive integer");
        errors.into_result()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConflictDetails {
    pub entity: String,
    pub id: TariffLinkId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ServerLinkData {
    pub id: TariffLinkId,
    pub account_id: AccountId,
    pub tariff_id: TariffId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ServerLinkMeta {
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub updated_by: Option<IdentityRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ServerSide {
    pub data: ServerLinkData,
    pub meta: ServerLinkMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClientLinkData {
    pub tariff_id: TariffId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClientLinkMeta {
    pub expected_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClientSide {
    pub data: ClientLinkData,
    pub meta: ClientLinkMeta,
}

/// Both sides of a rejected conditional update: the current server row and
/// what the caller tried to write.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConflictReport {
    pub details: ConflictDetails,
    pub server: ServerSide,
    pub client: ClientSide,
}

impl ConflictReport {
    #[must_use]
    pub fn new(current: &TariffLink, client_tariff_id: TariffId, expected_version: i64) -> Self {
        Self {
            details: ConflictDetails { entity: TARIFF_LINK_ENTITY.to_string(), id: current.id },
            server: ServerSide {
                data: ServerLinkData {
                    id: current.id,
                    account_id: current.account_id,
                    tariff_id: current.tariff_id,
                },
                meta: ServerLinkMeta {
                    version: current.version,
                    updated_at: current.updated_at,
                    updated_by: current.updated_by_operator.clone(),
                },
            },
            client: ClientSide {
                data: ClientLinkData { tariff_id: client_tariff_id },
                meta: ClientLinkMeta { expected_version },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(tariff_id: i64, expected_version: i64) -> UpdateIntent {
        UpdateIntent {
            link_id: TariffLinkId(7),
            requested_tariff_id: TariffId(tariff_id),
            expected_version,
            acting: OperatorId(1),
        }
    }

    fn fixture_link() -> TariffLink {
        TariffLink {
            id: TariffLinkId(7),
            account_id: AccountId(70),
            tariff_id: TariffId(2),
            version: 4,
            updated_at: OffsetDateTime::UNIX_EPOCH,
            updated_by: Some(OperatorId(3)),
            updated_by_operator: Some(IdentityRef { id: OperatorId(3), login: "olga".to_string() }),
        }
    }

    #[test]
    fn valid_intent_passes_validation() {
        assert_eq!(intent(5, 3).validate(), Ok(()));
    }

    #[test]
    fn zero_tariff_is_rejected_on_tariff_field_only() {
        let errors = match intent(0, 3).validate() {
            Ok(()) => panic!("expected tariff_id to be rejected"),
            Err(errors) => errors,
        };
        assert_eq!(errors.get("tariff_id"), Some("must be a positive integer"));
        assert_eq!(errors.get("version"), None);
    }

    #[test]
    fn negative_values_report_every_offending_field() {
        let errors = match intent(-1, 0).validate() {
            Ok(()) => panic!("expected both fields to be rejected"),
            Err(errors) => errors,
        };
        let fields = errors.fields().map(|(field, _)| field).collect::<Vec<_>>();
        assert_eq!(fields, vec!["tariff_id", "version"]);
        assert_eq!(
            errors.to_string(),
            "tariff_id: must be a positive integer; version: must be a positive integer"
        );
    }

    #[test]
    fn capability_names_parse_and_unknown_names_fail() {
        for capability in Capability::ALL {
            assert_eq!(Capability::parse(capability.as_str()), Ok(capability));
        }
        assert_eq!(
            Capability::parse("tariffs.delete"),
            Err(CoreError::UnknownCapability("tariffs.delete".to_string()))
        );
        assert_eq!(Capability::TariffsUpdate.fid(), 3);
    }

    #[test]
    fn conflict_report_carries_server_state_and_client_attempt() {
        let report = ConflictReport::new(&fixture_link(), TariffId(9), 3);

        assert_eq!(report.details.entity, "tariff_link");
        assert_eq!(report.server.data.tariff_id, TariffId(2));
        assert_eq!(report.server.meta.version, 4);
        assert_eq!(
            report.server.meta.updated_by.as_ref().map(|operator| operator.login.as_str()),
            Some("olga")
        );
        assert_eq!(report.client.data.tariff_id, TariffId(9));
        assert_eq!(report.client.meta.expected_version, 3);
    }

    #[test]
    fn conflict_report_serializes_with_nested_sections() {
        let value = match serde_json::to_value(ConflictReport::new(&fixture_link(), TariffId(9), 3))
        {
            Ok(value) => value,
            Err(err) => panic!("conflict report should serialize: {err}"),
        };

        assert_eq!(value["server"]["data"]["account_id"], 70);
        assert_eq!(value["server"]["meta"]["updated_at"], "1970-01-01T00:00:00Z");
        assert_eq!(value["client"]["meta"]["expected_version"], 3);
    }
}
