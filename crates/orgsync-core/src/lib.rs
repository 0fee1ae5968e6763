//! Core record types and error taxonomy for the orgsync reconciliation pipeline.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "orgsync-core";

/// Entity families synchronized by a run, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityFamily {
    Organizations,
    Employees,
    Orders,
}

impl EntityFamily {
    pub const ALL: [EntityFamily; 3] = [
        EntityFamily::Organizations,
        EntityFamily::Employees,
        EntityFamily::Orders,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityFamily::Organizations => "organizations",
            EntityFamily::Employees => "employees",
            EntityFamily::Orders => "orders",
        }
    }
}

impl fmt::Display for EntityFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy shared by the source reader, the destination session and the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncError {
    #[error("data access failed while {context}: {message}")]
    DataAccess { context: String, message: String },
    #[error("unresolved {entity} reference: {key}")]
    UnresolvedReference { entity: &'static str, key: String },
    #[error("constraint violation on {entity}: {message}")]
    ConstraintViolation { entity: &'static str, message: String },
    #[error("invalid {entity} record: {message}")]
    InvalidRecord { entity: &'static str, message: String },
}

impl SyncError {
    pub fn data_access(context: impl Into<String>, message: impl fmt::Display) -> Self {
        SyncError::DataAccess {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn unresolved(entity: &'static str, key: impl Into<String>) -> Self {
        SyncError::UnresolvedReference {
            entity,
            key: key.into(),
        }
    }

    pub fn constraint(entity: &'static str, message: impl Into<String>) -> Self {
        SyncError::ConstraintViolation {
            entity,
            message: message.into(),
        }
    }

    pub fn invalid(entity: &'static str, message: impl Into<String>) -> Self {
        SyncError::InvalidRecord {
            entity,
            message: message.into(),
        }
    }

    /// Whether a row that failed with this error can be rolled back and skipped.
    /// Data access failures always end the run.
    pub fn is_row_recoverable(&self) -> bool {
        !matches!(self, SyncError::DataAccess { .. })
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

macro_rules! destination_id {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(pub i64);

            impl $name {
                pub fn get(self) -> i64 {
                    self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )+
    };
}

destination_id!(
    /// Surrogate key of an `empresa` row in the destination.
    OrganizationId,
    RoleId,
    UnitId,
    OrderId,
    ProductId,
);

/// Organization as read from the source `empresa` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOrganization {
    pub source_id: i64,
    pub registration_number: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Employee joined to its organization's registration number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEmployee {
    pub source_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub role_name: Option<String>,
    pub status: Option<String>,
    pub email: Option<String>,
    pub organization_registration: String,
}

/// Invoice joined to its organization's registration number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOrder {
    pub source_id: i64,
    pub invoice_code: String,
    pub issued_on: Option<NaiveDate>,
    pub organization_registration: String,
}

/// One product line of an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOrderItem {
    pub product_name: String,
    pub quantity: Option<f64>,
    pub unit_symbol: Option<String>,
    pub ean: String,
}

fn require_key(entity: &'static str, field: &str, value: &str) -> SyncResult<()> {
    if value.trim().is_empty() {
        return Err(SyncError::invalid(entity, format!("{field} is blank")));
    }
    Ok(())
}

impl SourceOrganization {
    pub fn validate(&self) -> SyncResult<()> {
        require_key("organization", "registration number", &self.registration_number)?;
        self.required_name().map(|_| ())
    }

    pub fn required_name(&self) -> SyncResult<&str> {
        self.name.as_deref().ok_or_else(|| {
            SyncError::invalid(
                "organization",
                format!("name of {} is missing", self.registration_number),
            )
        })
    }
}

impl SourceEmployee {
    pub fn validate(&self) -> SyncResult<()> {
        require_key("employee", "first name", &self.first_name)?;
        require_key("employee", "last name", &self.last_name)?;
        match self.role_name.as_deref() {
            Some(role) => require_key("employee", "role name", role),
            None => Err(SyncError::invalid("employee", "role name is missing")),
        }
    }

    pub fn display_key(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

impl SourceOrder {
    pub fn validate(&self) -> SyncResult<()> {
        require_key("order", "invoice code", &self.invoice_code)
    }
}

impl SourceOrderItem {
    pub fn validate(&self) -> SyncResult<()> {
        require_key("order item", "ean", &self.ean)?;
        self.required_quantity()?;
        match self.unit_symbol.as_deref() {
            Some(unit) => require_key("order item", "unit of measure", unit),
            None => Err(SyncError::invalid("order item", "unit of measure is missing")),
        }
    }

    /// Present, finite and non-negative.
    pub fn required_quantity(&self) -> SyncResult<f64> {
        match self.quantity {
            Some(quantity) if quantity.is_finite() && quantity >= 0.0 => Ok(quantity),
            Some(quantity) => Err(SyncError::invalid(
                "order item",
                format!("quantity {quantity} for ean {} is not a non-negative number", self.ean),
            )),
            None => Err(SyncError::invalid(
                "order item",
                format!("quantity for ean {} is missing", self.ean),
            )),
        }
    }
}

/// Canonical stored form of an employee status: uppercase, regardless of source casing.
pub fn canonical_status(status: Option<&str>) -> Option<String> {
    status.map(str::to_uppercase)
}

/// Destination-side write for an `empresa` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationWrite {
    pub registration_number: String,
    pub name: String,
    pub email: Option<String>,
}

/// Destination-side write for a `funcionario` row; foreign keys already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmployeeWrite {
    pub first_name: String,
    pub last_name: String,
    pub role_id: RoleId,
    pub status: Option<String>,
    pub email: Option<String>,
    pub organization_id: OrganizationId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderWrite {
    pub invoice_code: String,
    pub issued_on: Option<NaiveDate>,
    pub organization_id: OrganizationId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductWrite {
    pub ean: String,
    pub organization_id: OrganizationId,
    pub name: String,
    pub quantity: f64,
    pub unit_id: UnitId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItemWrite {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: f64,
}
