//! Human-readable document numbers: `PREFIX-YYMMDD-<org suffix>-<random>`.
//!
//! Numbers are unique per organization. Each one is claimed by a
//! `NumberClaim` document staged in the same unit of work as the document it
//! names, so two operations drawing the same number cannot both commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use stockledger_core::{DomainError, OrganizationId};

use crate::dispatcher::DispatchError;
use crate::store::{Document, InventoryStore};
use crate::unit_of_work::UnitOfWork;

/// Fresh numbers drawn before giving up on a unit of work.
const MAX_DRAWS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentPrefix {
    Invoice,
    Purchase,
    Transfer,
}

impl DocumentPrefix {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentPrefix::Invoice => "INV",
            DocumentPrefix::Purchase => "PUR",
            DocumentPrefix::Transfer => "TRF",
        }
    }
}

pub fn document_number(
    prefix: DocumentPrefix,
    organization_id: OrganizationId,
    at: DateTime<Utc>,
) -> String {
    let org = organization_id.to_string();
    let suffix = &org[org.len().saturating_sub(4)..];
    // The tail of a v7 uuid is random.
    let bytes = Uuid::now_v7().into_bytes();
    format!(
        "{}-{}-{}-{:02X}{:02X}{:02X}{:02X}",
        prefix.as_str(),
        at.format("%y%m%d"),
        suffix,
        bytes[12],
        bytes[13],
        bytes[14],
        bytes[15]
    )
}

/// Marker document reserving one number inside an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberClaim {
    pub organization_id: OrganizationId,
    pub number: String,
    pub prefix: DocumentPrefix,
    pub claimed_at: DateTime<Utc>,
}

impl Document for NumberClaim {
    const KIND: &'static str = "document_number";
    type Key = String;

    fn document_key(&self) -> String {
        self.number.clone()
    }

    fn owner(&self) -> Option<OrganizationId> {
        Some(self.organization_id)
    }
}

/// Draw a number that is not taken yet and stage its claim.
pub async fn claim_document_number<S>(
    uow: &mut UnitOfWork<'_, S>,
    prefix: DocumentPrefix,
    at: DateTime<Utc>,
) -> Result<String, DispatchError>
where
    S: InventoryStore + ?Sized,
{
    let organization_id = uow.organization_id();
    claim_with(uow, prefix, at, || document_number(prefix, organization_id, at)).await
}

async fn claim_with<S>(
    uow: &mut UnitOfWork<'_, S>,
    prefix: DocumentPrefix,
    at: DateTime<Utc>,
    mut draw: impl Send + FnMut() -> String,
) -> Result<String, DispatchError>
where
    S: InventoryStore + ?Sized,
{
    let organization_id = uow.organization_id();
    for _ in 0..MAX_DRAWS {
        let number = draw();
        if uow.load::<NumberClaim>(&number).await?.is_some() {
            debug!(%number, "document number taken, drawing another");
            continue;
        }
        uow.stage(&NumberClaim {
            organization_id,
            number: number.clone(),
            prefix,
            claimed_at: at,
        })?;
        return Ok(number);
    }
    Err(DomainError::conflict(format!(
        "no free {} number after {MAX_DRAWS} draws",
        prefix.as_str()
    ))
    .into())
}
