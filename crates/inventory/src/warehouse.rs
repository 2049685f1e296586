use serde::{Deserialize, Serialize};

use stockledger_core::{BranchId, DomainError, DomainResult, OrganizationId, WarehouseId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWarehouse {
    pub organization_id: OrganizationId,
    pub warehouse_id: WarehouseId,
    pub branch_id: BranchId,
    pub name: String,
    pub code: String,
}

/// Warehouse reference data. Every stock record lives in exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warehouse {
    id: WarehouseId,
    organization_id: OrganizationId,
    branch_id: BranchId,
    name: String,
    code: String,
    is_active: bool,
}

impl Warehouse {
    pub fn create(input: NewWarehouse) -> DomainResult<Self> {
        if input.name.trim().is_empty() {
            return Err(DomainError::validation("warehouse name cannot be empty"));
        }
        let code = input.code.trim().to_uppercase();
        if code.is_empty() {
            return Err(DomainError::validation("warehouse code cannot be empty"));
        }
        Ok(Self {
            id: input.warehouse_id,
            organization_id: input.organization_id,
            branch_id: input.branch_id,
            name: input.name.trim().to_string(),
            code,
            is_active: true,
        })
    }

    pub fn id(&self) -> WarehouseId {
        self.id
    }

    pub fn organization_id(&self) -> OrganizationId {
        self.organization_id
    }

    pub fn branch_id(&self) -> BranchId {
        self.branch_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn deactivate(&mut self) {
        self.is_active = false;
    }

    pub fn ensure_active(&self) -> DomainResult<()> {
        if !self.is_active {
            return Err(DomainError::validation(format!(
                "warehouse {} is inactive",
                self.code
            )));
        }
        Ok(())
    }
}
