use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use orgsync_core::{
    EmployeeWrite, OrderId, OrderItemWrite, OrderWrite, OrganizationId, OrganizationWrite,
    ProductId, ProductWrite, RoleId, SyncError, SyncResult, UnitId,
};

use crate::DestinationSession;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredOrganization {
    pub id: i64,
    pub registration_number: String,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRole {
    pub id: i64,
    pub name: String,
    pub organization_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredUnit {
    pub id: i64,
    pub symbol: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEmployee {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub role_id: i64,
    pub status: Option<String>,
    pub email: Option<String>,
    pub organization_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredOrder {
    pub id: i64,
    pub invoice_code: String,
    pub issued_on: Option<NaiveDate>,
    pub organization_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredProduct {
    pub id: i64,
    pub ean: String,
    pub organization_id: i64,
    pub name: String,
    pub quantity: f64,
    pub unit_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredOrderItem {
    pub id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub quantity: f64,
}

/// Snapshot of every destination table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryState {
    pub organizations: Vec<StoredOrganization>,
    pub roles: Vec<StoredRole>,
    pub units: Vec<StoredUnit>,
    pub employees: Vec<StoredEmployee>,
    pub orders: Vec<StoredOrder>,
    pub products: Vec<StoredProduct>,
    pub order_items: Vec<StoredOrderItem>,
}

impl MemoryState {
    /// Row counts in table order: organizations, roles, units, employees, orders, products, items.
    pub fn row_counts(&self) -> [usize; 7] {
        [
            self.organizations.len(),
            self.roles.len(),
            self.units.len(),
            self.employees.len(),
            self.orders.len(),
            self.products.len(),
            self.order_items.len(),
        ]
    }

    pub fn organization(&self, registration_number: &str) -> Option<&StoredOrganization> {
        self.organizations
            .iter()
            .find(|o| o.registration_number == registration_number)
    }

    pub fn employee(&self, first_name: &str, last_name: &str) -> Option<&StoredEmployee> {
        self.employees
            .iter()
            .find(|e| e.first_name == first_name && e.last_name == last_name)
    }

    fn has_organization(&self, id: i64) -> bool {
        self.organizations.iter().any(|o| o.id == id)
    }
}

fn next_id<T>(rows: &[T], id_of: impl Fn(&T) -> i64) -> i64 {
    rows.iter().map(id_of).max().unwrap_or(0) + 1
}

fn missing_parent(entity: &'static str, parent: &str, id: i64) -> SyncError {
    SyncError::constraint(entity, format!("{parent} {id} does not exist"))
}

/// In-memory destination with the same merge, uniqueness and foreign-key semantics as the
/// PostgreSQL schema. Uncommitted writes live in a working copy until `commit`.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    committed: MemoryState,
    working: MemoryState,
    row_savepoint: Option<MemoryState>,
    calls: HashMap<&'static str, usize>,
    commits: usize,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from pre-existing committed rows.
    pub fn with_state(state: MemoryState) -> Self {
        Self {
            committed: state.clone(),
            working: state,
            ..Self::default()
        }
    }

    pub fn committed(&self) -> &MemoryState {
        &self.committed
    }

    pub fn pending(&self) -> &MemoryState {
        &self.working
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    /// How many times the named session operation was invoked.
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.get(operation).copied().unwrap_or(0)
    }

    fn record(&mut self, operation: &'static str) {
        *self.calls.entry(operation).or_default() += 1;
    }
}

#[async_trait]
impl DestinationSession for MemoryDestination {
    async fn find_organization_id(&mut self, registration_number: &str) -> SyncResult<Option<OrganizationId>> {
        self.record("find_organization_id");
        Ok(self
            .working
            .organization(registration_number)
            .map(|o| OrganizationId(o.id)))
    }

    async fn upsert_organization(&mut self, row: &OrganizationWrite) -> SyncResult<OrganizationId> {
        self.record("upsert_organization");
        let state = &mut self.working;
        if let Some(existing) = state
            .organizations
            .iter_mut()
            .find(|o| o.registration_number == row.registration_number)
        {
            existing.name = row.name.clone();
            existing.email = row.email.clone();
            return Ok(OrganizationId(existing.id));
        }
        let id = next_id(&state.organizations, |o| o.id);
        state.organizations.push(StoredOrganization {
            id,
            registration_number: row.registration_number.clone(),
            name: row.name.clone(),
            email: row.email.clone(),
        });
        Ok(OrganizationId(id))
    }

    async fn find_role_id(&mut self, name: &str, organization: OrganizationId) -> SyncResult<Option<RoleId>> {
        self.record("find_role_id");
        Ok(self
            .working
            .roles
            .iter()
            .find(|r| r.name == name && r.organization_id == organization.get())
            .map(|r| RoleId(r.id)))
    }

    async fn insert_role(&mut self, name: &str, organization: OrganizationId) -> SyncResult<RoleId> {
        self.record("insert_role");
        let state = &mut self.working;
        if !state.has_organization(organization.get()) {
            return Err(missing_parent("role", "organization", organization.get()));
        }
        if let Some(existing) = state
            .roles
            .iter()
            .find(|r| r.name == name && r.organization_id == organization.get())
        {
            return Ok(RoleId(existing.id));
        }
        let id = next_id(&state.roles, |r| r.id);
        state.roles.push(StoredRole {
            id,
            name: name.to_string(),
            organization_id: organization.get(),
        });
        Ok(RoleId(id))
    }

    async fn find_unit_id(&mut self, symbol: &str) -> SyncResult<Option<UnitId>> {
        self.record("find_unit_id");
        Ok(self
            .working
            .units
            .iter()
            .find(|u| u.symbol == symbol)
            .map(|u| UnitId(u.id)))
    }

    async fn insert_unit(&mut self, symbol: &str) -> SyncResult<UnitId> {
        self.record("insert_unit");
        let state = &mut self.working;
        if let Some(existing) = state.units.iter().find(|u| u.symbol == symbol) {
            return Ok(UnitId(existing.id));
        }
        let id = next_id(&state.units, |u| u.id);
        state.units.push(StoredUnit {
            id,
            symbol: symbol.to_string(),
        });
        Ok(UnitId(id))
    }

    async fn upsert_employee(&mut self, row: &EmployeeWrite) -> SyncResult<()> {
        self.record("upsert_employee");
        let state = &mut self.working;
        if !state.has_organization(row.organization_id.get()) {
            return Err(missing_parent("employee", "organization", row.organization_id.get()));
        }
        if !state.roles.iter().any(|r| r.id == row.role_id.get()) {
            return Err(missing_parent("employee", "role", row.role_id.get()));
        }
        if let Some(existing) = state
            .employees
            .iter_mut()
            .find(|e| e.first_name == row.first_name && e.last_name == row.last_name)
        {
            existing.email = row.email.clone();
            existing.role_id = row.role_id.get();
            existing.status = row.status.clone();
            existing.organization_id = row.organization_id.get();
            return Ok(());
        }
        let id = next_id(&state.employees, |e| e.id);
        state.employees.push(StoredEmployee {
            id,
            first_name: row.first_name.clone(),
            last_name: row.last_name.clone(),
            role_id: row.role_id.get(),
            status: row.status.clone(),
            email: row.email.clone(),
            organization_id: row.organization_id.get(),
        });
        Ok(())
    }

    async fn upsert_order(&mut self, row: &OrderWrite) -> SyncResult<OrderId> {
        self.record("upsert_order");
        let state = &mut self.working;
        if !state.has_organization(row.organization_id.get()) {
            return Err(missing_parent("order", "organization", row.organization_id.get()));
        }
        if let Some(existing) = state
            .orders
            .iter_mut()
            .find(|o| o.invoice_code == row.invoice_code)
        {
            existing.organization_id = row.organization_id.get();
            existing.issued_on = row.issued_on;
            return Ok(OrderId(existing.id));
        }
        let id = next_id(&state.orders, |o| o.id);
        state.orders.push(StoredOrder {
            id,
            invoice_code: row.invoice_code.clone(),
            issued_on: row.issued_on,
            organization_id: row.organization_id.get(),
        });
        Ok(OrderId(id))
    }

    async fn find_product_id(&mut self, ean: &str, organization: OrganizationId) -> SyncResult<Option<ProductId>> {
        self.record("find_product_id");
        Ok(self
            .working
            .products
            .iter()
            .find(|p| p.ean == ean && p.organization_id == organization.get())
            .map(|p| ProductId(p.id)))
    }

    async fn insert_product(&mut self, row: &ProductWrite) -> SyncResult<ProductId> {
        self.record("insert_product");
        let state = &mut self.working;
        if !state.has_organization(row.organization_id.get()) {
            return Err(missing_parent("product", "organization", row.organization_id.get()));
        }
        if !state.units.iter().any(|u| u.id == row.unit_id.get()) {
            return Err(missing_parent("product", "unit of measure", row.unit_id.get()));
        }
        if state
            .products
            .iter()
            .any(|p| p.ean == row.ean && p.organization_id == row.organization_id.get())
        {
            return Err(SyncError::constraint(
                "product",
                format!(
                    "duplicate key (codigo_ean, empresa_id) = ({}, {})",
                    row.ean, row.organization_id
                ),
            ));
        }
        let id = next_id(&state.products, |p| p.id);
        state.products.push(StoredProduct {
            id,
            ean: row.ean.clone(),
            organization_id: row.organization_id.get(),
            name: row.name.clone(),
            quantity: row.quantity,
            unit_id: row.unit_id.get(),
        });
        Ok(ProductId(id))
    }

    async fn upsert_order_item(&mut self, row: &OrderItemWrite) -> SyncResult<()> {
        self.record("upsert_order_item");
        let state = &mut self.working;
        if !state.orders.iter().any(|o| o.id == row.order_id.get()) {
            return Err(missing_parent("order item", "order", row.order_id.get()));
        }
        if !state.products.iter().any(|p| p.id == row.product_id.get()) {
            return Err(missing_parent("order item", "product", row.product_id.get()));
        }
        if let Some(existing) = state
            .order_items
            .iter_mut()
            .find(|i| i.order_id == row.order_id.get() && i.product_id == row.product_id.get())
        {
            existing.quantity = row.quantity;
            return Ok(());
        }
        let id = next_id(&state.order_items, |i| i.id);
        state.order_items.push(StoredOrderItem {
            id,
            order_id: row.order_id.get(),
            product_id: row.product_id.get(),
            quantity: row.quantity,
        });
        Ok(())
    }

    async fn begin_row(&mut self) -> SyncResult<()> {
        self.row_savepoint = Some(self.working.clone());
        Ok(())
    }

    async fn release_row(&mut self) -> SyncResult<()> {
        self.row_savepoint = None;
        Ok(())
    }

    async fn rollback_row(&mut self) -> SyncResult<()> {
        if let Some(snapshot) = self.row_savepoint.take() {
            self.working = snapshot;
        }
        Ok(())
    }

    async fn commit(&mut self) -> SyncResult<()> {
        self.committed = self.working.clone();
        self.row_savepoint = None;
        self.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> SyncResult<()> {
        self.working = self.committed.clone();
        self.row_savepoint = None;
        Ok(())
    }
}
