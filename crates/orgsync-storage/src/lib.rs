//! Destination session: lookups, merges and transaction boundaries against the target schema.

use anyhow::Context;
use async_trait::async_trait;
use orgsync_core::{
    EmployeeWrite, OrderId, OrderItemWrite, OrderWrite, OrganizationId, OrganizationWrite,
    ProductId, ProductWrite, RoleId, SyncError, SyncResult, UnitId,
};
use sqlx::error::ErrorKind;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::{Executor, PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};

mod memory;

pub use memory::{
    MemoryDestination, MemoryState, StoredEmployee, StoredOrder, StoredOrderItem,
    StoredOrganization, StoredProduct, StoredRole, StoredUnit,
};

pub const CRATE_NAME: &str = "orgsync-storage";

/// Read-write handle on the destination, passed explicitly to every pipeline component.
///
/// All calls between two `commit`/`rollback` calls share one transaction scope. Only the
/// orchestrator ends a scope; lookups and merges never commit on their own.
#[async_trait]
pub trait DestinationSession: Send {
    async fn find_organization_id(&mut self, registration_number: &str) -> SyncResult<Option<OrganizationId>>;

    /// Update-or-insert keyed by registration number, returning the row's id.
    async fn upsert_organization(&mut self, row: &OrganizationWrite) -> SyncResult<OrganizationId>;

    async fn find_role_id(&mut self, name: &str, organization: OrganizationId) -> SyncResult<Option<RoleId>>;

    async fn insert_role(&mut self, name: &str, organization: OrganizationId) -> SyncResult<RoleId>;

    async fn find_unit_id(&mut self, symbol: &str) -> SyncResult<Option<UnitId>>;

    async fn insert_unit(&mut self, symbol: &str) -> SyncResult<UnitId>;

    /// Update-or-insert keyed by (first name, last name).
    async fn upsert_employee(&mut self, row: &EmployeeWrite) -> SyncResult<()>;

    /// Update-or-insert keyed by invoice code, returning the row's id.
    async fn upsert_order(&mut self, row: &OrderWrite) -> SyncResult<OrderId>;

    async fn find_product_id(&mut self, ean: &str, organization: OrganizationId) -> SyncResult<Option<ProductId>>;

    async fn insert_product(&mut self, row: &ProductWrite) -> SyncResult<ProductId>;

    /// Update-or-insert keyed by (order, product).
    async fn upsert_order_item(&mut self, row: &OrderItemWrite) -> SyncResult<()>;

    /// Opens a savepoint covering the writes of a single source row.
    async fn begin_row(&mut self) -> SyncResult<()>;

    async fn release_row(&mut self) -> SyncResult<()>;

    async fn rollback_row(&mut self) -> SyncResult<()>;

    async fn commit(&mut self) -> SyncResult<()>;

    async fn rollback(&mut self) -> SyncResult<()>;
}

/// Maps a sqlx failure into the sync taxonomy. Integrity violations are constraint errors;
/// everything else is a data access failure.
pub fn classify_sqlx_error(entity: &'static str, context: &str, err: sqlx::Error) -> SyncError {
    if let sqlx::Error::Database(db) = &err {
        if matches!(
            db.kind(),
            ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation
        ) {
            return SyncError::constraint(entity, db.message().to_string());
        }
    }
    SyncError::data_access(context, err)
}

/// Creates the destination tables if they are missing.
pub async fn apply_destination_schema(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("applying destination schema migrations")?;
    Ok(())
}

const UPSERT_ORGANIZATION_SQL: &str = r#"
    INSERT INTO empresa (cnpj, nome, email)
    VALUES ($1, $2, $3)
    ON CONFLICT (cnpj) DO UPDATE
       SET nome = EXCLUDED.nome
         , email = EXCLUDED.email
    RETURNING id
"#;

// Lookup rows are never rewritten. On conflict no row comes back and the caller re-reads the
// existing id.
const INSERT_ROLE_SQL: &str = r#"
    INSERT INTO funcao (nome, empresa_id)
    VALUES ($1, $2)
    ON CONFLICT (nome, empresa_id) DO NOTHING
    RETURNING id
"#;

const INSERT_UNIT_SQL: &str = r#"
    INSERT INTO unidade_medida (sigla)
    VALUES ($1)
    ON CONFLICT (sigla) DO NOTHING
    RETURNING id
"#;

const UPSERT_EMPLOYEE_SQL: &str = r#"
    INSERT INTO funcionario (nome, sobrenome, funcao_id, status, email, empresa_id)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (nome, sobrenome) DO UPDATE
       SET email = EXCLUDED.email
         , funcao_id = EXCLUDED.funcao_id
         , status = EXCLUDED.status
         , empresa_id = EXCLUDED.empresa_id
"#;

const UPSERT_ORDER_SQL: &str = r#"
    INSERT INTO pedido (empresa_id, cod_nota_fiscal, data_compra)
    VALUES ($1, $2, $3)
    ON CONFLICT (cod_nota_fiscal) DO UPDATE
       SET empresa_id = EXCLUDED.empresa_id
         , data_compra = EXCLUDED.data_compra
    RETURNING id
"#;

const INSERT_PRODUCT_SQL: &str = r#"
    INSERT INTO produto (nome, quantidade, unidade_medida_id, empresa_id, codigo_ean)
    VALUES ($1, $2, $3, $4, $5)
    RETURNING id
"#;

const UPSERT_ORDER_ITEM_SQL: &str = r#"
    INSERT INTO item_pedido (pedido_id, produto_id, quantidade)
    VALUES ($1, $2, $3)
    ON CONFLICT (pedido_id, produto_id) DO UPDATE
       SET quantidade = EXCLUDED.quantidade
"#;

const SAVEPOINT_ROW_SQL: &str = "SAVEPOINT orgsync_row";
const RELEASE_ROW_SQL: &str = "RELEASE SAVEPOINT orgsync_row";
const ROLLBACK_ROW_SQL: &str = "ROLLBACK TO SAVEPOINT orgsync_row";

/// PostgreSQL destination session. Holds at most one open transaction; the next one is
/// started lazily by the first statement after a commit or rollback.
pub struct PgDestination {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgDestination {
    pub async fn connect(database_url: &str) -> SyncResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(|err| SyncError::data_access("connecting to destination database", err))?;
        info!("connected to destination database");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool, tx: None }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn conn(&mut self) -> SyncResult<&mut PgConnection> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => self
                .pool
                .begin()
                .await
                .map_err(|err| SyncError::data_access("opening destination transaction", err))?,
        };
        Ok(&mut **self.tx.insert(tx))
    }

    async fn fetch_id(
        &mut self,
        entity: &'static str,
        context: &str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> SyncResult<i64> {
        let conn = self.conn().await?;
        let row = query
            .fetch_one(conn)
            .await
            .map_err(|err| classify_sqlx_error(entity, context, err))?;
        row.try_get("id")
            .map_err(|err| SyncError::data_access(context.to_string(), err))
    }

    async fn fetch_optional_id(
        &mut self,
        entity: &'static str,
        context: &str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> SyncResult<Option<i64>> {
        let conn = self.conn().await?;
        let row = query
            .fetch_optional(conn)
            .await
            .map_err(|err| classify_sqlx_error(entity, context, err))?;
        row.map(|row| row.try_get("id"))
            .transpose()
            .map_err(|err| SyncError::data_access(context.to_string(), err))
    }

    async fn execute(
        &mut self,
        entity: &'static str,
        context: &str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> SyncResult<()> {
        let conn = self.conn().await?;
        query
            .execute(conn)
            .await
            .map_err(|err| classify_sqlx_error(entity, context, err))?;
        Ok(())
    }

    /// Savepoint statements go over the simple query protocol, like sqlx's own nested
    /// transactions.
    async fn savepoint(&mut self, statement: &'static str) -> SyncResult<()> {
        let conn = self.conn().await?;
        conn.execute(statement)
            .await
            .map_err(|err| SyncError::data_access(format!("running `{statement}`"), err))?;
        Ok(())
    }
}

#[async_trait]
impl DestinationSession for PgDestination {
    async fn find_organization_id(&mut self, registration_number: &str) -> SyncResult<Option<OrganizationId>> {
        let query = sqlx::query("SELECT id FROM empresa WHERE cnpj = $1").bind(registration_number);
        let id = self
            .fetch_optional_id("organization", "looking up destination organization", query)
            .await?;
        Ok(id.map(OrganizationId))
    }

    async fn upsert_organization(&mut self, row: &OrganizationWrite) -> SyncResult<OrganizationId> {
        let query = sqlx::query(UPSERT_ORGANIZATION_SQL)
            .bind(&row.registration_number)
            .bind(&row.name)
            .bind(&row.email);
        let id = self
            .fetch_id("organization", "merging organization", query)
            .await?;
        Ok(OrganizationId(id))
    }

    async fn find_role_id(&mut self, name: &str, organization: OrganizationId) -> SyncResult<Option<RoleId>> {
        let query = sqlx::query("SELECT id FROM funcao WHERE nome = $1 AND empresa_id = $2")
            .bind(name)
            .bind(organization.get());
        let id = self.fetch_optional_id("role", "looking up role", query).await?;
        Ok(id.map(RoleId))
    }

    async fn insert_role(&mut self, name: &str, organization: OrganizationId) -> SyncResult<RoleId> {
        let query = sqlx::query(INSERT_ROLE_SQL)
            .bind(name)
            .bind(organization.get());
        match self.fetch_optional_id("role", "inserting role", query).await? {
            Some(id) => Ok(RoleId(id)),
            None => self
                .find_role_id(name, organization)
                .await?
                .ok_or_else(|| SyncError::unresolved("role", name)),
        }
    }

    async fn find_unit_id(&mut self, symbol: &str) -> SyncResult<Option<UnitId>> {
        let query = sqlx::query("SELECT id FROM unidade_medida WHERE sigla = $1").bind(symbol);
        let id = self
            .fetch_optional_id("unit of measure", "looking up unit of measure", query)
            .await?;
        Ok(id.map(UnitId))
    }

    async fn insert_unit(&mut self, symbol: &str) -> SyncResult<UnitId> {
        let query = sqlx::query(INSERT_UNIT_SQL).bind(symbol);
        match self
            .fetch_optional_id("unit of measure", "inserting unit of measure", query)
            .await?
        {
            Some(id) => Ok(UnitId(id)),
            None => self
                .find_unit_id(symbol)
                .await?
                .ok_or_else(|| SyncError::unresolved("unit of measure", symbol)),
        }
    }

    async fn upsert_employee(&mut self, row: &EmployeeWrite) -> SyncResult<()> {
        let query = sqlx::query(UPSERT_EMPLOYEE_SQL)
            .bind(&row.first_name)
            .bind(&row.last_name)
            .bind(row.role_id.get())
            .bind(&row.status)
            .bind(&row.email)
            .bind(row.organization_id.get());
        self.execute("employee", "merging employee", query).await
    }

    async fn upsert_order(&mut self, row: &OrderWrite) -> SyncResult<OrderId> {
        let query = sqlx::query(UPSERT_ORDER_SQL)
            .bind(row.organization_id.get())
            .bind(&row.invoice_code)
            .bind(row.issued_on);
        let id = self.fetch_id("order", "merging order", query).await?;
        Ok(OrderId(id))
    }

    async fn find_product_id(&mut self, ean: &str, organization: OrganizationId) -> SyncResult<Option<ProductId>> {
        let query = sqlx::query("SELECT id FROM produto WHERE codigo_ean = $1 AND empresa_id = $2")
            .bind(ean)
            .bind(organization.get());
        let id = self.fetch_optional_id("product", "looking up product", query).await?;
        Ok(id.map(ProductId))
    }

    async fn insert_product(&mut self, row: &ProductWrite) -> SyncResult<ProductId> {
        let query = sqlx::query(INSERT_PRODUCT_SQL)
            .bind(&row.name)
            .bind(row.quantity)
            .bind(row.unit_id.get())
            .bind(row.organization_id.get())
            .bind(&row.ean);
        let id = self.fetch_id("product", "inserting product", query).await?;
        Ok(ProductId(id))
    }

    async fn upsert_order_item(&mut self, row: &OrderItemWrite) -> SyncResult<()> {
        let query = sqlx::query(UPSERT_ORDER_ITEM_SQL)
            .bind(row.order_id.get())
            .bind(row.product_id.get())
            .bind(row.quantity);
        self.execute("order item", "merging order item", query).await
    }

    async fn begin_row(&mut self) -> SyncResult<()> {
        self.savepoint(SAVEPOINT_ROW_SQL).await
    }

    async fn release_row(&mut self) -> SyncResult<()> {
        self.savepoint(RELEASE_ROW_SQL).await
    }

    async fn rollback_row(&mut self) -> SyncResult<()> {
        self.savepoint(ROLLBACK_ROW_SQL).await?;
        self.savepoint(RELEASE_ROW_SQL).await
    }

    async fn commit(&mut self) -> SyncResult<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit()
                .await
                .map_err(|err| SyncError::data_access("committing destination transaction", err))?;
            debug!("destination transaction committed");
        }
        Ok(())
    }

    async fn rollback(&mut self) -> SyncResult<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback()
                .await
                .map_err(|err| SyncError::data_access("rolling back destination transaction", err))?;
            debug!("destination transaction rolled back");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_failures_are_data_access_errors() {
        let err = classify_sqlx_error("order", "merging order", sqlx::Error::PoolTimedOut);
        match err {
            SyncError::DataAccess { context, .. } => assert_eq!(context, "merging order"),
            other => panic!("unexpected classification: {other:?}"),
        }

        let err = classify_sqlx_error("order", "merging order", sqlx::Error::RowNotFound);
        assert!(!err.is_row_recoverable());
    }

    #[test]
    fn merge_statements_target_natural_key_constraints() {
        assert!(UPSERT_ORGANIZATION_SQL.contains("ON CONFLICT (cnpj)"));
        assert!(UPSERT_EMPLOYEE_SQL.contains("ON CONFLICT (nome, sobrenome)"));
        assert!(UPSERT_ORDER_SQL.contains("ON CONFLICT (cod_nota_fiscal)"));
        assert!(UPSERT_ORDER_ITEM_SQL.contains("ON CONFLICT (pedido_id, produto_id)"));
        assert!(!INSERT_PRODUCT_SQL.contains("ON CONFLICT"));
    }

    #[test]
    fn lookup_inserts_leave_existing_rows_alone() {
        for sql in [INSERT_ROLE_SQL, INSERT_UNIT_SQL] {
            assert!(sql.contains("DO NOTHING"));
            assert!(!sql.contains("DO UPDATE"));
        }
        assert!(INSERT_ROLE_SQL.contains("ON CONFLICT (nome, empresa_id)"));
        assert!(INSERT_UNIT_SQL.contains("ON CONFLICT (sigla)"));
    }

    #[test]
    fn savepoints_share_one_name() {
        for sql in [SAVEPOINT_ROW_SQL, RELEASE_ROW_SQL, ROLLBACK_ROW_SQL] {
            assert!(sql.ends_with("SAVEPOINT orgsync_row"));
        }
    }
}
