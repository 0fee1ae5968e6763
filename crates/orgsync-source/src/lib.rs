//! Read-only extraction of source rows, one entity family at a time.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::stream::{self, BoxStream, StreamExt};
use orgsync_core::{
    EntityFamily, SourceEmployee, SourceOrder, SourceOrderItem, SourceOrganization, SyncError,
    SyncResult,
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

pub const CRATE_NAME: &str = "orgsync-source";

/// Lazy, finite, non-restartable sequence of typed source rows.
pub type RowStream<'a, T> = BoxStream<'a, SyncResult<T>>;

/// Extraction contract for the source system. Every call issues a single read query.
pub trait SourceReader: Send + Sync {
    fn organizations(&self) -> RowStream<'_, SourceOrganization>;

    fn employees(&self) -> RowStream<'_, SourceEmployee>;

    fn orders(&self) -> RowStream<'_, SourceOrder>;

    /// Line items of one invoice, keyed by the invoice's internal source id.
    fn order_items(&self, order_source_id: i64) -> RowStream<'_, SourceOrderItem>;
}

const ORGANIZATIONS_SQL: &str = r#"
    SELECT id::bigint AS id
         , nome
         , cnpj::text AS cnpj
         , email
      FROM empresa
     ORDER BY id
"#;

const EMPLOYEES_SQL: &str = r#"
    SELECT f.id::bigint AS id
         , f.nome
         , f.sobrenome
         , f.funcao
         , f.status
         , f.email
         , e.cnpj::text AS cnpj_empresa
      FROM funcionario f
      JOIN empresa e ON e.id = f.id_empresa
     ORDER BY f.id
"#;

const ORDERS_SQL: &str = r#"
    SELECT nf.id::bigint          AS id
         , nf.numero_nota::text   AS cod_nota_fiscal
         , nf.data_emissao::date  AS data_compra
         , e.cnpj::text           AS cnpj_empresa
      FROM nota_fiscal_xml nf
      JOIN empresa e ON e.id = nf.id_empresa
     ORDER BY nf.id
"#;

const ORDER_ITEMS_SQL: &str = r#"
    SELECT nome
         , quantidade::float8   AS quantidade
         , unidade_medida
         , codigo_ean::text     AS codigo_ean
      FROM produto
     WHERE id_nota_fiscal = $1
"#;

/// PostgreSQL-backed reader. Sessions are opened with `default_transaction_read_only`.
#[derive(Debug, Clone)]
pub struct PgSourceReader {
    pool: PgPool,
}

impl PgSourceReader {
    /// Connects with at least two pooled connections: the per-order item read runs while the
    /// order stream still holds one.
    pub async fn connect(database_url: &str, max_connections: u32) -> SyncResult<Self> {
        let options = PgConnectOptions::from_str(database_url)
            .map_err(|err| SyncError::data_access("parsing source database url", err))?
            .options([("default_transaction_read_only", "on")]);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(2))
            .connect_with(options)
            .await
            .map_err(|err| SyncError::data_access("connecting to source database", err))?;
        info!(max_connections = max_connections.max(2), "connected to source database");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn read<'a, T, F>(&'a self, sql: &'static str, context: &'static str, decode: F) -> RowStream<'a, T>
    where
        T: Send + 'a,
        F: Fn(PgRow) -> Result<T, sqlx::Error> + Send + 'a,
    {
        sqlx::query(sql)
            .fetch(&self.pool)
            .map(move |row| row.and_then(&decode).map_err(|err| SyncError::data_access(context, err)))
            .boxed()
    }
}

impl SourceReader for PgSourceReader {
    fn organizations(&self) -> RowStream<'_, SourceOrganization> {
        self.read(ORGANIZATIONS_SQL, "reading source organizations", organization_from_row)
    }

    fn employees(&self) -> RowStream<'_, SourceEmployee> {
        self.read(EMPLOYEES_SQL, "reading source employees", employee_from_row)
    }

    fn orders(&self) -> RowStream<'_, SourceOrder> {
        self.read(ORDERS_SQL, "reading source invoices", order_from_row)
    }

    fn order_items(&self, order_source_id: i64) -> RowStream<'_, SourceOrderItem> {
        sqlx::query(ORDER_ITEMS_SQL)
            .bind(order_source_id)
            .fetch(&self.pool)
            .map(move |row| {
                row.and_then(order_item_from_row).map_err(|err| {
                    SyncError::data_access(
                        format!("reading source products of invoice {order_source_id}"),
                        err,
                    )
                })
            })
            .boxed()
    }
}

fn organization_from_row(row: PgRow) -> Result<SourceOrganization, sqlx::Error> {
    Ok(SourceOrganization {
        source_id: row.try_get("id")?,
        registration_number: row.try_get("cnpj")?,
        name: row.try_get("nome")?,
        email: row.try_get("email")?,
    })
}

fn employee_from_row(row: PgRow) -> Result<SourceEmployee, sqlx::Error> {
    Ok(SourceEmployee {
        source_id: row.try_get("id")?,
        first_name: row.try_get("nome")?,
        last_name: row.try_get("sobrenome")?,
        role_name: row.try_get("funcao")?,
        status: row.try_get("status")?,
        email: row.try_get("email")?,
        organization_registration: row.try_get("cnpj_empresa")?,
    })
}

fn order_from_row(row: PgRow) -> Result<SourceOrder, sqlx::Error> {
    Ok(SourceOrder {
        source_id: row.try_get("id")?,
        invoice_code: row.try_get("cod_nota_fiscal")?,
        issued_on: row.try_get("data_compra")?,
        organization_registration: row.try_get("cnpj_empresa")?,
    })
}

fn order_item_from_row(row: PgRow) -> Result<SourceOrderItem, sqlx::Error> {
    Ok(SourceOrderItem {
        product_name: row.try_get("nome")?,
        quantity: row.try_get("quantidade")?,
        unit_symbol: row.try_get("unidade_medida")?,
        ean: row.try_get("codigo_ean")?,
    })
}

/// In-memory source snapshot with the same extraction contract as [`PgSourceReader`].
#[derive(Debug, Default)]
pub struct MemorySource {
    pub organizations: Vec<SourceOrganization>,
    pub employees: Vec<SourceEmployee>,
    pub orders: Vec<SourceOrder>,
    pub order_items: HashMap<i64, Vec<SourceOrderItem>>,
    failing_family: Option<EntityFamily>,
    item_reads: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_organization(mut self, row: SourceOrganization) -> Self {
        self.organizations.push(row);
        self
    }

    pub fn with_employee(mut self, row: SourceEmployee) -> Self {
        self.employees.push(row);
        self
    }

    pub fn with_order(mut self, row: SourceOrder, items: Vec<SourceOrderItem>) -> Self {
        self.order_items.insert(row.source_id, items);
        self.orders.push(row);
        self
    }

    /// Makes the read of `family` yield its rows followed by a data access error.
    pub fn fail_reading(mut self, family: EntityFamily) -> Self {
        self.failing_family = Some(family);
        self
    }

    /// Number of per-invoice item queries served so far.
    pub fn item_reads(&self) -> usize {
        self.item_reads.load(Ordering::Relaxed)
    }

    fn serve<T: Clone + Send + 'static>(&self, family: EntityFamily, rows: &[T]) -> RowStream<'_, T> {
        let mut out: Vec<SyncResult<T>> = rows.iter().cloned().map(Ok).collect();
        if self.failing_family == Some(family) {
            out.push(Err(SyncError::data_access(
                format!("reading source {family}"),
                "connection reset by peer",
            )));
        }
        stream::iter(out).boxed()
    }
}

impl SourceReader for MemorySource {
    fn organizations(&self) -> RowStream<'_, SourceOrganization> {
        self.serve(EntityFamily::Organizations, &self.organizations)
    }

    fn employees(&self) -> RowStream<'_, SourceEmployee> {
        self.serve(EntityFamily::Employees, &self.employees)
    }

    fn orders(&self) -> RowStream<'_, SourceOrder> {
        self.serve(EntityFamily::Orders, &self.orders)
    }

    fn order_items(&self, order_source_id: i64) -> RowStream<'_, SourceOrderItem> {
        self.item_reads.fetch_add(1, Ordering::Relaxed);
        let rows = self
            .order_items
            .get(&order_source_id)
            .cloned()
            .unwrap_or_default();
        stream::iter(rows.into_iter().map(Ok)).boxed()
    }
}
