//! Dependency-ordered reconciliation of organizations, staff and invoices into the destination.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use orgsync_core::{
    canonical_status, EmployeeWrite, EntityFamily, OrderId, OrderItemWrite, OrderWrite,
    OrganizationId, OrganizationWrite, ProductId, ProductWrite, RoleId, SourceEmployee,
    SourceOrder, SourceOrderItem, SourceOrganization, SyncError, SyncResult, UnitId,
};
use orgsync_source::{PgSourceReader, SourceReader};
use orgsync_storage::{apply_destination_schema, DestinationSession, PgDestination};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "orgsync-sync";

/// What happens when a single source row cannot be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowFailurePolicy {
    /// The first failing row ends the run.
    #[default]
    Abort,
    /// Each row runs under a savepoint; failing rows are rolled back, reported and skipped.
    Skip,
}

impl FromStr for RowFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(RowFailurePolicy::Abort),
            "skip" => Ok(RowFailurePolicy::Skip),
            other => Err(format!("unknown row failure policy `{other}` (expected abort or skip)")),
        }
    }
}

impl fmt::Display for RowFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowFailurePolicy::Abort => f.write_str("abort"),
            RowFailurePolicy::Skip => f.write_str("skip"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub row_failure_policy: RowFailurePolicy,
    /// Keep every phase in one uncommitted transaction and roll it back at the end.
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_database_url: String,
    pub destination_database_url: String,
    pub source_max_connections: u32,
    pub options: SyncOptions,
}

impl SyncConfig {
    /// Loads `.env` if present, then reads `DB_URL_1` (source) and `DB_URL_2` (destination).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let source_max_connections = match non_blank(&lookup, "ORGSYNC_MAX_CONNECTIONS") {
            Some(raw) => raw.trim().parse().with_context(|| {
                format!("ORGSYNC_MAX_CONNECTIONS must be a positive integer, got `{raw}`")
            })?,
            None => 2,
        };
        Ok(Self {
            source_database_url: non_blank(&lookup, "DB_URL_1")
                .context("DB_URL_1 (source database url) is not set")?,
            destination_database_url: destination_url_from_vars(&lookup)?,
            source_max_connections,
            options: SyncOptions::default(),
        })
    }

    /// Only `DB_URL_2`; schema bootstrap never touches the source.
    pub fn destination_url_from_env() -> Result<String> {
        dotenvy::dotenv().ok();
        destination_url_from_vars(&|key: &str| std::env::var(key).ok())
    }
}

fn non_blank(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

pub fn destination_url_from_vars(lookup: &impl Fn(&str) -> Option<String>) -> Result<String> {
    non_blank(lookup, "DB_URL_2").context("DB_URL_2 (destination database url) is not set")
}

/// Translates source-side natural keys into destination surrogate keys.
#[derive(Debug, Default)]
pub struct KeyMapper;

impl KeyMapper {
    /// Destination id of the organization with this registration number. Only meaningful once
    /// the organization phase has completed.
    pub async fn resolve_organization<D>(
        &self,
        session: &mut D,
        registration_number: &str,
    ) -> SyncResult<OrganizationId>
    where
        D: DestinationSession + ?Sized,
    {
        session
            .find_organization_id(registration_number)
            .await?
            .ok_or_else(|| SyncError::unresolved("organization", registration_number))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupCategory {
    /// Scoped to an organization.
    Role,
    /// Global.
    UnitOfMeasure,
}

/// Get-or-create normalization of categorical text into lookup rows.
///
/// Lookup-then-insert is only safe while a single writer drives the destination. Resolved ids
/// are memoized for the rest of the run; [`Normalizer::forget`] must be called whenever
/// destination writes are rolled back.
#[derive(Debug, Default)]
pub struct Normalizer {
    resolved: HashMap<(LookupCategory, String, Option<OrganizationId>), i64>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve_or_create<D>(
        &mut self,
        session: &mut D,
        category: LookupCategory,
        value: &str,
        scope: Option<OrganizationId>,
    ) -> SyncResult<i64>
    where
        D: DestinationSession + ?Sized,
    {
        let key = (category, value.to_string(), scope);
        if let Some(id) = self.resolved.get(&key) {
            return Ok(*id);
        }

        let id = match (category, scope) {
            (LookupCategory::Role, Some(organization)) => {
                match session.find_role_id(value, organization).await? {
                    Some(id) => id.get(),
                    None => {
                        let id = session.insert_role(value, organization).await?;
                        debug!(role = value, %organization, role_id = %id, "created role");
                        id.get()
                    }
                }
            }
            (LookupCategory::UnitOfMeasure, None) => match session.find_unit_id(value).await? {
                Some(id) => id.get(),
                None => {
                    let id = session.insert_unit(value).await?;
                    debug!(unit = value, unit_id = %id, "created unit of measure");
                    id.get()
                }
            },
            (LookupCategory::Role, None) => {
                return Err(SyncError::invalid("role", format!("role `{value}` has no organization scope")));
            }
            (LookupCategory::UnitOfMeasure, Some(_)) => {
                return Err(SyncError::invalid(
                    "unit of measure",
                    format!("unit `{value}` is global and cannot be scoped"),
                ));
            }
        };

        self.resolved.insert(key, id);
        Ok(id)
    }

    pub async fn resolve_role<D>(&mut self, session: &mut D, name: &str, organization: OrganizationId) -> SyncResult<RoleId>
    where
        D: DestinationSession + ?Sized,
    {
        self.resolve_or_create(session, LookupCategory::Role, name, Some(organization))
            .await
            .map(RoleId)
    }

    pub async fn resolve_unit<D>(&mut self, session: &mut D, symbol: &str) -> SyncResult<UnitId>
    where
        D: DestinationSession + ?Sized,
    {
        self.resolve_or_create(session, LookupCategory::UnitOfMeasure, symbol, None)
            .await
            .map(UnitId)
    }

    /// Drops memoized ids; the next resolution goes back to the destination.
    pub fn forget(&mut self) {
        self.resolved.clear();
    }
}

/// One merge per entity type, with foreign keys already resolved by the caller.
#[derive(Debug, Default)]
pub struct UpsertExecutor;

impl UpsertExecutor {
    pub async fn organization<D>(&self, session: &mut D, row: &SourceOrganization) -> SyncResult<OrganizationId>
    where
        D: DestinationSession + ?Sized,
    {
        session
            .upsert_organization(&OrganizationWrite {
                registration_number: row.registration_number.clone(),
                name: row.required_name()?.to_string(),
                email: row.email.clone(),
            })
            .await
    }

    /// Status is stored uppercase on both the insert and the update path.
    pub async fn employee<D>(
        &self,
        session: &mut D,
        row: &SourceEmployee,
        role_id: RoleId,
        organization_id: OrganizationId,
    ) -> SyncResult<()>
    where
        D: DestinationSession + ?Sized,
    {
        session
            .upsert_employee(&EmployeeWrite {
                first_name: row.first_name.clone(),
                last_name: row.last_name.clone(),
                role_id,
                status: canonical_status(row.status.as_deref()),
                email: row.email.clone(),
                organization_id,
            })
            .await
    }

    pub async fn order<D>(&self, session: &mut D, row: &SourceOrder, organization_id: OrganizationId) -> SyncResult<OrderId>
    where
        D: DestinationSession + ?Sized,
    {
        session
            .upsert_order(&OrderWrite {
                invoice_code: row.invoice_code.clone(),
                issued_on: row.issued_on,
                organization_id,
            })
            .await
    }

    /// Insert-only after first sight: an existing (ean, organization) product is returned as is,
    /// and its unit of measure is normalized only when the product is new.
    pub async fn product<D>(
        &self,
        session: &mut D,
        normalizer: &mut Normalizer,
        item: &SourceOrderItem,
        organization_id: OrganizationId,
    ) -> SyncResult<ProductId>
    where
        D: DestinationSession + ?Sized,
    {
        if let Some(existing) = session.find_product_id(&item.ean, organization_id).await? {
            return Ok(existing);
        }
        let quantity = item.required_quantity()?;
        let unit_symbol = item
            .unit_symbol
            .as_deref()
            .ok_or_else(|| SyncError::invalid("order item", "unit of measure is missing"))?;
        let unit_id = normalizer.resolve_unit(session, unit_symbol).await?;
        session
            .insert_product(&ProductWrite {
                ean: item.ean.clone(),
                organization_id,
                name: item.product_name.clone(),
                quantity,
                unit_id,
            })
            .await
    }

    pub async fn order_item<D>(&self, session: &mut D, order_id: OrderId, product_id: ProductId, quantity: f64) -> SyncResult<()>
    where
        D: DestinationSession + ?Sized,
    {
        session
            .upsert_order_item(&OrderItemWrite {
                order_id,
                product_id,
                quantity,
            })
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseSummary {
    pub family: EntityFamily,
    pub rows_read: usize,
    pub rows_written: usize,
    pub rows_failed: usize,
    /// Order line items written under the family's rows.
    pub items_written: usize,
}

impl PhaseSummary {
    fn new(family: EntityFamily) -> Self {
        Self {
            family,
            rows_read: 0,
            rows_written: 0,
            rows_failed: 0,
            items_written: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowFailure {
    pub family: EntityFamily,
    pub key: String,
    pub error: SyncError,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub row_failure_policy: RowFailurePolicy,
    pub dry_run: bool,
    pub phases: Vec<PhaseSummary>,
    pub failures: Vec<RowFailure>,
}

impl SyncRunSummary {
    pub fn phase(&self, family: EntityFamily) -> Option<&PhaseSummary> {
        self.phases.iter().find(|p| p.family == family)
    }

    pub fn rows_written(&self) -> usize {
        self.phases.iter().map(|p| p.rows_written).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing sync run summary")
    }
}

/// Drives organizations, then employees, then orders with their items. Each phase reads its
/// whole family, writes row by row and ends with exactly one commit.
pub struct SyncOrchestrator<'a, S: ?Sized, D: ?Sized> {
    source: &'a S,
    destination: &'a mut D,
    options: SyncOptions,
    key_mapper: KeyMapper,
    normalizer: Normalizer,
    executor: UpsertExecutor,
    failures: Vec<RowFailure>,
}

impl<'a, S, D> SyncOrchestrator<'a, S, D>
where
    S: SourceReader + ?Sized,
    D: DestinationSession + ?Sized,
{
    pub fn new(source: &'a S, destination: &'a mut D, options: SyncOptions) -> Self {
        Self {
            source,
            destination,
            options,
            key_mapper: KeyMapper,
            normalizer: Normalizer::new(),
            executor: UpsertExecutor,
            failures: Vec::new(),
        }
    }

    /// Runs the three phases in dependency order. A failure leaves earlier phases committed.
    pub async fn run(mut self) -> SyncResult<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            %run_id,
            policy = %self.options.row_failure_policy,
            dry_run = self.options.dry_run,
            "starting sync run"
        );

        let mut phases = Vec::with_capacity(EntityFamily::ALL.len());
        for family in EntityFamily::ALL {
            let span = info_span!("sync_phase", %run_id, phase = %family);
            let summary = match family {
                EntityFamily::Organizations => self.sync_organizations().instrument(span).await?,
                EntityFamily::Employees => self.sync_employees().instrument(span).await?,
                EntityFamily::Orders => self.sync_orders().instrument(span).await?,
            };
            phases.push(summary);
        }

        if self.options.dry_run {
            self.destination.rollback().await?;
            self.normalizer.forget();
            info!(%run_id, "dry run rolled back");
        }

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            row_failure_policy: self.options.row_failure_policy,
            dry_run: self.options.dry_run,
            phases,
            failures: std::mem::take(&mut self.failures),
        };
        info!(
            %run_id,
            rows_written = summary.rows_written(),
            failures = summary.failures.len(),
            "sync run complete"
        );
        Ok(summary)
    }

    pub async fn sync_organizations(&mut self) -> SyncResult<PhaseSummary> {
        let mut summary = PhaseSummary::new(EntityFamily::Organizations);
        let source = self.source;
        let mut rows = source.organizations();
        while let Some(row) = rows.next().await {
            let row = row?;
            summary.rows_read += 1;
            self.begin_row().await?;
            let outcome = self.write_organization(&row).await;
            self.finish_row(&mut summary, row.registration_number.clone(), outcome)
                .await?;
        }
        self.end_phase(&summary).await?;
        Ok(summary)
    }

    pub async fn sync_employees(&mut self) -> SyncResult<PhaseSummary> {
        let mut summary = PhaseSummary::new(EntityFamily::Employees);
        let source = self.source;
        let mut rows = source.employees();
        while let Some(row) = rows.next().await {
            let row = row?;
            summary.rows_read += 1;
            self.begin_row().await?;
            let outcome = self.write_employee(&row).await;
            self.finish_row(&mut summary, row.display_key(), outcome).await?;
        }
        self.end_phase(&summary).await?;
        Ok(summary)
    }

    /// Each order pulls its own line items from the source right after it is merged; an order
    /// and its items form one row for failure handling.
    pub async fn sync_orders(&mut self) -> SyncResult<PhaseSummary> {
        let mut summary = PhaseSummary::new(EntityFamily::Orders);
        let source = self.source;
        let mut rows = source.orders();
        while let Some(row) = rows.next().await {
            let row = row?;
            summary.rows_read += 1;
            self.begin_row().await?;
            let outcome = self.write_order(&row).await;
            self.finish_row(&mut summary, row.invoice_code.clone(), outcome)
                .await?;
        }
        self.end_phase(&summary).await?;
        Ok(summary)
    }

    async fn write_organization(&mut self, row: &SourceOrganization) -> SyncResult<usize> {
        row.validate()?;
        let id = self.executor.organization(&mut *self.destination, row).await?;
        debug!(registration = %row.registration_number, organization_id = %id, "merged organization");
        Ok(0)
    }

    async fn write_employee(&mut self, row: &SourceEmployee) -> SyncResult<usize> {
        row.validate()?;
        let organization = self
            .key_mapper
            .resolve_organization(&mut *self.destination, &row.organization_registration)
            .await?;
        let role_name = row
            .role_name
            .as_deref()
            .ok_or_else(|| SyncError::invalid("employee", "role name is missing"))?;
        let role = self
            .normalizer
            .resolve_role(&mut *self.destination, role_name, organization)
            .await?;
        self.executor
            .employee(&mut *self.destination, row, role, organization)
            .await?;
        debug!(employee = %row.display_key(), %organization, "merged employee");
        Ok(0)
    }

    async fn write_order(&mut self, row: &SourceOrder) -> SyncResult<usize> {
        row.validate()?;
        let organization = self
            .key_mapper
            .resolve_organization(&mut *self.destination, &row.organization_registration)
            .await?;
        let order_id = self
            .executor
            .order(&mut *self.destination, row, organization)
            .await?;

        let source = self.source;
        let mut items = source.order_items(row.source_id);
        let mut written = 0usize;
        while let Some(item) = items.next().await {
            let item = item?;
            item.validate()?;
            let product_id = self
                .executor
                .product(&mut *self.destination, &mut self.normalizer, &item, organization)
                .await?;
            self.executor
                .order_item(&mut *self.destination, order_id, product_id, item.required_quantity()?)
                .await?;
            written += 1;
        }
        debug!(invoice = %row.invoice_code, %order_id, items = written, "merged order");
        Ok(written)
    }

    fn isolates_rows(&self) -> bool {
        self.options.row_failure_policy == RowFailurePolicy::Skip
    }

    async fn begin_row(&mut self) -> SyncResult<()> {
        if self.isolates_rows() {
            self.destination.begin_row().await?;
        }
        Ok(())
    }

    async fn finish_row(
        &mut self,
        summary: &mut PhaseSummary,
        key: String,
        outcome: SyncResult<usize>,
    ) -> SyncResult<()> {
        match outcome {
            Ok(items) => {
                if self.isolates_rows() {
                    self.destination.release_row().await?;
                }
                summary.rows_written += 1;
                summary.items_written += items;
                Ok(())
            }
            Err(error) if self.isolates_rows() && error.is_row_recoverable() => {
                self.destination.rollback_row().await?;
                self.normalizer.forget();
                warn!(family = %summary.family, key = %key, %error, "skipping source row");
                summary.rows_failed += 1;
                self.failures.push(RowFailure {
                    family: summary.family,
                    key,
                    error,
                });
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn end_phase(&mut self, summary: &PhaseSummary) -> SyncResult<()> {
        if !self.options.dry_run {
            self.destination.commit().await?;
        }
        info!(
            family = %summary.family,
            rows_read = summary.rows_read,
            rows_written = summary.rows_written,
            rows_failed = summary.rows_failed,
            items_written = summary.items_written,
            committed = !self.options.dry_run,
            "phase complete"
        );
        Ok(())
    }
}

/// Connects to both databases and performs one full run.
pub async fn run_sync(config: &SyncConfig) -> Result<SyncRunSummary> {
    let source = PgSourceReader::connect(&config.source_database_url, config.source_max_connections)
        .await
        .context("opening source connection")?;
    let mut destination = PgDestination::connect(&config.destination_database_url)
        .await
        .context("opening destination connection")?;
    let summary = SyncOrchestrator::new(&source, &mut destination, config.options)
        .run()
        .await
        .context("sync run failed")?;
    Ok(summary)
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    run_sync(&config).await
}

/// Creates the destination tables on the given destination database.
pub async fn migrate_destination(destination_database_url: &str) -> Result<()> {
    let destination = PgDestination::connect(destination_database_url)
        .await
        .context("opening destination connection")?;
    apply_destination_schema(destination.pool()).await
}
