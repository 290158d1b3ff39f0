//! Batch workflow: staged multi-item movements with an optional approval gate
//!
//! A batch is created in DRAFT, collects items, and is finalized. Finalizing
//! either posts every item straight to the ledger and positions (FINALIZED) or
//! parks the batch for a manager (PENDING_APPROVAL). Posting always runs inside
//! one unit of work with the sufficiency check, so a failure leaves nothing
//! behind.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use shared::{
    reasons, validate_batch_scopes, validate_factor, validate_quantity, validate_reason,
    validate_unit_cost, validator_non_negative, validator_positive, Actor, BatchStatus,
    BatchType, MovementType, StockGranularity, StockScope, StockSettings,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};
use validator::Validate;

use super::audit::{self, AuditAction};
use super::catalog::{self, Product};
use super::conversion;
use super::ledger::{self, NewMovement};
use super::positions;
use crate::db;
use crate::error::{AppError, AppResult, ValidationExt};

#[derive(Clone)]
pub struct BatchService {
    db: SqlitePool,
}

/// A movement batch header
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: i64,
    pub batch_type: BatchType,
    pub reason: String,
    pub origin_sector_id: Option<i64>,
    pub origin_location_id: Option<i64>,
    pub destination_sector_id: Option<i64>,
    pub destination_location_id: Option<i64>,
    pub status: BatchStatus,
    pub notes: Option<String>,
    pub created_by: i64,
    pub approved_by: Option<i64>,
    pub rejected_by: Option<i64>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, SqliteRow> for Batch {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            batch_type: db::code(row, "batch_type")?,
            reason: row.try_get("reason")?,
            origin_sector_id: row.try_get("origin_sector_id")?,
            origin_location_id: row.try_get("origin_location_id")?,
            destination_sector_id: row.try_get("destination_sector_id")?,
            destination_location_id: row.try_get("destination_location_id")?,
            status: db::code(row, "status")?,
            notes: row.try_get("notes")?,
            created_by: row.try_get("created_by")?,
            approved_by: row.try_get("approved_by")?,
            rejected_by: row.try_get("rejected_by")?,
            rejection_reason: row.try_get("rejection_reason")?,
            created_at: row.try_get("created_at")?,
            finalized_at: row.try_get("finalized_at")?,
            approved_at: row.try_get("approved_at")?,
            rejected_at: row.try_get("rejected_at")?,
        })
    }
}

impl Batch {
    pub fn origin_scope(&self) -> StockScope {
        StockScope {
            sector_id: self.origin_sector_id,
            location_id: self.origin_location_id,
        }
    }

    pub fn destination_scope(&self) -> StockScope {
        StockScope {
            sector_id: self.destination_sector_id,
            location_id: self.destination_location_id,
        }
    }

    /// Text written to the origin column of every ledger row this batch posts
    pub fn origin_label(&self) -> String {
        match self.batch_type {
            BatchType::Transfer => format!("Transfer batch #{}", self.id),
            BatchType::Entry | BatchType::Exit => format!("Batch #{}", self.id),
        }
    }
}

/// One staged line of a batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub id: i64,
    pub batch_id: i64,
    pub product_id: i64,
    /// Quantity as the user entered it
    pub quantity: Decimal,
    pub unit_id: i64,
    pub factor: Decimal,
    /// Cost override for entries
    pub unit_cost: Option<Decimal>,
    pub observation: Option<String>,
}

impl<'r> FromRow<'r, SqliteRow> for BatchItem {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            batch_id: row.try_get("batch_id")?,
            product_id: row.try_get("product_id")?,
            quantity: db::decimal(row, "quantity")?,
            unit_id: row.try_get("unit_id")?,
            factor: db::decimal(row, "factor")?,
            unit_cost: db::optional_decimal(row, "unit_cost")?,
            observation: row.try_get("observation")?,
        })
    }
}

impl BatchItem {
    pub fn standard_quantity(&self) -> Decimal {
        self.quantity * self.factor
    }
}

/// A batch with its items
#[derive(Debug, Clone, Serialize)]
pub struct BatchDetail {
    #[serde(flatten)]
    pub batch: Batch,
    pub items: Vec<BatchItem>,
}

/// Result of finalize/approve
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub batch_id: i64,
    pub status: BatchStatus,
    /// Ledger rows written by this call
    pub movements: usize,
}

/// Input for starting a batch
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StartBatchInput {
    pub batch_type: BatchType,
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
    #[serde(default)]
    pub origin: StockScope,
    #[serde(default)]
    pub destination: StockScope,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

impl StartBatchInput {
    pub fn new(batch_type: BatchType, reason: &str) -> Self {
        Self {
            batch_type,
            reason: reason.to_string(),
            origin: StockScope::company(),
            destination: StockScope::company(),
            notes: None,
        }
    }

    pub fn from_origin(mut self, origin: StockScope) -> Self {
        self.origin = origin;
        self
    }

    pub fn to_destination(mut self, destination: StockScope) -> Self {
        self.destination = destination;
        self
    }
}

/// Input for adding an item
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AddItemInput {
    pub product_id: i64,
    #[validate(custom = "validator_positive")]
    pub quantity: Decimal,
    /// Defaults to the product's standard unit
    pub unit_id: Option<i64>,
    /// Resolved from the product's unit table when omitted
    #[validate(custom = "validator_positive")]
    pub factor: Option<Decimal>,
    #[validate(custom = "validator_non_negative")]
    pub unit_cost: Option<Decimal>,
    #[validate(length(max = 500))]
    pub observation: Option<String>,
}

impl AddItemInput {
    pub fn new(product_id: i64, quantity: Decimal) -> Self {
        Self {
            product_id,
            quantity,
            unit_id: None,
            factor: None,
            unit_cost: None,
            observation: None,
        }
    }

    pub fn in_unit(mut self, unit_id: i64) -> Self {
        self.unit_id = Some(unit_id);
        self
    }

    pub fn at_cost(mut self, unit_cost: Decimal) -> Self {
        self.unit_cost = Some(unit_cost);
        self
    }
}

/// Partial update of an item; at least one field must be set
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct EditItemInput {
    #[validate(custom = "validator_positive")]
    pub quantity: Option<Decimal>,
    pub unit_id: Option<i64>,
    #[validate(custom = "validator_positive")]
    pub factor: Option<Decimal>,
    #[validate(custom = "validator_non_negative")]
    pub unit_cost: Option<Decimal>,
    #[validate(length(max = 500))]
    pub observation: Option<String>,
}

impl EditItemInput {
    fn is_empty(&self) -> bool {
        self.quantity.is_none()
            && self.unit_id.is_none()
            && self.factor.is_none()
            && self.unit_cost.is_none()
            && self.observation.is_none()
    }
}

const BATCH_COLUMNS: &str = r#"
    id, batch_type, reason, origin_sector_id, origin_location_id, destination_sector_id,
    destination_location_id, status, notes, created_by, approved_by, rejected_by,
    rejection_reason, created_at, finalized_at, approved_at, rejected_at
"#;

const ITEM_COLUMNS: &str =
    "id, batch_id, product_id, quantity, unit_id, factor, unit_cost, observation";

// ============================================================================
// Connection-level steps shared with reconciliation
// ============================================================================

async fn load_batch(conn: &mut SqliteConnection, batch_id: i64) -> AppResult<Batch> {
    sqlx::query_as::<_, Batch>(&format!("SELECT {} FROM batches WHERE id = ?", BATCH_COLUMNS))
        .bind(batch_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Batch {}", batch_id)))
}

async fn load_items(conn: &mut SqliteConnection, batch_id: i64) -> AppResult<Vec<BatchItem>> {
    let items = sqlx::query_as::<_, BatchItem>(&format!(
        "SELECT {} FROM batch_items WHERE batch_id = ? ORDER BY id",
        ITEM_COLUMNS
    ))
    .bind(batch_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(items)
}

async fn load_item(
    conn: &mut SqliteConnection,
    batch_id: i64,
    item_id: i64,
) -> AppResult<BatchItem> {
    sqlx::query_as::<_, BatchItem>(&format!(
        "SELECT {} FROM batch_items WHERE id = ? AND batch_id = ?",
        ITEM_COLUMNS
    ))
    .bind(item_id)
    .bind(batch_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Item {} of batch {}", item_id, batch_id)))
}

/// Check that every id in a scope exists and that a location sits in its sector
async fn verify_scope(conn: &mut SqliteConnection, scope: &StockScope) -> AppResult<()> {
    if let Some(sector_id) = scope.sector_id {
        if !catalog::sector_exists(conn, sector_id).await? {
            return Err(AppError::NotFound(format!("Sector {}", sector_id)));
        }
    }
    if let Some(location_id) = scope.location_id {
        let location = catalog::location(conn, location_id).await?;
        if scope.sector_id != Some(location.sector_id) {
            return Err(AppError::validation(
                "location_id",
                format!(
                    "Location {} does not belong to sector {:?}",
                    location_id, scope.sector_id
                ),
            ));
        }
    }
    Ok(())
}

fn ensure_item_changes_allowed(batch: &Batch) -> AppResult<()> {
    if !batch.status.accepts_item_changes() {
        return Err(AppError::InvalidStateTransition(format!(
            "Items of batch #{} cannot change while it is {}",
            batch.id,
            batch.status.as_str()
        )));
    }
    Ok(())
}

fn ensure_transition(batch: &Batch, next: BatchStatus) -> AppResult<()> {
    if !batch.status.can_transition_to(next) {
        return Err(AppError::InvalidStateTransition(format!(
            "Batch #{} is {} and cannot become {}",
            batch.id,
            batch.status.as_str(),
            next.as_str()
        )));
    }
    Ok(())
}

/// Refuse outgoing quantities beyond the available balance.
///
/// Quantities are summed per product before comparing, so two lines of the
/// same product cannot each pass against the same stock. Products that do not
/// track inventory are skipped.
pub(crate) async fn check_sufficiency(
    conn: &mut SqliteConnection,
    granularity: StockGranularity,
    allow_negative_stock: bool,
    batch_type: BatchType,
    origin: StockScope,
    items: &[BatchItem],
) -> AppResult<()> {
    if !batch_type.uses_origin() || allow_negative_stock {
        return Ok(());
    }

    let mut required: BTreeMap<i64, Decimal> = BTreeMap::new();
    for item in items {
        *required.entry(item.product_id).or_insert(Decimal::ZERO) += item.standard_quantity();
    }

    for (product_id, requested) in required {
        let product = catalog::product(conn, product_id).await?;
        if !product.tracks_inventory {
            continue;
        }
        let available = positions::balance(conn, granularity, product_id, origin).await?;
        if requested > available {
            tracing::warn!(
                "Refusing {} of {}: {} requested, {} available",
                batch_type.as_str(),
                product.name,
                requested,
                available
            );
            return Err(AppError::InsufficientStock {
                product: product.name,
                available: available.normalize(),
                requested: requested.normalize(),
            });
        }
    }
    Ok(())
}

/// Post one item: append its ledger rows and move its positions
async fn post_item(
    conn: &mut SqliteConnection,
    granularity: StockGranularity,
    batch: &Batch,
    item: &BatchItem,
    product: &Product,
    actor: &Actor,
) -> AppResult<usize> {
    let unit = catalog::unit(conn, item.unit_id).await?;
    let quantity = item.standard_quantity();
    let origin = batch.origin_scope();
    let destination = batch.destination_scope();

    let movement = |movement_type: MovementType, unit_cost: Decimal| NewMovement {
        product_id: product.id,
        movement_type,
        reason: batch.reason.clone(),
        quantity,
        entered_quantity: item.quantity,
        entered_unit: unit.symbol.clone(),
        entered_factor: item.factor,
        unit_cost,
        origin: if movement_type == MovementType::Exit {
            origin
        } else {
            StockScope::company()
        },
        destination: if movement_type == MovementType::Entry {
            destination
        } else {
            StockScope::company()
        },
        batch_id: Some(batch.id),
        user_id: Some(actor.user_id),
        origin_label: Some(batch.origin_label()),
        observation: item.observation.clone(),
    };

    let cost = match batch.batch_type {
        // entries never read the moving average: item cost, else catalog cost
        BatchType::Entry => item.unit_cost.unwrap_or(product.standard_cost),
        // both legs of a transfer carry the origin's average from before the move
        BatchType::Exit | BatchType::Transfer => {
            positions::average_cost(conn, granularity, product.id, origin).await?
        }
    };

    let legs = batch.batch_type.movement_legs();
    for &leg in legs {
        ledger::append(conn, &movement(leg, cost)).await?;
        match leg {
            MovementType::Exit => {
                positions::apply_delta(conn, granularity, product.id, -quantity, origin, None)
                    .await?;
            }
            MovementType::Entry => {
                positions::apply_delta(
                    conn,
                    granularity,
                    product.id,
                    quantity,
                    destination,
                    Some(cost),
                )
                .await?;
            }
        }
    }
    Ok(legs.len())
}

/// Post every item of a batch, returning the number of ledger rows written
pub(crate) async fn post_items(
    conn: &mut SqliteConnection,
    granularity: StockGranularity,
    batch: &Batch,
    items: &[BatchItem],
    actor: &Actor,
) -> AppResult<usize> {
    let mut written = 0;
    for item in items {
        let product = catalog::product(conn, item.product_id).await?;
        if !product.tracks_inventory {
            tracing::debug!("Skipping {}: inventory not tracked", product.name);
            continue;
        }
        written += post_item(conn, granularity, batch, item, &product, actor).await?;
        tracing::debug!(
            "Posted {} x{} from batch #{}",
            product.name,
            item.standard_quantity().normalize(),
            batch.id
        );
    }
    Ok(written)
}

async fn insert_batch(
    conn: &mut SqliteConnection,
    input: &StartBatchInput,
    status: BatchStatus,
    actor: &Actor,
) -> AppResult<Batch> {
    let now = Utc::now();
    let finalized_at = (status == BatchStatus::Finalized).then_some(now);
    let batch = sqlx::query_as::<_, Batch>(&format!(
        r#"
        INSERT INTO batches (
            batch_type, reason, origin_sector_id, origin_location_id, destination_sector_id,
            destination_location_id, status, notes, created_by, created_at, finalized_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING {}
        "#,
        BATCH_COLUMNS
    ))
    .bind(input.batch_type.as_str())
    .bind(input.reason.trim())
    .bind(input.origin.sector_id)
    .bind(input.origin.location_id)
    .bind(input.destination.sector_id)
    .bind(input.destination.location_id)
    .bind(status.as_str())
    .bind(&input.notes)
    .bind(actor.user_id)
    .bind(now)
    .bind(finalized_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(batch)
}

async fn insert_item(
    conn: &mut SqliteConnection,
    batch_id: i64,
    product_id: i64,
    quantity: Decimal,
    unit_id: i64,
    factor: Decimal,
    unit_cost: Option<Decimal>,
    observation: Option<&str>,
) -> AppResult<BatchItem> {
    let item = sqlx::query_as::<_, BatchItem>(&format!(
        r#"
        INSERT INTO batch_items (batch_id, product_id, quantity, unit_id, factor, unit_cost, observation)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING {}
        "#,
        ITEM_COLUMNS
    ))
    .bind(batch_id)
    .bind(product_id)
    .bind(db::text(quantity))
    .bind(unit_id)
    .bind(db::text(factor))
    .bind(unit_cost.map(db::text))
    .bind(observation)
    .fetch_one(&mut *conn)
    .await?;
    Ok(item)
}

/// Post an inventory adjustment through the direct batch path.
///
/// Each adjustment is a single-item FINALIZED batch in the product's standard
/// unit, written as `actor` and posted exactly like any other batch. Entries
/// land scope-less. Exits are checked against the company-wide balance and,
/// under sector or local control, split across the rows holding the stock so
/// they leave at the company-wide average. Returns the batch ids written.
pub(crate) async fn post_adjustment(
    conn: &mut SqliteConnection,
    granularity: StockGranularity,
    product: &Product,
    direction: MovementType,
    quantity: Decimal,
    note: &str,
    label: &str,
    actor: &Actor,
) -> AppResult<Vec<i64>> {
    let shares = match direction {
        MovementType::Entry => vec![(StockScope::company(), quantity)],
        MovementType::Exit => {
            let available = positions::balance(
                conn,
                StockGranularity::Central,
                product.id,
                StockScope::company(),
            )
            .await?;
            if quantity > available {
                return Err(AppError::InsufficientStock {
                    product: product.name.clone(),
                    available: available.normalize(),
                    requested: quantity.normalize(),
                });
            }
            positions::exit_shares(conn, granularity, product.id, quantity).await?
        }
    };

    let mut batch_ids = Vec::with_capacity(shares.len());
    for (scope, share) in shares {
        let mut input = match direction {
            MovementType::Entry => {
                StartBatchInput::new(BatchType::Entry, reasons::INVENTORY_ADJUSTMENT)
            }
            MovementType::Exit => {
                StartBatchInput::new(BatchType::Exit, reasons::INVENTORY_ADJUSTMENT)
                    .from_origin(scope)
            }
        };
        input.notes = Some(label.to_string());

        let batch = insert_batch(conn, &input, BatchStatus::Finalized, actor).await?;
        let item = insert_item(
            conn,
            batch.id,
            product.id,
            share,
            product.standard_unit_id,
            Decimal::ONE,
            None,
            Some(note),
        )
        .await?;
        post_items(conn, granularity, &batch, &[item], actor).await?;

        audit::record(
            conn,
            AuditAction::BatchFinalized,
            &format!("Adjustment batch #{} for {} ({})", batch.id, product.name, label),
        )
        .await?;
        batch_ids.push(batch.id);
    }
    Ok(batch_ids)
}

impl BatchService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Start a DRAFT batch after checking its scopes against the granularity
    #[tracing::instrument(skip(self, input), fields(batch_type = input.batch_type.as_str()))]
    pub async fn start(
        &self,
        input: StartBatchInput,
        actor: &Actor,
        settings: &StockSettings,
    ) -> AppResult<Batch> {
        input.validate()?;
        validate_reason(&input.reason).for_field("reason")?;
        validate_batch_scopes(
            input.batch_type,
            settings.granularity,
            &input.origin,
            &input.destination,
        )
        .for_field("scope")?;

        let mut tx = db::begin_write(&self.db).await?;
        verify_scope(&mut tx, &input.origin).await?;
        verify_scope(&mut tx, &input.destination).await?;
        let batch = insert_batch(&mut tx, &input, BatchStatus::Draft, actor).await?;
        tx.commit().await?;

        tracing::info!("Batch #{} started", batch.id);
        Ok(batch)
    }

    pub async fn get(&self, batch_id: i64) -> AppResult<BatchDetail> {
        let mut conn = self.db.acquire().await?;
        let batch = load_batch(&mut conn, batch_id).await?;
        let items = load_items(&mut conn, batch_id).await?;
        Ok(BatchDetail { batch, items })
    }

    /// Batches awaiting a manager, oldest first
    pub async fn list_pending(&self) -> AppResult<Vec<Batch>> {
        let batches = sqlx::query_as::<_, Batch>(&format!(
            "SELECT {} FROM batches WHERE status = ? ORDER BY created_at ASC, id ASC",
            BATCH_COLUMNS
        ))
        .bind(BatchStatus::PendingApproval.as_str())
        .fetch_all(&self.db)
        .await?;
        Ok(batches)
    }

    #[tracing::instrument(skip(self, input))]
    pub async fn add_item(&self, batch_id: i64, input: AddItemInput) -> AppResult<BatchItem> {
        input.validate()?;
        validate_quantity(input.quantity).for_field("quantity")?;

        let mut tx = db::begin_write(&self.db).await?;
        let batch = load_batch(&mut tx, batch_id).await?;
        ensure_item_changes_allowed(&batch)?;

        let product = catalog::product(&mut tx, input.product_id).await?;
        if !product.active {
            return Err(AppError::validation(
                "product_id",
                format!("{} is inactive", product.name),
            ));
        }
        let unit_id = input.unit_id.unwrap_or(product.standard_unit_id);
        catalog::unit(&mut tx, unit_id).await?;
        let factor = match input.factor {
            Some(factor) => factor,
            None => conversion::resolve_factor(&mut tx, &product, unit_id).await?,
        };
        validate_factor(factor).for_field("factor")?;

        let item = insert_item(
            &mut tx,
            batch_id,
            product.id,
            input.quantity,
            unit_id,
            factor,
            input.unit_cost,
            input.observation.as_deref(),
        )
        .await?;
        tx.commit().await?;

        tracing::debug!("Item {} added to batch #{}", item.id, batch_id);
        Ok(item)
    }

    #[tracing::instrument(skip(self, input))]
    pub async fn edit_item(
        &self,
        batch_id: i64,
        item_id: i64,
        input: EditItemInput,
    ) -> AppResult<BatchItem> {
        if input.is_empty() {
            return Err(AppError::validation("item", "Nothing to update"));
        }
        input.validate()?;

        let mut tx = db::begin_write(&self.db).await?;
        let batch = load_batch(&mut tx, batch_id).await?;
        ensure_item_changes_allowed(&batch)?;
        let current = load_item(&mut tx, batch_id, item_id).await?;

        let quantity = input.quantity.unwrap_or(current.quantity);
        let unit_id = input.unit_id.unwrap_or(current.unit_id);
        let factor = match (input.factor, input.unit_id) {
            (Some(factor), _) => factor,
            (None, Some(new_unit)) if new_unit != current.unit_id => {
                let product = catalog::product(&mut tx, current.product_id).await?;
                catalog::unit(&mut tx, new_unit).await?;
                conversion::resolve_factor(&mut tx, &product, new_unit).await?
            }
            _ => current.factor,
        };
        validate_quantity(quantity).for_field("quantity")?;
        validate_factor(factor).for_field("factor")?;
        let unit_cost = input.unit_cost.or(current.unit_cost);
        if let Some(cost) = unit_cost {
            validate_unit_cost(cost).for_field("unit_cost")?;
        }
        let observation = input.observation.or(current.observation);

        let item = sqlx::query_as::<_, BatchItem>(&format!(
            r#"
            UPDATE batch_items
            SET quantity = ?, unit_id = ?, factor = ?, unit_cost = ?, observation = ?
            WHERE id = ?
            RETURNING {}
            "#,
            ITEM_COLUMNS
        ))
        .bind(db::text(quantity))
        .bind(unit_id)
        .bind(db::text(factor))
        .bind(unit_cost.map(db::text))
        .bind(&observation)
        .bind(item_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(item)
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove_item(&self, batch_id: i64, item_id: i64) -> AppResult<()> {
        let mut tx = db::begin_write(&self.db).await?;
        let batch = load_batch(&mut tx, batch_id).await?;
        ensure_item_changes_allowed(&batch)?;
        load_item(&mut tx, batch_id, item_id).await?;

        sqlx::query("DELETE FROM batch_items WHERE id = ?")
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Validate a DRAFT batch and either post it or park it for approval
    #[tracing::instrument(skip(self, actor, settings))]
    pub async fn finalize(
        &self,
        batch_id: i64,
        actor: &Actor,
        settings: &StockSettings,
    ) -> AppResult<BatchOutcome> {
        let mut tx = db::begin_write(&self.db).await?;
        let batch = load_batch(&mut tx, batch_id).await?;
        if batch.status != BatchStatus::Draft {
            return Err(AppError::InvalidStateTransition(format!(
                "Batch #{} is {}; only drafts can be finalized",
                batch.id,
                batch.status.as_str()
            )));
        }

        let items = load_items(&mut tx, batch_id).await?;
        if items.is_empty() {
            return Err(AppError::validation("items", "Batch has no items"));
        }

        check_sufficiency(
            &mut tx,
            settings.granularity,
            settings.allow_negative_stock,
            batch.batch_type,
            batch.origin_scope(),
            &items,
        )
        .await?;

        let now = Utc::now();
        if settings.requires_approval {
            ensure_transition(&batch, BatchStatus::PendingApproval)?;
            sqlx::query("UPDATE batches SET status = ?, finalized_at = ? WHERE id = ?")
                .bind(BatchStatus::PendingApproval.as_str())
                .bind(now)
                .bind(batch_id)
                .execute(&mut *tx)
                .await?;
            audit::record(
                &mut tx,
                AuditAction::BatchPending,
                &format!("Batch #{} with {} item(s) awaits approval", batch_id, items.len()),
            )
            .await?;
            tx.commit().await?;

            tracing::info!("Batch #{} pending approval", batch_id);
            return Ok(BatchOutcome {
                batch_id,
                status: BatchStatus::PendingApproval,
                movements: 0,
            });
        }

        ensure_transition(&batch, BatchStatus::Finalized)?;
        let movements = post_items(&mut tx, settings.granularity, &batch, &items, actor).await?;
        sqlx::query("UPDATE batches SET status = ?, finalized_at = ? WHERE id = ?")
            .bind(BatchStatus::Finalized.as_str())
            .bind(now)
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;
        audit::record(
            &mut tx,
            AuditAction::BatchFinalized,
            &format!("Batch #{} posted {} movement(s)", batch_id, movements),
        )
        .await?;
        tx.commit().await?;

        tracing::info!("Batch #{} finalized with {} movement(s)", batch_id, movements);
        Ok(BatchOutcome {
            batch_id,
            status: BatchStatus::Finalized,
            movements,
        })
    }

    /// Post a pending batch. Sufficiency is checked again against current stock.
    #[tracing::instrument(skip(self, actor, settings))]
    pub async fn approve(
        &self,
        batch_id: i64,
        actor: &Actor,
        settings: &StockSettings,
    ) -> AppResult<BatchOutcome> {
        if !actor.can_manage() {
            return Err(AppError::InsufficientPermissions);
        }

        let mut tx = db::begin_write(&self.db).await?;
        let batch = load_batch(&mut tx, batch_id).await?;
        ensure_transition(&batch, BatchStatus::Approved)?;

        let items = load_items(&mut tx, batch_id).await?;
        if items.is_empty() {
            return Err(AppError::validation("items", "Batch has no items"));
        }
        check_sufficiency(
            &mut tx,
            settings.granularity,
            settings.allow_negative_stock,
            batch.batch_type,
            batch.origin_scope(),
            &items,
        )
        .await?;

        let movements = post_items(&mut tx, settings.granularity, &batch, &items, actor).await?;
        sqlx::query("UPDATE batches SET status = ?, approved_by = ?, approved_at = ? WHERE id = ?")
            .bind(BatchStatus::Approved.as_str())
            .bind(actor.user_id)
            .bind(Utc::now())
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;
        audit::record(
            &mut tx,
            AuditAction::BatchApproved,
            &format!(
                "Batch #{} approved by user {} ({} movement(s))",
                batch_id, actor.user_id, movements
            ),
        )
        .await?;
        tx.commit().await?;

        tracing::info!("Batch #{} approved with {} movement(s)", batch_id, movements);
        Ok(BatchOutcome {
            batch_id,
            status: BatchStatus::Approved,
            movements,
        })
    }

    /// Close a pending batch without touching stock
    #[tracing::instrument(skip(self, actor))]
    pub async fn reject(&self, batch_id: i64, actor: &Actor, reason: &str) -> AppResult<Batch> {
        if !actor.can_manage() {
            return Err(AppError::InsufficientPermissions);
        }
        validate_reason(reason).for_field("rejection_reason")?;

        let mut tx = db::begin_write(&self.db).await?;
        let batch = load_batch(&mut tx, batch_id).await?;
        ensure_transition(&batch, BatchStatus::Rejected)?;

        let batch = sqlx::query_as::<_, Batch>(&format!(
            r#"
            UPDATE batches
            SET status = ?, rejected_by = ?, rejection_reason = ?, rejected_at = ?
            WHERE id = ?
            RETURNING {}
            "#,
            BATCH_COLUMNS
        ))
        .bind(BatchStatus::Rejected.as_str())
        .bind(actor.user_id)
        .bind(reason.trim())
        .bind(Utc::now())
        .bind(batch_id)
        .fetch_one(&mut *tx)
        .await?;
        audit::record(
            &mut tx,
            AuditAction::BatchRejected,
            &format!("Batch #{} rejected: {}", batch_id, reason.trim()),
        )
        .await?;
        tx.commit().await?;

        tracing::info!("Batch #{} rejected", batch_id);
        Ok(batch)
    }
}
