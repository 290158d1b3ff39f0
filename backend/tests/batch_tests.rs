//! Batch lifecycle tests
//!
//! Covers:
//! - Direct posting of entry, exit and transfer batches
//! - Sufficiency checks, including cumulative lines of one product
//! - The approval path and its re-check against current stock
//! - All-or-nothing posting when a write fails half way
//! - State machine errors

mod common;

use common::{dec, Fixture};
use rust_decimal::Decimal;
use shared::{BatchStatus, BatchType, MovementType, StockGranularity, StockScope, StockSettings};
use stock_count_ledger::error::AppError;
use stock_count_ledger::services::batch::{AddItemInput, EditItemInput, StartBatchInput};
use stock_count_ledger::services::catalog::NewProduct;

fn central() -> StockSettings {
    StockSettings::default()
}

fn sector() -> StockSettings {
    StockSettings::default().with_granularity(StockGranularity::Sector)
}

fn local() -> StockSettings {
    StockSettings::default().with_granularity(StockGranularity::Local)
}

// ============================================================================
// Direct posting
// ============================================================================

/// Test two entries at different costs followed by an exit at the average
#[tokio::test]
async fn test_moving_average_entries_and_exit() {
    let fx = Fixture::new().await;
    let settings = central();
    let flour = fx.product("Flour", "10").await;

    fx.receive(flour.id, "10", "10", StockScope::company(), &settings).await;
    fx.receive(flour.id, "10", "20", StockScope::company(), &settings).await;

    let position = fx
        .services
        .positions
        .get_position(flour.id, StockScope::company(), &settings)
        .await
        .unwrap();
    assert_eq!(position.balance, dec("20"));
    assert_eq!(position.total_value, dec("300"));
    assert_eq!(position.average_cost, dec("15"));

    let outcome = fx.issue(flour.id, "5", StockScope::company(), &settings).await;
    assert_eq!(outcome.status, BatchStatus::Finalized);
    assert_eq!(outcome.movements, 1);

    let movements = fx.services.ledger.for_batch(outcome.batch_id).await.unwrap();
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].movement_type, MovementType::Exit);
    assert_eq!(movements[0].unit_cost, dec("15"));
    assert_eq!(movements[0].total_value, dec("-75"));

    let position = fx
        .services
        .positions
        .get_position(flour.id, StockScope::company(), &settings)
        .await
        .unwrap();
    assert_eq!(position.balance, dec("15"));
    assert_eq!(position.total_value, dec("225"));
    assert_eq!(position.average_cost, dec("15"));
}

/// Test that an entry line without a cost is valued at the catalog cost
#[tokio::test]
async fn test_entry_without_cost_uses_standard_cost() {
    let fx = Fixture::new().await;
    let settings = central();
    let sugar = fx.product("Sugar", "4.50").await;

    let input = StartBatchInput::new(BatchType::Entry, "PURCHASE");
    let batch_id = fx.draft(input, &[(sugar.id, "2", None)], &settings).await;
    fx.services
        .batches
        .finalize(batch_id, &fx.keeper, &settings)
        .await
        .unwrap();

    let movements = fx.services.ledger.for_batch(batch_id).await.unwrap();
    assert_eq!(movements[0].unit_cost, dec("4.50"));
    assert_eq!(movements[0].total_value, dec("9"));
}

/// Test that an item entered in boxes is posted in the standard unit
#[tokio::test]
async fn test_item_in_alternate_unit_resolves_factor() {
    let fx = Fixture::new().await;
    let settings = central();
    let eggs = fx
        .services
        .catalog
        .create_product(NewProduct::new("Eggs", fx.un.id, dec("0.50")))
        .await
        .unwrap();
    fx.services
        .catalog
        .set_unit_factor(eggs.id, fx.cx.id, dec("12"))
        .await
        .unwrap();

    let batch = fx
        .services
        .batches
        .start(StartBatchInput::new(BatchType::Entry, "PURCHASE"), &fx.keeper, &settings)
        .await
        .unwrap();
    let item = fx
        .services
        .batches
        .add_item(batch.id, AddItemInput::new(eggs.id, dec("3")).in_unit(fx.cx.id))
        .await
        .unwrap();
    assert_eq!(item.factor, dec("12"));
    assert_eq!(item.standard_quantity(), dec("36"));

    fx.services
        .batches
        .finalize(batch.id, &fx.keeper, &settings)
        .await
        .unwrap();

    let movement = &fx.services.ledger.for_batch(batch.id).await.unwrap()[0];
    assert_eq!(movement.quantity, dec("36"));
    assert_eq!(movement.entered_quantity, dec("3"));
    assert_eq!(movement.entered_unit, "CX");
    assert_eq!(fx.balance(eggs.id, StockScope::company(), &settings).await, dec("36"));
}

/// Test that products without inventory tracking never reach the ledger
#[tokio::test]
async fn test_untracked_products_are_skipped() {
    let fx = Fixture::new().await;
    let settings = central();
    let flour = fx.product("Flour", "10").await;
    let mut service_input = NewProduct::new("Cleaning service", fx.un.id, dec("80"));
    service_input.tracks_inventory = false;
    let service = fx.services.catalog.create_product(service_input).await.unwrap();

    let input = StartBatchInput::new(BatchType::Entry, "PURCHASE");
    let batch_id = fx
        .draft(
            input,
            &[(flour.id, "1", Some("10")), (service.id, "1", Some("80"))],
            &settings,
        )
        .await;
    let outcome = fx
        .services
        .batches
        .finalize(batch_id, &fx.keeper, &settings)
        .await
        .unwrap();

    assert_eq!(outcome.movements, 1);
    assert_eq!(fx.balance(service.id, StockScope::company(), &settings).await, Decimal::ZERO);
}

// ============================================================================
// Sufficiency
// ============================================================================

/// Test that an exit beyond the sector balance is refused without writing
#[tokio::test]
async fn test_exit_beyond_sector_balance_is_refused() {
    let fx = Fixture::new().await;
    let settings = sector();
    let butter = fx.product("Butter", "30").await;
    fx.receive(butter.id, "5", "30", fx.scope_a(), &settings).await;
    let before = fx.movement_count().await;

    let input = StartBatchInput::new(BatchType::Exit, "SALE").from_origin(fx.scope_a());
    let batch_id = fx.draft(input, &[(butter.id, "8", None)], &settings).await;
    let result = fx.services.batches.finalize(batch_id, &fx.keeper, &settings).await;

    match result {
        Err(AppError::InsufficientStock {
            available,
            requested,
            ..
        }) => {
            assert_eq!(available, dec("5"));
            assert_eq!(requested, dec("8"));
        }
        other => panic!("expected insufficient stock, got {:?}", other),
    }
    assert_eq!(fx.movement_count().await, before);
    assert_eq!(fx.balance(butter.id, fx.scope_a(), &settings).await, dec("5"));

    let detail = fx.services.batches.get(batch_id).await.unwrap();
    assert_eq!(detail.batch.status, BatchStatus::Draft);
}

/// Test that two lines of one product are checked against the balance together
#[tokio::test]
async fn test_sufficiency_is_cumulative_per_product() {
    let fx = Fixture::new().await;
    let settings = central();
    let milk = fx.product("Milk", "3").await;
    fx.receive(milk.id, "5", "3", StockScope::company(), &settings).await;

    let input = StartBatchInput::new(BatchType::Exit, "SALE");
    let batch_id = fx
        .draft(input, &[(milk.id, "4", None), (milk.id, "4", None)], &settings)
        .await;
    let result = fx.services.batches.finalize(batch_id, &fx.keeper, &settings).await;

    assert!(matches!(result, Err(AppError::InsufficientStock { .. })));
    assert_eq!(fx.balance(milk.id, StockScope::company(), &settings).await, dec("5"));
}

/// Test that negative stock is allowed when the switch is on, with zero value
#[tokio::test]
async fn test_negative_stock_when_allowed() {
    let fx = Fixture::new().await;
    let settings = central().with_negative_stock(true);
    let yeast = fx.product("Yeast", "2").await;
    fx.receive(yeast.id, "3", "2", StockScope::company(), &settings).await;

    fx.issue(yeast.id, "5", StockScope::company(), &settings).await;

    let position = fx
        .services
        .positions
        .get_position(yeast.id, StockScope::company(), &settings)
        .await
        .unwrap();
    assert_eq!(position.balance, dec("-2"));
    assert_eq!(position.total_value, Decimal::ZERO);
    assert_eq!(position.average_cost, Decimal::ZERO);
}

// ============================================================================
// Transfers
// ============================================================================

/// Test that a transfer writes two legs at the origin's average
#[tokio::test]
async fn test_transfer_between_locations() {
    let fx = Fixture::new().await;
    let settings = local();
    let cocoa = fx.product("Cocoa", "40").await;
    fx.receive(cocoa.id, "10", "40", fx.local_a(), &settings).await;
    fx.receive(cocoa.id, "10", "50", fx.local_a(), &settings).await;

    let input = StartBatchInput::new(BatchType::Transfer, "TRANSFER")
        .from_origin(fx.local_a())
        .to_destination(fx.local_b());
    let batch_id = fx.draft(input, &[(cocoa.id, "4", None)], &settings).await;
    let outcome = fx
        .services
        .batches
        .finalize(batch_id, &fx.keeper, &settings)
        .await
        .unwrap();
    assert_eq!(outcome.movements, 2);

    let legs = fx.services.ledger.for_batch(batch_id).await.unwrap();
    assert_eq!(legs.len(), 2);
    assert_eq!(legs[0].movement_type, MovementType::Exit);
    assert_eq!(legs[1].movement_type, MovementType::Entry);
    assert!(legs.iter().all(|m| m.unit_cost == dec("45")));
    assert_eq!(legs[0].origin_scope(), fx.local_a());
    assert_eq!(legs[1].destination_scope(), fx.local_b());
    assert_eq!(legs[0].origin.as_deref(), Some(format!("Transfer batch #{}", batch_id).as_str()));

    let origin = fx
        .services
        .positions
        .get_position(cocoa.id, fx.local_a(), &settings)
        .await
        .unwrap();
    let destination = fx
        .services
        .positions
        .get_position(cocoa.id, fx.local_b(), &settings)
        .await
        .unwrap();
    assert_eq!(origin.balance, dec("16"));
    assert_eq!(origin.total_value, dec("720"));
    assert_eq!(destination.balance, dec("4"));
    assert_eq!(destination.total_value, dec("180"));
    assert_eq!(destination.average_cost, dec("45"));
}

/// Test that transfers are refused under central stock control
#[tokio::test]
async fn test_transfer_requires_scoped_control() {
    let fx = Fixture::new().await;
    let input = StartBatchInput::new(BatchType::Transfer, "TRANSFER")
        .from_origin(fx.scope_a())
        .to_destination(fx.scope_b());

    let result = fx.services.batches.start(input, &fx.keeper, &central()).await;
    assert!(matches!(result, Err(AppError::Validation { .. })));
}

/// Test that scopes must match the active granularity
#[tokio::test]
async fn test_scope_must_match_granularity() {
    let fx = Fixture::new().await;

    let scoped_under_central = StartBatchInput::new(BatchType::Exit, "SALE").from_origin(fx.scope_a());
    let result = fx
        .services
        .batches
        .start(scoped_under_central, &fx.keeper, &central())
        .await;
    assert!(matches!(result, Err(AppError::Validation { .. })));

    let missing_sector = StartBatchInput::new(BatchType::Entry, "PURCHASE");
    let result = fx.services.batches.start(missing_sector, &fx.keeper, &sector()).await;
    assert!(matches!(result, Err(AppError::Validation { .. })));

    let foreign_location = StartBatchInput::new(BatchType::Entry, "PURCHASE")
        .to_destination(StockScope::location(fx.sector_a.id, fx.location_b.id));
    let result = fx
        .services
        .batches
        .start(foreign_location, &fx.keeper, &local())
        .await;
    assert!(matches!(result, Err(AppError::Validation { .. })));
}

// ============================================================================
// Approval
// ============================================================================

/// Test that a pending batch posts nothing until approved
#[tokio::test]
async fn test_approval_flow() {
    let fx = Fixture::new().await;
    let settings = central().with_approval(true);
    let flour = fx.product("Flour", "10").await;

    let input = StartBatchInput::new(BatchType::Entry, "PURCHASE");
    let batch_id = fx.draft(input, &[(flour.id, "6", Some("10"))], &settings).await;
    let outcome = fx
        .services
        .batches
        .finalize(batch_id, &fx.keeper, &settings)
        .await
        .unwrap();
    assert_eq!(outcome.status, BatchStatus::PendingApproval);
    assert_eq!(outcome.movements, 0);
    assert_eq!(fx.balance(flour.id, StockScope::company(), &settings).await, Decimal::ZERO);

    let pending = fx.services.batches.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, batch_id);

    let result = fx.services.batches.approve(batch_id, &fx.keeper, &settings).await;
    assert!(matches!(result, Err(AppError::InsufficientPermissions)));

    let outcome = fx
        .services
        .batches
        .approve(batch_id, &fx.manager, &settings)
        .await
        .unwrap();
    assert_eq!(outcome.status, BatchStatus::Approved);
    assert_eq!(outcome.movements, 1);
    assert_eq!(fx.balance(flour.id, StockScope::company(), &settings).await, dec("6"));

    let detail = fx.services.batches.get(batch_id).await.unwrap();
    assert_eq!(detail.batch.approved_by, Some(fx.manager.user_id));
    assert!(fx.services.batches.list_pending().await.unwrap().is_empty());
}

/// Test that items of a pending batch can still be edited before approval
#[tokio::test]
async fn test_pending_batch_items_are_editable() {
    let fx = Fixture::new().await;
    let settings = central().with_approval(true);
    let flour = fx.product("Flour", "10").await;

    let input = StartBatchInput::new(BatchType::Entry, "PURCHASE");
    let batch_id = fx.draft(input, &[(flour.id, "6", Some("10"))], &settings).await;
    fx.services
        .batches
        .finalize(batch_id, &fx.keeper, &settings)
        .await
        .unwrap();

    let item_id = fx.services.batches.get(batch_id).await.unwrap().items[0].id;
    let edit = EditItemInput {
        quantity: Some(dec("8")),
        ..Default::default()
    };
    let item = fx
        .services
        .batches
        .edit_item(batch_id, item_id, edit)
        .await
        .unwrap();
    assert_eq!(item.quantity, dec("8"));
    assert_eq!(item.unit_cost, Some(dec("10")));

    fx.services
        .batches
        .approve(batch_id, &fx.manager, &settings)
        .await
        .unwrap();
    assert_eq!(fx.balance(flour.id, StockScope::company(), &settings).await, dec("8"));
}

/// Test that approval re-checks stock consumed after the batch was finalized
#[tokio::test]
async fn test_approval_rechecks_current_stock() {
    let fx = Fixture::new().await;
    let settings = central().with_approval(true);
    let sugar = fx.product("Sugar", "4").await;
    fx.receive(sugar.id, "10", "4", StockScope::company(), &settings).await;

    let input = StartBatchInput::new(BatchType::Exit, "SALE");
    let batch_id = fx.draft(input, &[(sugar.id, "8", None)], &settings).await;
    let outcome = fx
        .services
        .batches
        .finalize(batch_id, &fx.keeper, &settings)
        .await
        .unwrap();
    assert_eq!(outcome.status, BatchStatus::PendingApproval);

    // another exit lands while the batch waits
    fx.issue(sugar.id, "5", StockScope::company(), &settings).await;

    let result = fx.services.batches.approve(batch_id, &fx.manager, &settings).await;
    assert!(matches!(result, Err(AppError::InsufficientStock { .. })));
    assert!(fx.services.ledger.for_batch(batch_id).await.unwrap().is_empty());
    assert_eq!(fx.balance(sugar.id, StockScope::company(), &settings).await, dec("5"));

    let detail = fx.services.batches.get(batch_id).await.unwrap();
    assert_eq!(detail.batch.status, BatchStatus::PendingApproval);
}

/// Test that a failure on the third item leaves no trace of the batch
#[tokio::test]
async fn test_approval_is_all_or_nothing() {
    let fx = Fixture::new().await;
    let settings = central().with_approval(true);

    let mut products = Vec::new();
    for name in ["Flour", "Sugar", "Butter", "Milk", "Salt"] {
        let product = fx.product(name, "2").await;
        fx.receive(product.id, "10", "2", StockScope::company(), &settings).await;
        products.push(product);
    }

    let lines: Vec<(i64, &str, Option<&str>)> =
        products.iter().map(|p| (p.id, "2", None)).collect();
    let input = StartBatchInput::new(BatchType::Exit, "SALE");
    let batch_id = fx.draft(input, &lines, &settings).await;
    fx.services
        .batches
        .finalize(batch_id, &fx.keeper, &settings)
        .await
        .unwrap();

    sqlx::query(&format!(
        r#"
        CREATE TRIGGER fail_third_item BEFORE INSERT ON movements
        WHEN NEW.batch_id = {} AND NEW.product_id = {}
        BEGIN
            SELECT RAISE(ABORT, 'simulated storage failure');
        END
        "#,
        batch_id, products[2].id
    ))
    .execute(&fx.pool)
    .await
    .unwrap();

    let result = fx.services.batches.approve(batch_id, &fx.manager, &settings).await;
    assert!(matches!(result, Err(AppError::DatabaseError(_))));

    assert!(fx.services.ledger.for_batch(batch_id).await.unwrap().is_empty());
    for product in &products {
        assert_eq!(fx.balance(product.id, StockScope::company(), &settings).await, dec("10"));
    }
    let detail = fx.services.batches.get(batch_id).await.unwrap();
    assert_eq!(detail.batch.status, BatchStatus::PendingApproval);
}

/// Test that rejection needs a reason and never moves stock
#[tokio::test]
async fn test_reject_pending_batch() {
    let fx = Fixture::new().await;
    let settings = central().with_approval(true);
    let flour = fx.product("Flour", "10").await;

    let input = StartBatchInput::new(BatchType::Entry, "PURCHASE");
    let batch_id = fx.draft(input, &[(flour.id, "6", Some("10"))], &settings).await;
    fx.services
        .batches
        .finalize(batch_id, &fx.keeper, &settings)
        .await
        .unwrap();

    let result = fx.services.batches.reject(batch_id, &fx.manager, "  ").await;
    assert!(matches!(result, Err(AppError::Validation { .. })));

    let batch = fx
        .services
        .batches
        .reject(batch_id, &fx.manager, "Wrong supplier invoice")
        .await
        .unwrap();
    assert_eq!(batch.status, BatchStatus::Rejected);
    assert_eq!(batch.rejection_reason.as_deref(), Some("Wrong supplier invoice"));
    assert_eq!(fx.balance(flour.id, StockScope::company(), &settings).await, Decimal::ZERO);

    let result = fx.services.batches.approve(batch_id, &fx.manager, &settings).await;
    assert!(matches!(result, Err(AppError::InvalidStateTransition(_))));
}

// ============================================================================
// State machine
// ============================================================================

/// Test the operations refused by each batch state
#[tokio::test]
async fn test_invalid_transitions() {
    let fx = Fixture::new().await;
    let settings = central();
    let flour = fx.product("Flour", "10").await;

    let empty = fx
        .services
        .batches
        .start(StartBatchInput::new(BatchType::Entry, "PURCHASE"), &fx.keeper, &settings)
        .await
        .unwrap();
    let result = fx.services.batches.finalize(empty.id, &fx.keeper, &settings).await;
    assert!(matches!(result, Err(AppError::Validation { .. })));

    let result = fx.services.batches.approve(empty.id, &fx.manager, &settings).await;
    assert!(matches!(result, Err(AppError::InvalidStateTransition(_))));

    let input = StartBatchInput::new(BatchType::Entry, "PURCHASE");
    let batch_id = fx.draft(input, &[(flour.id, "1", Some("10"))], &settings).await;
    fx.services
        .batches
        .finalize(batch_id, &fx.keeper, &settings)
        .await
        .unwrap();

    let result = fx.services.batches.finalize(batch_id, &fx.keeper, &settings).await;
    assert!(matches!(result, Err(AppError::InvalidStateTransition(_))));

    let result = fx
        .services
        .batches
        .add_item(batch_id, AddItemInput::new(flour.id, dec("1")))
        .await;
    assert!(matches!(result, Err(AppError::InvalidStateTransition(_))));

    let item_id = fx.services.batches.get(batch_id).await.unwrap().items[0].id;
    let result = fx.services.batches.remove_item(batch_id, item_id).await;
    assert!(matches!(result, Err(AppError::InvalidStateTransition(_))));

    let result = fx.services.batches.reject(batch_id, &fx.manager, "late").await;
    assert!(matches!(result, Err(AppError::InvalidStateTransition(_))));
}

/// Test draft item maintenance
#[tokio::test]
async fn test_draft_item_changes() {
    let fx = Fixture::new().await;
    let settings = central();
    let flour = fx.product("Flour", "10").await;
    let sugar = fx.product("Sugar", "4").await;

    let input = StartBatchInput::new(BatchType::Entry, "PURCHASE");
    let batch_id = fx
        .draft(input, &[(flour.id, "1", None), (sugar.id, "2", None)], &settings)
        .await;
    let items = fx.services.batches.get(batch_id).await.unwrap().items;
    assert_eq!(items.len(), 2);

    let result = fx
        .services
        .batches
        .edit_item(batch_id, items[0].id, EditItemInput::default())
        .await;
    assert!(matches!(result, Err(AppError::Validation { .. })));

    let result = fx
        .services
        .batches
        .add_item(batch_id, AddItemInput::new(flour.id, dec("-1")))
        .await;
    assert!(result.is_err());

    fx.services
        .batches
        .remove_item(batch_id, items[1].id)
        .await
        .unwrap();
    let outcome = fx
        .services
        .batches
        .finalize(batch_id, &fx.keeper, &settings)
        .await
        .unwrap();
    assert_eq!(outcome.movements, 1);
    assert_eq!(fx.balance(sugar.id, StockScope::company(), &settings).await, Decimal::ZERO);
}

// ============================================================================
// Settings
// ============================================================================

/// Test that stored switches are read on each resolve
#[tokio::test]
async fn test_stored_settings_take_effect() {
    let fx = Fixture::new().await;
    assert_eq!(fx.services.settings.resolve().await.unwrap(), StockSettings::default());

    fx.services
        .settings
        .set("requires_approval", "true")
        .await
        .unwrap();
    fx.services
        .settings
        .set("stock_granularity", "SECTOR")
        .await
        .unwrap();

    let settings = fx.services.settings.resolve().await.unwrap();
    assert!(settings.requires_approval);
    assert_eq!(settings.granularity, StockGranularity::Sector);
    assert!(!settings.allow_negative_stock);
}

/// Test that deployment overrides win over stored switches
#[tokio::test]
async fn test_overrides_win_over_stored_settings() {
    let pool = stock_count_ledger::db::connect_in_memory().await.unwrap();
    let overrides = stock_count_ledger::config::StockOverrides {
        granularity: Some(StockGranularity::Local),
        allow_negative_stock: None,
        requires_approval: Some(false),
    };
    let services = stock_count_ledger::services::Services::new(pool, overrides);

    services.settings.set("requires_approval", "on").await.unwrap();
    services.settings.set("allow_negative_stock", "yes").await.unwrap();

    let settings = services.settings.resolve().await.unwrap();
    assert_eq!(settings.granularity, StockGranularity::Local);
    assert!(!settings.requires_approval);
    assert!(settings.allow_negative_stock);

    let result = services.settings.set("stock_granularity", "REGIONAL").await;
    assert!(matches!(result, Err(AppError::Validation { .. })));
    let result = services.settings.set("colour", "blue").await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}
