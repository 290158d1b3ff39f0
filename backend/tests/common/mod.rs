//! Shared fixture for the integration tests: an in-memory store with a small
//! catalog, two sectors with one location each, a manager and a stock keeper.

#![allow(dead_code)]

use rust_decimal::Decimal;
use shared::{Actor, BatchType, StockScope, StockSettings, UserRole};
use sqlx::SqlitePool;
use std::str::FromStr;
use stock_count_ledger::config::StockOverrides;
use stock_count_ledger::db;
use stock_count_ledger::services::batch::{AddItemInput, BatchOutcome, StartBatchInput};
use stock_count_ledger::services::catalog::{Location, NewProduct, Product, Sector, Unit};
use stock_count_ledger::services::Services;

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub struct Fixture {
    pub pool: SqlitePool,
    pub services: Services,
    pub manager: Actor,
    pub keeper: Actor,
    pub kg: Unit,
    pub un: Unit,
    pub cx: Unit,
    pub sector_a: Sector,
    pub sector_b: Sector,
    pub location_a: Location,
    pub location_b: Location,
}

impl Fixture {
    pub async fn new() -> Self {
        let pool = db::connect_in_memory().await.unwrap();
        let services = Services::new(pool.clone(), StockOverrides::default());

        let manager = services
            .catalog
            .create_user("Maria", UserRole::Manager)
            .await
            .unwrap();
        let keeper = services
            .catalog
            .create_user("Joao", UserRole::StockKeeper)
            .await
            .unwrap();

        let kg = services.catalog.unit_by_symbol("KG").await.unwrap();
        let un = services.catalog.unit_by_symbol("UN").await.unwrap();
        let cx = services.catalog.unit_by_symbol("CX").await.unwrap();

        let sector_a = services.catalog.create_sector("Bakery").await.unwrap();
        let sector_b = services.catalog.create_sector("Storeroom").await.unwrap();
        let location_a = services
            .catalog
            .create_location(sector_a.id, "Shelf A1")
            .await
            .unwrap();
        let location_b = services
            .catalog
            .create_location(sector_b.id, "Rack B1")
            .await
            .unwrap();

        Self {
            pool,
            services,
            manager,
            keeper,
            kg,
            un,
            cx,
            sector_a,
            sector_b,
            location_a,
            location_b,
        }
    }

    /// A tracked product counted in kilograms
    pub async fn product(&self, name: &str, standard_cost: &str) -> Product {
        self.services
            .catalog
            .create_product(NewProduct::new(name, self.kg.id, dec(standard_cost)))
            .await
            .unwrap()
    }

    pub fn scope_a(&self) -> StockScope {
        StockScope::sector(self.sector_a.id)
    }

    pub fn scope_b(&self) -> StockScope {
        StockScope::sector(self.sector_b.id)
    }

    pub fn local_a(&self) -> StockScope {
        StockScope::location(self.sector_a.id, self.location_a.id)
    }

    pub fn local_b(&self) -> StockScope {
        StockScope::location(self.sector_b.id, self.location_b.id)
    }

    /// Start a batch and add one standard-unit item per line
    pub async fn draft(
        &self,
        input: StartBatchInput,
        lines: &[(i64, &str, Option<&str>)],
        settings: &StockSettings,
    ) -> i64 {
        let batch = self
            .services
            .batches
            .start(input, &self.keeper, settings)
            .await
            .unwrap();
        for (product_id, quantity, cost) in lines {
            let mut item = AddItemInput::new(*product_id, dec(quantity));
            if let Some(cost) = cost {
                item = item.at_cost(dec(cost));
            }
            self.services.batches.add_item(batch.id, item).await.unwrap();
        }
        batch.id
    }

    /// Post an entry directly
    pub async fn receive(
        &self,
        product_id: i64,
        quantity: &str,
        cost: &str,
        destination: StockScope,
        settings: &StockSettings,
    ) -> BatchOutcome {
        let input = StartBatchInput::new(BatchType::Entry, "PURCHASE").to_destination(destination);
        let batch_id = self
            .draft(input, &[(product_id, quantity, Some(cost))], settings)
            .await;
        self.services
            .batches
            .finalize(batch_id, &self.keeper, &settings.with_approval(false))
            .await
            .unwrap()
    }

    /// Post an exit directly
    pub async fn issue(
        &self,
        product_id: i64,
        quantity: &str,
        origin: StockScope,
        settings: &StockSettings,
    ) -> BatchOutcome {
        let input = StartBatchInput::new(BatchType::Exit, "SALE").from_origin(origin);
        let batch_id = self.draft(input, &[(product_id, quantity, None)], settings).await;
        self.services
            .batches
            .finalize(batch_id, &self.keeper, &settings.with_approval(false))
            .await
            .unwrap()
    }

    pub async fn balance(&self, product_id: i64, scope: StockScope, settings: &StockSettings) -> Decimal {
        self.services
            .positions
            .get_balance(product_id, scope, settings)
            .await
            .unwrap()
    }

    pub async fn movement_count(&self) -> i64 {
        self.services.ledger.count().await.unwrap()
    }
}
