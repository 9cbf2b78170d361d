//! Event Store
//!
//! SQLite persistence for visits, orders and order lines. Every row carries
//! two derived columns computed at write time from the calendar settings:
//! `day` (local calendar day in the configured zone) and, for visits,
//! `is_bot`. The grouping views read those columns, so the store records the
//! settings it derived them with and recomputes them when opened with
//! different ones.

use crate::calendar::local_day;
use crate::config::EngineConfig;
use crate::error::SeriesError;
use crate::models::*;
use crate::scope::TenantId;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;
use validator::Validate;

const DAY_FORMAT: &str = "%Y-%m-%d";

// ============================================
// Calendar Settings
// ============================================

/// Case-insensitive crawler signatures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotSignatures {
    signatures: Vec<String>,
}

impl BotSignatures {
    pub fn new(signatures: Vec<String>) -> Self {
        Self { signatures }
    }

    /// Whether a user-agent header contains any known signature
    pub fn matches(&self, header: &str) -> bool {
        if self.signatures.is_empty() {
            return false;
        }
        let header = header.to_lowercase();
        self.signatures.iter().any(|s| header.contains(s.as_str()))
    }

    fn fingerprint(&self) -> String {
        self.signatures.join("\n")
    }
}

/// Settings the derived columns depend on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarSettings {
    pub timezone: Tz,
    pub bots: BotSignatures,
    pub site_wide_sentinel: String,
}

impl CalendarSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            timezone: config.timezone,
            bots: BotSignatures::new(config.normalized_signatures()),
            site_wide_sentinel: config.site_wide_sentinel.clone(),
        }
    }

    pub fn day_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        local_day(instant, self.timezone)
    }
}

// ============================================
// Event Store
// ============================================

/// Event store backed by SQLite
#[derive(Debug, Clone)]
pub struct EventStore {
    pool: SqlitePool,
    settings: CalendarSettings,
    timeout: Duration,
}

impl EventStore {
    /// Open the store at `config.database_url`, creating schema and views as needed
    pub async fn connect(config: &EngineConfig) -> Result<Self, SeriesError> {
        config.validate()?;

        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to `:memory:` opens its own database, so a memory
        // store is pinned to a single connection that never expires.
        let in_memory = config.database_url.contains(":memory:")
            || config.database_url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections)
        };

        let pool = tokio::time::timeout(config.store_timeout, pool_options.connect_with(options))
            .await??;

        tracing::info!(
            url = %config.database_url,
            timezone = %config.timezone,
            "Connected to event store"
        );

        let store = Self {
            pool,
            settings: CalendarSettings::from_config(config),
            timeout: config.store_timeout,
        };
        store.run_migrations().await?;
        store.reconcile_settings().await?;
        Ok(store)
    }

    /// Open a private in-memory store
    pub async fn in_memory(config: &EngineConfig) -> Result<Self, SeriesError> {
        let config = EngineConfig {
            database_url: "sqlite::memory:".to_string(),
            ..config.clone()
        };
        Self::connect(&config).await
    }

    /// Same store with a different per-call timeout
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn settings(&self) -> &CalendarSettings {
        &self.settings
    }

    pub fn timezone(&self) -> Tz {
        self.settings.timezone
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run a storage call under the store timeout
    pub(crate) async fn bounded<T, F>(&self, call: F) -> Result<T, SeriesError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(elapsed) => Err(elapsed.into()),
        }
    }

    // ============================================
    // Schema
    // ============================================

    async fn run_migrations(&self) -> Result<(), SeriesError> {
        tracing::info!("Running event store migrations");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS visits (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                ip TEXT,
                url TEXT NOT NULL,
                product_code TEXT NOT NULL,
                header TEXT NOT NULL,
                tag TEXT NOT NULL DEFAULT '',
                is_bot INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                day TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_visits_tenant_time ON visits(tenant_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_visits_tenant_day ON visits(tenant_id, day)",
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                amount_minor INTEGER NOT NULL,
                currency TEXT NOT NULL,
                external_order_id TEXT NOT NULL,
                tag TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                day TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_orders_tenant_time ON orders(tenant_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_orders_tenant_day ON orders(tenant_id, day)",
            r#"
            CREATE TABLE IF NOT EXISTS order_lines (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                unit_price_minor INTEGER NOT NULL,
                quantity INTEGER NOT NULL,
                product_code TEXT NOT NULL,
                product_name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_order_lines_order ON order_lines(order_id)",
            "CREATE INDEX IF NOT EXISTS idx_order_lines_product ON order_lines(product_code)",
            r#"
            CREATE TABLE IF NOT EXISTS store_weights (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                beta REAL NOT NULL DEFAULT 0,
                gamma REAL NOT NULL DEFAULT 0,
                delta REAL NOT NULL DEFAULT 0,
                a REAL NOT NULL DEFAULT 0,
                b REAL NOT NULL DEFAULT 0,
                c REAL NOT NULL DEFAULT 0,
                d REAL NOT NULL DEFAULT 0,
                e REAL NOT NULL DEFAULT 0,
                probability_weights TEXT NOT NULL DEFAULT '[]',
                shift INTEGER NOT NULL DEFAULT 0,
                long_shift INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_store_weights_tenant ON store_weights(tenant_id, updated_at)",
            r#"
            CREATE TABLE IF NOT EXISTS open_data (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                store_power REAL NOT NULL DEFAULT 0,
                customer_satisfaction REAL NOT NULL DEFAULT 0,
                maximal_product_price REAL NOT NULL DEFAULT 0,
                minimal_product_price REAL NOT NULL DEFAULT 0,
                perceived_value REAL NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_open_data_tenant ON open_data(tenant_id, created_at)",
            r#"
            CREATE TABLE IF NOT EXISTS series_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
            // Live groupings read by the view path. Never materialized.
            r#"
            CREATE VIEW IF NOT EXISTS visit_daily_view AS
            SELECT tenant_id, product_code, tag, is_bot, day, COUNT(*) AS visits
            FROM visits
            GROUP BY tenant_id, product_code, tag, is_bot, day
            "#,
            r#"
            CREATE VIEW IF NOT EXISTS order_daily_view AS
            SELECT o.tenant_id, o.tag, o.day,
                   COUNT(*) AS orders,
                   SUM(o.amount_minor) AS amount_minor,
                   SUM((SELECT COALESCE(SUM(l.quantity), 0)
                        FROM order_lines l WHERE l.order_id = o.id)) AS quantity
            FROM orders o
            GROUP BY o.tenant_id, o.tag, o.day
            "#,
            r#"
            CREATE VIEW IF NOT EXISTS order_product_daily_view AS
            SELECT o.tenant_id, o.tag, l.product_code, o.day,
                   COUNT(DISTINCT o.id) AS orders,
                   SUM(l.quantity) AS quantity,
                   SUM(l.unit_price_minor * l.quantity) AS amount_minor
            FROM order_lines l
            JOIN orders o ON o.id = l.order_id
            GROUP BY o.tenant_id, o.tag, l.product_code, o.day
            "#,
        ];

        for statement in statements {
            self.bounded(sqlx::query(statement).execute(&self.pool)).await?;
        }

        tracing::info!("Event store migrations completed successfully");
        Ok(())
    }

    /// Make the derived columns agree with the configured settings
    async fn reconcile_settings(&self) -> Result<(), SeriesError> {
        let rows = self
            .bounded(sqlx::query("SELECT key, value FROM series_settings").fetch_all(&self.pool))
            .await?;

        let recorded = |key: &str| -> Option<String> {
            rows.iter()
                .find(|r| r.try_get::<String, _>("key").ok().as_deref() == Some(key))
                .and_then(|r| r.try_get::<String, _>("value").ok())
        };

        let timezone = self.settings.timezone.name().to_string();
        let bots = self.settings.bots.fingerprint();
        let sentinel = self.settings.site_wide_sentinel.clone();

        let unchanged = recorded("timezone").as_deref() == Some(timezone.as_str())
            && recorded("bot_signatures").as_deref() == Some(bots.as_str())
            && recorded("site_wide_sentinel").as_deref() == Some(sentinel.as_str());
        if unchanged {
            return Ok(());
        }

        let previous_sentinel = recorded("site_wide_sentinel");
        if rows.is_empty() {
            tracing::debug!("Recording calendar settings for new store");
        } else {
            tracing::warn!(
                previous_timezone = ?recorded("timezone"),
                timezone = %timezone,
                "Calendar settings changed, recomputing derived columns"
            );
        }

        let mut tx = self.bounded(self.pool.begin()).await?;

        if let Some(previous) = previous_sentinel.filter(|p| *p != sentinel) {
            sqlx::query("UPDATE visits SET product_code = ?1 WHERE product_code = ?2")
                .bind(&sentinel)
                .bind(&previous)
                .execute(&mut *tx)
                .await?;
        }

        let visits = sqlx::query("SELECT id, header, created_at FROM visits")
            .fetch_all(&mut *tx)
            .await?;
        for row in &visits {
            let created_at = from_micros(row.try_get("created_at")?)?;
            let header: String = row.try_get("header")?;
            sqlx::query("UPDATE visits SET day = ?1, is_bot = ?2 WHERE id = ?3")
                .bind(format_day(self.settings.day_of(created_at)))
                .bind(self.settings.bots.matches(&header))
                .bind(row.try_get::<String, _>("id")?)
                .execute(&mut *tx)
                .await?;
        }

        let orders = sqlx::query("SELECT id, created_at FROM orders")
            .fetch_all(&mut *tx)
            .await?;
        for row in &orders {
            let created_at = from_micros(row.try_get("created_at")?)?;
            sqlx::query("UPDATE orders SET day = ?1 WHERE id = ?2")
                .bind(format_day(self.settings.day_of(created_at)))
                .bind(row.try_get::<String, _>("id")?)
                .execute(&mut *tx)
                .await?;
        }

        for (key, value) in [
            ("timezone", timezone),
            ("bot_signatures", bots),
            ("site_wide_sentinel", sentinel),
        ] {
            sqlx::query(
                "INSERT INTO series_settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        self.bounded(tx.commit()).await?;

        if !visits.is_empty() || !orders.is_empty() {
            tracing::info!(
                visits = visits.len(),
                orders = orders.len(),
                "Derived columns recomputed"
            );
        }
        Ok(())
    }

    // ============================================
    // Ingest
    // ============================================

    /// Append a visit
    pub async fn record_visit(&self, input: NewVisit) -> Result<Visit, SeriesError> {
        input.validate()?;

        let created_at = input.created_at.unwrap_or_else(Utc::now);
        let visit = Visit {
            id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            ip: input.ip,
            url: input.url,
            product_code: input
                .product_code
                .unwrap_or_else(|| self.settings.site_wide_sentinel.clone()),
            is_bot: self.settings.bots.matches(&input.header),
            header: input.header,
            tag: input.tag,
            day: self.settings.day_of(created_at),
            created_at,
        };

        self.bounded(
            sqlx::query(
                r#"
                INSERT INTO visits (id, tenant_id, ip, url, product_code, header, tag, is_bot, created_at, day)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )
            .bind(visit.id.to_string())
            .bind(visit.tenant_id.as_key())
            .bind(&visit.ip)
            .bind(&visit.url)
            .bind(&visit.product_code)
            .bind(&visit.header)
            .bind(&visit.tag)
            .bind(visit.is_bot)
            .bind(to_micros(visit.created_at))
            .bind(format_day(visit.day))
            .execute(&self.pool),
        )
        .await?;

        tracing::debug!(tenant_id = %visit.tenant_id, day = %visit.day, bot = visit.is_bot, "Visit recorded");
        Ok(visit)
    }

    /// Append an order together with all of its lines, atomically
    pub async fn record_order(&self, input: NewOrder) -> Result<Order, SeriesError> {
        input.validate()?;

        let created_at = input.created_at.unwrap_or_else(Utc::now);
        let order_id = Uuid::new_v4();
        let lines: Vec<OrderLine> = input
            .lines
            .into_iter()
            .map(|line| OrderLine {
                id: Uuid::new_v4(),
                order_id,
                unit_price_minor: line.unit_price_minor,
                quantity: line.quantity,
                product_code: line.product_code,
                product_name: line.product_name,
            })
            .collect();

        let order = Order {
            id: order_id,
            tenant_id: input.tenant_id,
            amount_minor: input.amount_minor,
            currency: input.currency.to_uppercase(),
            external_order_id: input.external_order_id,
            tag: input.tag,
            day: self.settings.day_of(created_at),
            created_at,
            lines,
        };

        self.bounded(self.insert_order(&order)).await?;

        tracing::debug!(
            tenant_id = %order.tenant_id,
            day = %order.day,
            lines = order.lines.len(),
            "Order recorded"
        );
        Ok(order)
    }

    async fn insert_order(&self, order: &Order) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (id, tenant_id, amount_minor, currency, external_order_id, tag, created_at, day)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(order.id.to_string())
        .bind(order.tenant_id.as_key())
        .bind(order.amount_minor)
        .bind(&order.currency)
        .bind(&order.external_order_id)
        .bind(&order.tag)
        .bind(to_micros(order.created_at))
        .bind(format_day(order.day))
        .execute(&mut *tx)
        .await?;

        for line in &order.lines {
            sqlx::query(
                r#"
                INSERT INTO order_lines (id, order_id, unit_price_minor, quantity, product_code, product_name, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(line.id.to_string())
            .bind(line.order_id.to_string())
            .bind(line.unit_price_minor)
            .bind(line.quantity)
            .bind(&line.product_code)
            .bind(&line.product_name)
            .bind(to_micros(order.created_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }

    // ============================================
    // Reads
    // ============================================

    /// Get an order with its lines
    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, SeriesError> {
        let row = self
            .bounded(
                sqlx::query("SELECT * FROM orders WHERE id = ?1")
                    .bind(order_id.to_string())
                    .fetch_optional(&self.pool),
            )
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate_order(&row).await?)),
            None => Ok(None),
        }
    }

    /// Orders of a tenant, newest first
    pub async fn list_orders(
        &self,
        tenant: TenantId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>, SeriesError> {
        let rows = self
            .bounded(
                sqlx::query(
                    "SELECT * FROM orders WHERE tenant_id = ?1
                     ORDER BY created_at DESC, id LIMIT ?2 OFFSET ?3",
                )
                .bind(tenant.as_key())
                .bind(limit.clamp(0, 1000))
                .bind(offset.max(0))
                .fetch_all(&self.pool),
            )
            .await?;

        let mut orders = Vec::with_capacity(rows.len());
        for row in &rows {
            orders.push(self.hydrate_order(row).await?);
        }
        Ok(orders)
    }

    /// Visits of a tenant, newest first
    pub async fn list_visits(
        &self,
        tenant: TenantId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Visit>, SeriesError> {
        let rows = self
            .bounded(
                sqlx::query(
                    "SELECT * FROM visits WHERE tenant_id = ?1
                     ORDER BY created_at DESC, id LIMIT ?2 OFFSET ?3",
                )
                .bind(tenant.as_key())
                .bind(limit.clamp(0, 1000))
                .bind(offset.max(0))
                .fetch_all(&self.pool),
            )
            .await?;

        rows.iter().map(visit_from_row).collect()
    }

    async fn hydrate_order(&self, row: &SqliteRow) -> Result<Order, SeriesError> {
        let id = parse_uuid(&row.try_get::<String, _>("id")?)?;
        let line_rows = self
            .bounded(
                sqlx::query("SELECT * FROM order_lines WHERE order_id = ?1 ORDER BY rowid")
                    .bind(id.to_string())
                    .fetch_all(&self.pool),
            )
            .await?;

        let lines = line_rows
            .iter()
            .map(|line| -> Result<OrderLine, SeriesError> {
                Ok(OrderLine {
                    id: parse_uuid(&line.try_get::<String, _>("id")?)?,
                    order_id: id,
                    unit_price_minor: line.try_get("unit_price_minor")?,
                    quantity: line.try_get("quantity")?,
                    product_code: line.try_get("product_code")?,
                    product_name: line.try_get("product_name")?,
                })
            })
            .collect::<Result<Vec<_>, SeriesError>>()?;

        Ok(Order {
            id,
            tenant_id: parse_tenant(&row.try_get::<String, _>("tenant_id")?)?,
            amount_minor: row.try_get("amount_minor")?,
            currency: row.try_get("currency")?,
            external_order_id: row.try_get("external_order_id")?,
            tag: row.try_get("tag")?,
            created_at: from_micros(row.try_get("created_at")?)?,
            day: parse_day(&row.try_get::<String, _>("day")?)?,
            lines,
        })
    }

    /// Remove every event of a tenant
    pub async fn purge_tenant(&self, tenant: TenantId) -> Result<u64, SeriesError> {
        let key = tenant.as_key();
        let removed = self
            .bounded(async {
                let mut tx = self.pool.begin().await?;
                let orders = sqlx::query("DELETE FROM orders WHERE tenant_id = ?1")
                    .bind(&key)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                let visits = sqlx::query("DELETE FROM visits WHERE tenant_id = ?1")
                    .bind(&key)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                tx.commit().await?;
                Ok::<u64, sqlx::Error>(orders + visits)
            })
            .await?;

        tracing::info!(tenant_id = %tenant, removed, "Tenant events purged");
        Ok(removed)
    }
}

// ============================================
// Column Codecs
// ============================================

pub(crate) fn to_micros(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Result<DateTime<Utc>, SeriesError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| SeriesError::StoreUnavailable(format!("stored timestamp {} out of range", micros)))
}

pub(crate) fn format_day(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

pub(crate) fn parse_day(raw: &str) -> Result<NaiveDate, SeriesError> {
    NaiveDate::parse_from_str(raw, DAY_FORMAT)
        .map_err(|_| SeriesError::StoreUnavailable(format!("stored day {:?} is malformed", raw)))
}

fn parse_uuid(raw: &str) -> Result<Uuid, SeriesError> {
    Uuid::parse_str(raw)
        .map_err(|_| SeriesError::StoreUnavailable(format!("stored id {:?} is malformed", raw)))
}

pub(crate) fn parse_tenant(raw: &str) -> Result<TenantId, SeriesError> {
    parse_uuid(raw).map(TenantId::new)
}

fn visit_from_row(row: &SqliteRow) -> Result<Visit, SeriesError> {
    Ok(Visit {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        tenant_id: parse_tenant(&row.try_get::<String, _>("tenant_id")?)?,
        ip: row.try_get("ip")?,
        url: row.try_get("url")?,
        product_code: row.try_get("product_code")?,
        header: row.try_get("header")?,
        tag: row.try_get("tag")?,
        is_bot: row.try_get::<i64, _>("is_bot")? != 0,
        created_at: from_micros(row.try_get("created_at")?)?,
        day: parse_day(&row.try_get::<String, _>("day")?)?,
    })
}
