//! Typed persistence adapter over a pooled Postgres connection.
//! Mirrors the fleet's `PersistenceManager` shape: one method per
//! operation, raw `sqlx::query` with positional binds, `ON CONFLICT`
//! upserts, and a `run_migrations` bootstrap.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::errors::PipelineError;
use crate::types::{
    FlowRow, GEXSnapshot, IngestionMetric, OptionQuote, OptionType, UnderlyingQuote, UptimeProbe,
};

/// Pooled-connection wrapper exposing the six persisted operations.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(connection_string: &str) -> Result<Self, PipelineError> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect(connection_string)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Bulk upsert of a batch of quotes inside a single transaction.
    pub async fn upsert_options(&self, batch: &[OptionQuote]) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await?;
        for q in batch {
            sqlx::query(
                r#"
                INSERT INTO options_quotes (
                    observed_at, root_symbol, strike, expiration, option_type, dte,
                    bid, ask, mid, last, spread_pct,
                    volume, open_interest, implied_vol,
                    delta, gamma, theta, vega, rho, is_calculated,
                    underlying_price
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                        $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
                ON CONFLICT (observed_at, root_symbol, strike, expiration, option_type)
                DO UPDATE SET
                    bid = EXCLUDED.bid,
                    ask = EXCLUDED.ask,
                    mid = EXCLUDED.mid,
                    last = EXCLUDED.last,
                    spread_pct = EXCLUDED.spread_pct,
                    volume = EXCLUDED.volume,
                    open_interest = EXCLUDED.open_interest,
                    implied_vol = EXCLUDED.implied_vol,
                    delta = EXCLUDED.delta,
                    gamma = EXCLUDED.gamma,
                    theta = EXCLUDED.theta,
                    vega = EXCLUDED.vega,
                    rho = EXCLUDED.rho,
                    is_calculated = EXCLUDED.is_calculated,
                    underlying_price = EXCLUDED.underlying_price
                "#,
            )
            .bind(q.observed_at)
            .bind(&q.root_symbol)
            .bind(q.strike)
            .bind(q.expiration)
            .bind(q.option_type.as_str())
            .bind(q.dte)
            .bind(q.bid)
            .bind(q.ask)
            .bind(q.mid)
            .bind(q.last)
            .bind(q.spread_pct)
            .bind(q.volume)
            .bind(q.open_interest)
            .bind(q.implied_vol)
            .bind(q.delta)
            .bind(q.gamma)
            .bind(q.theta)
            .bind(q.vega)
            .bind(q.rho)
            .bind(q.is_calculated)
            .bind(q.underlying_price)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_underlying(&self, row: &UnderlyingQuote) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            INSERT INTO underlying_quotes (
                observed_at, symbol, open, high, low, close,
                total_volume, up_volume, down_volume
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (observed_at, symbol)
            DO UPDATE SET
                open = EXCLUDED.open,
                high = EXCLUDED.high,
                low = EXCLUDED.low,
                close = EXCLUDED.close,
                total_volume = EXCLUDED.total_volume,
                up_volume = EXCLUDED.up_volume,
                down_volume = EXCLUDED.down_volume
            "#,
        )
        .bind(row.observed_at)
        .bind(&row.symbol)
        .bind(row.open)
        .bind(row.high)
        .bind(row.low)
        .bind(row.close)
        .bind(row.total_volume)
        .bind(row.up_volume)
        .bind(row.down_volume)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_flow(&self, rows: &[FlowRow]) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await?;
        for r in rows {
            sqlx::query(
                r#"
                INSERT INTO option_flow_metrics (
                    observed_at, symbol, option_type, bucket_start, bucket_end,
                    total_volume, block_volume, sweep_volume, trade_count,
                    avg_premium, vwap_premium, notional_sum,
                    avg_underlying_price, avg_trade_size,
                    net_delta_exposure, gamma_weighted_sum,
                    buy_volume, sell_volume, net_flow,
                    atm_volume, itm_volume, otm_volume,
                    starting_oi, ending_oi, oi_change, unique_strikes,
                    max_trade_size
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                        $13, $14, $15, $16, $17, $18, $19, $20, $21, $22,
                        $23, $24, $25, $26, $27)
                ON CONFLICT (observed_at, symbol, option_type)
                DO UPDATE SET
                    total_volume = EXCLUDED.total_volume,
                    block_volume = EXCLUDED.block_volume,
                    sweep_volume = EXCLUDED.sweep_volume,
                    trade_count = EXCLUDED.trade_count,
                    avg_premium = EXCLUDED.avg_premium,
                    vwap_premium = EXCLUDED.vwap_premium,
                    notional_sum = EXCLUDED.notional_sum,
                    avg_underlying_price = EXCLUDED.avg_underlying_price,
                    avg_trade_size = EXCLUDED.avg_trade_size,
                    net_delta_exposure = EXCLUDED.net_delta_exposure,
                    gamma_weighted_sum = EXCLUDED.gamma_weighted_sum,
                    buy_volume = EXCLUDED.buy_volume,
                    sell_volume = EXCLUDED.sell_volume,
                    net_flow = EXCLUDED.net_flow,
                    atm_volume = EXCLUDED.atm_volume,
                    itm_volume = EXCLUDED.itm_volume,
                    otm_volume = EXCLUDED.otm_volume,
                    starting_oi = EXCLUDED.starting_oi,
                    ending_oi = EXCLUDED.ending_oi,
                    oi_change = EXCLUDED.oi_change,
                    unique_strikes = EXCLUDED.unique_strikes,
                    max_trade_size = EXCLUDED.max_trade_size
                "#,
            )
            .bind(r.observed_at)
            .bind(&r.symbol)
            .bind(r.option_type.as_str())
            .bind(r.bucket_start)
            .bind(r.bucket_end)
            .bind(r.total_volume)
            .bind(r.block_volume)
            .bind(r.sweep_volume)
            .bind(r.trade_count)
            .bind(r.avg_premium)
            .bind(r.vwap_premium)
            .bind(r.notional_sum)
            .bind(r.avg_underlying_price)
            .bind(r.avg_trade_size)
            .bind(r.net_delta_exposure)
            .bind(r.gamma_weighted_sum)
            .bind(r.buy_volume)
            .bind(r.sell_volume)
            .bind(r.net_flow)
            .bind(r.atm_volume)
            .bind(r.itm_volume)
            .bind(r.otm_volume)
            .bind(r.starting_oi)
            .bind(r.ending_oi)
            .bind(r.oi_change)
            .bind(r.unique_strikes)
            .bind(r.max_trade_size)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_gex(&self, snapshot: &GEXSnapshot) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            INSERT INTO gex_metrics (
                observed_at, symbol, expiration, underlying_price,
                total_gamma_exposure, call_gamma, put_gamma, net_gex,
                max_gamma_strike, max_gamma_value, gamma_flip_point, max_pain,
                put_call_ratio, vanna_exposure, charm_exposure,
                call_volume, put_volume, call_oi, put_oi, total_contracts
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (observed_at, symbol, expiration)
            DO UPDATE SET
                underlying_price = EXCLUDED.underlying_price,
                total_gamma_exposure = EXCLUDED.total_gamma_exposure,
                call_gamma = EXCLUDED.call_gamma,
                put_gamma = EXCLUDED.put_gamma,
                net_gex = EXCLUDED.net_gex,
                max_gamma_strike = EXCLUDED.max_gamma_strike,
                max_gamma_value = EXCLUDED.max_gamma_value,
                gamma_flip_point = EXCLUDED.gamma_flip_point,
                max_pain = EXCLUDED.max_pain,
                put_call_ratio = EXCLUDED.put_call_ratio,
                vanna_exposure = EXCLUDED.vanna_exposure,
                charm_exposure = EXCLUDED.charm_exposure,
                call_volume = EXCLUDED.call_volume,
                put_volume = EXCLUDED.put_volume,
                call_oi = EXCLUDED.call_oi,
                put_oi = EXCLUDED.put_oi,
                total_contracts = EXCLUDED.total_contracts
            "#,
        )
        .bind(snapshot.observed_at)
        .bind(&snapshot.symbol)
        .bind(snapshot.expiration)
        .bind(snapshot.underlying_price)
        .bind(snapshot.total_gamma_exposure)
        .bind(snapshot.call_gamma)
        .bind(snapshot.put_gamma)
        .bind(snapshot.net_gex)
        .bind(snapshot.max_gamma_strike)
        .bind(snapshot.max_gamma_value)
        .bind(snapshot.gamma_flip_point)
        .bind(snapshot.max_pain)
        .bind(snapshot.put_call_ratio)
        .bind(snapshot.vanna_exposure)
        .bind(snapshot.charm_exposure)
        .bind(snapshot.call_volume)
        .bind(snapshot.put_volume)
        .bind(snapshot.call_oi)
        .bind(snapshot.put_oi)
        .bind(snapshot.total_contracts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_ingestion_metric(
        &self,
        row: &IngestionMetric,
    ) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_metrics (
                observed_at, symbol, received, stored, errors,
                heartbeats, last_heartbeat, uptime_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(row.observed_at)
        .bind(&row.symbol)
        .bind(row.received)
        .bind(row.stored)
        .bind(row.errors)
        .bind(row.heartbeats)
        .bind(row.last_heartbeat)
        .bind(row.uptime_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_uptime_probe(&self, row: &UptimeProbe) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            INSERT INTO service_uptime_checks (observed_at, service_name, is_up)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(row.observed_at)
        .bind(&row.service_name)
        .bind(row.is_up)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent row per `(strike, option_type)` for `expiration`
    /// with `gamma > 0`, within `recency_window` of now.
    pub async fn read_latest_options(
        &self,
        symbol: &str,
        expiration: chrono::NaiveDate,
        recency_window: chrono::Duration,
    ) -> Result<Vec<OptionQuote>, PipelineError> {
        let cutoff = Utc::now() - recency_window;
        let rows = sqlx::query_as::<_, OptionQuoteRow>(
            r#"
            SELECT DISTINCT ON (strike, option_type)
                observed_at, root_symbol, strike, expiration, option_type, dte,
                bid, ask, mid, last, spread_pct,
                volume, open_interest, implied_vol,
                delta, gamma, theta, vega, rho, is_calculated,
                underlying_price
            FROM options_quotes
            WHERE root_symbol = $1 AND expiration = $2
                AND gamma > 0 AND observed_at >= $3
            ORDER BY strike, option_type, observed_at DESC
            "#,
        )
        .bind(symbol)
        .bind(expiration)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn read_latest_underlying(
        &self,
        symbol: &str,
    ) -> Result<Option<f64>, PipelineError> {
        let row: Option<(f64,)> = sqlx::query_as(
            r#"
            SELECT close FROM underlying_quotes
            WHERE symbol = $1
            ORDER BY observed_at DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(close,)| close))
    }

    /// Diagnostic-only: total row count, distinct expiration-date span,
    /// and latest `observed_at` for `symbol`, irrespective of the
    /// `gamma > 0` / recency filters `read_latest_options` applies.
    /// Used by the GEX calculator to explain an empty result without
    /// touching any persisted value.
    pub async fn quote_coverage_diagnostics(
        &self,
        symbol: &str,
    ) -> Result<QuoteCoverage, PipelineError> {
        let row: (i64, i64, Option<chrono::NaiveDate>, Option<chrono::NaiveDate>, Option<DateTime<Utc>>) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*),
                    COUNT(DISTINCT expiration),
                    MIN(expiration),
                    MAX(expiration),
                    MAX(observed_at)
                FROM options_quotes
                WHERE root_symbol = $1
                "#,
            )
            .bind(symbol)
            .fetch_one(&self.pool)
            .await?;
        Ok(QuoteCoverage {
            total_rows: row.0,
            distinct_expirations: row.1,
            min_expiration: row.2,
            max_expiration: row.3,
            latest_observed_at: row.4,
        })
    }
}

#[derive(Debug, Clone)]
pub struct QuoteCoverage {
    pub total_rows: i64,
    pub distinct_expirations: i64,
    pub min_expiration: Option<chrono::NaiveDate>,
    pub max_expiration: Option<chrono::NaiveDate>,
    pub latest_observed_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct OptionQuoteRow {
    observed_at: DateTime<Utc>,
    root_symbol: String,
    strike: f64,
    expiration: chrono::NaiveDate,
    option_type: String,
    dte: i64,
    bid: f64,
    ask: f64,
    mid: f64,
    last: f64,
    spread_pct: Option<f64>,
    volume: i64,
    open_interest: i64,
    implied_vol: f64,
    delta: f64,
    gamma: f64,
    theta: f64,
    vega: f64,
    rho: f64,
    is_calculated: bool,
    underlying_price: f64,
}

impl From<OptionQuoteRow> for OptionQuote {
    fn from(r: OptionQuoteRow) -> Self {
        OptionQuote {
            observed_at: r.observed_at,
            root_symbol: r.root_symbol,
            strike: r.strike,
            expiration: r.expiration,
            option_type: if r.option_type == "call" {
                OptionType::Call
            } else {
                OptionType::Put
            },
            dte: r.dte,
            bid: r.bid,
            ask: r.ask,
            mid: r.mid,
            last: r.last,
            spread_pct: r.spread_pct,
            volume: r.volume,
            open_interest: r.open_interest,
            implied_vol: r.implied_vol,
            delta: r.delta,
            gamma: r.gamma,
            theta: r.theta,
            vega: r.vega,
            rho: r.rho,
            is_calculated: r.is_calculated,
            underlying_price: r.underlying_price,
        }
    }
}

/// Issues `CREATE TABLE IF NOT EXISTS` for the six persisted tables.
pub async fn run_migrations(pool: &PgPool) -> Result<(), PipelineError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS options_quotes (
            observed_at TIMESTAMPTZ NOT NULL,
            root_symbol TEXT NOT NULL,
            strike DOUBLE PRECISION NOT NULL,
            expiration DATE NOT NULL,
            option_type TEXT NOT NULL,
            dte BIGINT NOT NULL,
            bid DOUBLE PRECISION NOT NULL,
            ask DOUBLE PRECISION NOT NULL,
            mid DOUBLE PRECISION NOT NULL,
            last DOUBLE PRECISION NOT NULL,
            spread_pct DOUBLE PRECISION,
            volume BIGINT NOT NULL,
            open_interest BIGINT NOT NULL,
            implied_vol DOUBLE PRECISION NOT NULL,
            delta DOUBLE PRECISION NOT NULL,
            gamma DOUBLE PRECISION NOT NULL,
            theta DOUBLE PRECISION NOT NULL,
            vega DOUBLE PRECISION NOT NULL,
            rho DOUBLE PRECISION NOT NULL,
            is_calculated BOOLEAN NOT NULL,
            underlying_price DOUBLE PRECISION NOT NULL,
            PRIMARY KEY (observed_at, root_symbol, strike, expiration, option_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS underlying_quotes (
            observed_at TIMESTAMPTZ NOT NULL,
            symbol TEXT NOT NULL,
            open DOUBLE PRECISION NOT NULL,
            high DOUBLE PRECISION NOT NULL,
            low DOUBLE PRECISION NOT NULL,
            close DOUBLE PRECISION NOT NULL,
            total_volume BIGINT NOT NULL,
            up_volume BIGINT NOT NULL,
            down_volume BIGINT NOT NULL,
            PRIMARY KEY (observed_at, symbol)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gex_metrics (
            observed_at TIMESTAMPTZ NOT NULL,
            symbol TEXT NOT NULL,
            expiration DATE NOT NULL,
            underlying_price DOUBLE PRECISION NOT NULL,
            total_gamma_exposure DOUBLE PRECISION NOT NULL,
            call_gamma DOUBLE PRECISION NOT NULL,
            put_gamma DOUBLE PRECISION NOT NULL,
            net_gex DOUBLE PRECISION NOT NULL,
            max_gamma_strike DOUBLE PRECISION NOT NULL,
            max_gamma_value DOUBLE PRECISION NOT NULL,
            gamma_flip_point DOUBLE PRECISION,
            max_pain DOUBLE PRECISION,
            put_call_ratio DOUBLE PRECISION NOT NULL,
            vanna_exposure DOUBLE PRECISION NOT NULL,
            charm_exposure DOUBLE PRECISION NOT NULL,
            call_volume BIGINT NOT NULL,
            put_volume BIGINT NOT NULL,
            call_oi BIGINT NOT NULL,
            put_oi BIGINT NOT NULL,
            total_contracts BIGINT NOT NULL,
            PRIMARY KEY (observed_at, symbol, expiration)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS option_flow_metrics (
            observed_at TIMESTAMPTZ NOT NULL,
            symbol TEXT NOT NULL,
            option_type TEXT NOT NULL,
            bucket_start TIMESTAMPTZ NOT NULL,
            bucket_end TIMESTAMPTZ NOT NULL,
            total_volume BIGINT NOT NULL,
            block_volume BIGINT NOT NULL,
            sweep_volume BIGINT NOT NULL,
            trade_count BIGINT NOT NULL,
            avg_premium NUMERIC NOT NULL,
            vwap_premium NUMERIC NOT NULL,
            notional_sum NUMERIC NOT NULL,
            avg_underlying_price DOUBLE PRECISION NOT NULL,
            avg_trade_size DOUBLE PRECISION NOT NULL,
            net_delta_exposure DOUBLE PRECISION NOT NULL,
            gamma_weighted_sum DOUBLE PRECISION NOT NULL,
            buy_volume BIGINT NOT NULL,
            sell_volume BIGINT NOT NULL,
            net_flow BIGINT NOT NULL,
            atm_volume BIGINT NOT NULL,
            itm_volume BIGINT NOT NULL,
            otm_volume BIGINT NOT NULL,
            starting_oi BIGINT NOT NULL,
            ending_oi BIGINT NOT NULL,
            oi_change BIGINT NOT NULL,
            unique_strikes BIGINT NOT NULL,
            max_trade_size BIGINT NOT NULL,
            PRIMARY KEY (observed_at, symbol, option_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingestion_metrics (
            observed_at TIMESTAMPTZ NOT NULL,
            symbol TEXT NOT NULL,
            received BIGINT NOT NULL,
            stored BIGINT NOT NULL,
            errors BIGINT NOT NULL,
            heartbeats BIGINT NOT NULL,
            last_heartbeat TIMESTAMPTZ,
            uptime_ms BIGINT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS service_uptime_checks (
            observed_at TIMESTAMPTZ NOT NULL,
            service_name TEXT NOT NULL,
            is_up BOOLEAN NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
