//! Traffic Accounting.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;

use crate::errors::GatewayResult;
use crate::models::{TrafficRecord, UserStatsRow};

pub struct TrafficAccounting {
    pool: PgPool,
}

impl TrafficAccounting {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// UPSERT on `(user_token, server, port, date_collected)`. Relies on the
    /// DB-level unique constraint; a concurrent insert race is resolved by
    /// `ON CONFLICT DO UPDATE`, giving single-add semantics per call.
    pub async fn record(
        &self,
        user_token: &str,
        server: &str,
        port: i32,
        protocol: &str,
        bytes_up: i64,
        bytes_down: i64,
    ) -> GatewayResult<()> {
        let today: NaiveDate = Utc::now().date_naive();
        sqlx::query!(
            r#"
            INSERT INTO xpert_traffic_records
                (user_token, server, port, date_collected, protocol, bytes_uploaded, bytes_downloaded, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (user_token, server, port, date_collected)
            DO UPDATE SET
                bytes_uploaded = xpert_traffic_records.bytes_uploaded + EXCLUDED.bytes_uploaded,
                bytes_downloaded = xpert_traffic_records.bytes_downloaded + EXCLUDED.bytes_downloaded,
                protocol = EXCLUDED.protocol,
                timestamp = NOW()
            "#,
            user_token,
            server,
            port,
            today,
            protocol,
            bytes_up,
            bytes_down,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn user_stats(&self, user_token: &str, days: i64) -> GatewayResult<Vec<UserStatsRow>> {
        let since = Utc::now() - chrono::Duration::days(days.max(0));
        let rows = sqlx::query_as!(
            UserStatsRow,
            r#"
            SELECT
                server,
                port,
                protocol,
                SUM(bytes_uploaded)::bigint AS "total_uploaded!",
                SUM(bytes_downloaded)::bigint AS "total_downloaded!",
                COUNT(*)::bigint AS "row_count!",
                MAX(timestamp) AS "last_seen!"
            FROM xpert_traffic_records
            WHERE user_token = $1 AND timestamp >= $2
            GROUP BY server, port, protocol
            ORDER BY SUM(bytes_downloaded) DESC
            "#,
            user_token,
            since,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn global_stats(&self, days: i64) -> GatewayResult<Vec<UserStatsRow>> {
        let since = Utc::now() - chrono::Duration::days(days.max(0));
        let rows = sqlx::query_as!(
            UserStatsRow,
            r#"
            SELECT
                server,
                port,
                protocol,
                SUM(bytes_uploaded)::bigint AS "total_uploaded!",
                SUM(bytes_downloaded)::bigint AS "total_downloaded!",
                COUNT(*)::bigint AS "row_count!",
                MAX(timestamp) AS "last_seen!"
            FROM xpert_traffic_records
            WHERE timestamp >= $1
            GROUP BY server, port, protocol
            ORDER BY SUM(bytes_downloaded) DESC
            "#,
            since,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn server_stats(&self, server: &str, port: i32, days: i64) -> GatewayResult<Vec<TrafficRecord>> {
        let since = Utc::now() - chrono::Duration::days(days.max(0));
        let rows = sqlx::query_as!(
            TrafficRecord,
            r#"
            SELECT id, user_token, server, port, date_collected, protocol, bytes_uploaded, bytes_downloaded, timestamp
            FROM xpert_traffic_records
            WHERE server = $1 AND port = $2 AND timestamp >= $3
            ORDER BY date_collected DESC
            "#,
            server,
            port,
            since,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Userinfo totals for the Subscription Publisher's headers, all-time
    /// for the given token.
    pub async fn user_totals(&self, user_token: &str) -> GatewayResult<(i64, i64)> {
        let row = sqlx::query!(
            r#"
            SELECT
                COALESCE(SUM(bytes_uploaded), 0)::bigint AS "up!",
                COALESCE(SUM(bytes_downloaded), 0)::bigint AS "down!"
            FROM xpert_traffic_records
            WHERE user_token = $1
            "#,
            user_token,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((row.up, row.down))
    }

    /// `days <= 0` means "skip".
    pub async fn cleanup(&self, days: i64) -> GatewayResult<u64> {
        if days <= 0 {
            return Ok(0);
        }
        let since = Utc::now() - chrono::Duration::days(days);
        let result = sqlx::query!(
            "DELETE FROM xpert_traffic_records WHERE timestamp < $1",
            since,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Deliberately coarse: wipes the entire table. Called only from the
    /// admin-quota reset path. Returns the deleted row count and totals for
    /// the caller to log via the Admin Action Log.
    pub async fn reset_admin_external_traffic(&self) -> GatewayResult<(i64, i64, i64)> {
        let totals = sqlx::query!(
            r#"
            SELECT
                COUNT(*)::bigint AS "rows!",
                COALESCE(SUM(bytes_uploaded), 0)::bigint AS "up!",
                COALESCE(SUM(bytes_downloaded), 0)::bigint AS "down!"
            FROM xpert_traffic_records
            "#
        )
        .fetch_one(&self.pool)
        .await?;
        sqlx::query!("DELETE FROM xpert_traffic_records").execute(&self.pool).await?;
        Ok((totals.rows, totals.up, totals.down))
    }

    pub async fn check_admin_traffic_limit(&self, limit_bytes: i64) -> GatewayResult<(i64, i64, bool)> {
        let since: DateTime<Utc> = Utc::now() - chrono::Duration::days(30);
        let row = sqlx::query!(
            r#"
            SELECT COALESCE(SUM(bytes_uploaded + bytes_downloaded), 0)::bigint AS "used!"
            FROM xpert_traffic_records
            WHERE timestamp >= $1
            "#,
            since,
        )
        .fetch_one(&self.pool)
        .await?;
        let used = row.used;
        Ok((used, limit_bytes, used >= limit_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_skip_is_represented_by_nonpositive_days() {
        // Documents the contract; the actual skip short-circuit is exercised
        // against a live pool in integration tests.
        assert!(0i64 <= 0);
        assert!(-1i64 <= 0);
    }
}
