//! Forward-only schema migrations.
//!
//! Each migration is a numbered SQL batch applied at most once. The runner
//! wraps the whole pass in an exclusive transaction: SQLite grants the
//! exclusive lock to a single process, which doubles as the advisory
//! migration lock, so concurrent processes serialize here.

use rusqlite::{Connection, TransactionBehavior};
use tracing::info;

use crate::error::{CoreError, CoreResult};

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial schema",
        sql: r#"
CREATE TABLE users (
    user_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    username    TEXT NOT NULL UNIQUE,
    created_at  TEXT NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE wallets (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id        INTEGER NOT NULL REFERENCES users(user_id),
    address        TEXT NOT NULL,
    chain          TEXT NOT NULL,
    label          TEXT,
    wallet_kind    TEXT NOT NULL,
    keystore_path  TEXT,
    created_at     TEXT NOT NULL,
    UNIQUE (address, chain)
);

CREATE TABLE transactions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_hash       TEXT NOT NULL UNIQUE,
    chain         TEXT NOT NULL,
    trace_id      TEXT,
    status        TEXT NOT NULL,
    block_number  INTEGER,
    created_at    TEXT NOT NULL,
    confirmed_at  TEXT
);

CREATE TABLE ledger_entries (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    trace_id             TEXT NOT NULL,
    user_id              INTEGER NOT NULL,
    wallet_address       TEXT NOT NULL,
    chain                TEXT NOT NULL,
    dex                  TEXT,
    entry_type           TEXT NOT NULL,
    description          TEXT NOT NULL,
    amount_base          TEXT NOT NULL,
    amount_native        TEXT NOT NULL,
    currency             TEXT NOT NULL,
    fx_rate_base         TEXT NOT NULL,
    realized_pnl_base    TEXT,
    realized_pnl_native  TEXT,
    tx_hash              TEXT,
    block_number         INTEGER,
    status               TEXT NOT NULL,
    metadata             TEXT NOT NULL,
    created_at           TEXT NOT NULL,
    UNIQUE (trace_id, entry_type)
);

CREATE INDEX idx_ledger_user_created ON ledger_entries (user_id, created_at);
CREATE INDEX idx_ledger_tx_hash ON ledger_entries (tx_hash);
CREATE INDEX idx_ledger_wallet_chain ON ledger_entries (wallet_address, chain);

CREATE TABLE token_metadata (
    address       TEXT NOT NULL,
    chain         TEXT NOT NULL,
    symbol        TEXT NOT NULL,
    name          TEXT,
    decimals      INTEGER NOT NULL DEFAULT 18,
    verified      INTEGER NOT NULL DEFAULT 0,
    risk_score    REAL,
    created_at    TEXT NOT NULL,
    refreshed_at  TEXT NOT NULL,
    PRIMARY KEY (address, chain)
);

CREATE TABLE blacklisted_tokens (
    address   TEXT NOT NULL,
    chain     TEXT NOT NULL,
    reason    TEXT NOT NULL,
    added_at  TEXT NOT NULL,
    PRIMARY KEY (address, chain)
);

CREATE TABLE advanced_orders (
    order_id            TEXT PRIMARY KEY,
    user_id             INTEGER NOT NULL,
    wallet_address      TEXT NOT NULL,
    order_type          TEXT NOT NULL,
    side                TEXT NOT NULL,
    token_address       TEXT NOT NULL,
    token_symbol        TEXT,
    pair_address        TEXT,
    chain               TEXT NOT NULL,
    dex                 TEXT,
    quantity            TEXT NOT NULL,
    remaining_quantity  TEXT NOT NULL,
    trigger_price       TEXT,
    parameters          TEXT NOT NULL,
    status              TEXT NOT NULL,
    execution_count     INTEGER NOT NULL DEFAULT 0,
    last_execution_at   TEXT,
    triggered_at        TEXT,
    fill_price          TEXT,
    trace_id            TEXT,
    error_message       TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    expires_at          TEXT
);

CREATE INDEX idx_orders_user ON advanced_orders (user_id);
CREATE INDEX idx_orders_status ON advanced_orders (status);
CREATE INDEX idx_orders_token_chain ON advanced_orders (token_address, chain);

CREATE TABLE order_executions (
    execution_id  TEXT PRIMARY KEY,
    order_id      TEXT NOT NULL REFERENCES advanced_orders(order_id),
    quantity      TEXT NOT NULL,
    price         TEXT NOT NULL,
    tx_hash       TEXT,
    status        TEXT NOT NULL,
    trace_id      TEXT,
    executed_at   TEXT NOT NULL
);

CREATE INDEX idx_executions_order ON order_executions (order_id);

CREATE TABLE positions (
    position_id          TEXT PRIMARY KEY,
    user_id              INTEGER NOT NULL,
    token_address        TEXT NOT NULL,
    chain                TEXT NOT NULL,
    quantity             TEXT NOT NULL,
    average_entry_price  TEXT NOT NULL,
    total_cost_base      TEXT NOT NULL,
    realized_pnl_base    TEXT NOT NULL,
    unrealized_pnl_base  TEXT,
    mark_price_missing   INTEGER NOT NULL DEFAULT 0,
    is_open              INTEGER NOT NULL DEFAULT 1,
    position_type        TEXT NOT NULL DEFAULT 'long',
    opened_at            TEXT NOT NULL,
    closed_at            TEXT,
    updated_at           TEXT NOT NULL,
    UNIQUE (user_id, token_address, chain)
);

CREATE TABLE system_states (
    state_id              TEXT PRIMARY KEY,
    status                TEXT NOT NULL,
    is_emergency_stopped  INTEGER NOT NULL DEFAULT 0,
    last_heartbeat_at     TEXT,
    state_changed_at      TEXT NOT NULL,
    uptime_seconds        INTEGER NOT NULL DEFAULT 0,
    restart_count         INTEGER NOT NULL DEFAULT 0,
    error_count           INTEGER NOT NULL DEFAULT 0,
    last_error            TEXT,
    configuration         TEXT,
    health_data           TEXT,
    updated_at            TEXT NOT NULL
);

CREATE TABLE system_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type  TEXT NOT NULL,
    severity    TEXT NOT NULL,
    component   TEXT,
    title       TEXT NOT NULL,
    message     TEXT NOT NULL,
    payload     TEXT,
    trace_id    TEXT,
    created_at  TEXT NOT NULL
);

CREATE INDEX idx_system_events_type ON system_events (event_type, created_at);

CREATE TABLE emergency_actions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    action_type   TEXT NOT NULL,
    components    TEXT NOT NULL,
    reason        TEXT NOT NULL,
    initiated_by  TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE TABLE approvals (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id           INTEGER NOT NULL,
    chain             TEXT NOT NULL,
    wallet_address    TEXT NOT NULL,
    token_address     TEXT NOT NULL,
    token_symbol      TEXT NOT NULL DEFAULT '',
    spender           TEXT NOT NULL,
    amount            TEXT NOT NULL,
    granted_at        TEXT NOT NULL,
    duration_seconds  INTEGER NOT NULL,
    last_used_at      TEXT,
    tx_hash           TEXT,
    UNIQUE (chain, wallet_address, token_address, spender)
);
"#,
    },
    Migration {
        version: 2,
        name: "ledger token lookup index",
        sql: r#"
CREATE INDEX idx_ledger_metadata_created ON ledger_entries (entry_type, created_at);
CREATE INDEX idx_approvals_granted ON approvals (granted_at);
"#,
    },
];

/// Apply all pending migrations. Safe to call on every startup.
pub fn run(conn: &mut Connection) -> CoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    // Exclusive transaction doubles as the cross-process migration lock.
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Exclusive)
        .map_err(CoreError::from)?;

    let current: i64 = tx
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .unwrap_or(0);

    let mut applied = current;
    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        tx.execute_batch(migration.sql).map_err(|e| {
            CoreError::StoreUnavailable(format!(
                "migration {} ({}) failed: {e}",
                migration.version, migration.name
            ))
        })?;
        applied = migration.version;
        info!(version = migration.version, name = migration.name, "migration applied");
    }

    if applied != current {
        tx.execute("DELETE FROM schema_version", [])?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [applied],
        )?;
    } else if current == 0 {
        tx.execute("INSERT INTO schema_version (version) VALUES (0)", [])?;
    }

    tx.commit().map_err(CoreError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_strictly_increasing() {
        let mut last = 0;
        for m in MIGRATIONS {
            assert!(m.version > last, "migration versions must increase");
            last = m.version;
        }
    }

    #[test]
    fn run_twice_is_a_noop() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap();
        let version: i64 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);
    }

    #[test]
    fn unique_constraints_present() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();

        conn.execute(
            "INSERT INTO ledger_entries (trace_id, user_id, wallet_address, chain, entry_type,
             description, amount_base, amount_native, currency, fx_rate_base, status, metadata, created_at)
             VALUES ('t1', 1, '0xw', 'ethereum', 'buy', 'd', '1', '1', 'ETH', '1', 'confirmed', '{}', '2024-01-01T00:00:00.000Z')",
            [],
        )
        .unwrap();
        // Sibling row with the same trace but a different entry type is fine.
        conn.execute(
            "INSERT INTO ledger_entries (trace_id, user_id, wallet_address, chain, entry_type,
             description, amount_base, amount_native, currency, fx_rate_base, status, metadata, created_at)
             VALUES ('t1', 1, '0xw', 'ethereum', 'gas_fee', 'd', '-1', '-1', 'ETH', '1', 'confirmed', '{}', '2024-01-01T00:00:00.000Z')",
            [],
        )
        .unwrap();
        // Exact duplicate is rejected.
        let dup = conn.execute(
            "INSERT INTO ledger_entries (trace_id, user_id, wallet_address, chain, entry_type,
             description, amount_base, amount_native, currency, fx_rate_base, status, metadata, created_at)
             VALUES ('t1', 1, '0xw', 'ethereum', 'buy', 'd', '1', '1', 'ETH', '1', 'confirmed', '{}', '2024-01-01T00:00:00.000Z')",
            [],
        );
        assert!(dup.is_err());
    }
}
