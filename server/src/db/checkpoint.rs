//! Persistence for the server's own replication checkpoint, keyed by node ID.

use carry_engine::PersistedCheckpoint;
use sqlx::{PgPool, Row};

pub async fn load_checkpoint(pool: &PgPool, node_id: &str) -> Result<Option<PersistedCheckpoint>, sqlx::Error> {
    let row = sqlx::query("SELECT id, node_id, ts, sequences FROM checkpoints WHERE node_id = $1")
        .bind(node_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| {
        let sequences: serde_json::Value = r.get("sequences");
        PersistedCheckpoint {
            id: r.get("id"),
            node_id: r.get("node_id"),
            ts: r.get("ts"),
            sequences: serde_json::from_value(sequences).unwrap_or_default(),
        }
    }))
}

pub async fn save_checkpoint(pool: &PgPool, checkpoint: &PersistedCheckpoint) -> Result<(), sqlx::Error> {
    let sequences = serde_json::to_value(&checkpoint.sequences).unwrap_or(serde_json::Value::Null);
    sqlx::query(
        r#"
        INSERT INTO checkpoints (id, node_id, ts, sequences)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (id) DO UPDATE SET
            ts = EXCLUDED.ts,
            sequences = EXCLUDED.sequences
        "#,
    )
    .bind(&checkpoint.id)
    .bind(&checkpoint.node_id)
    .bind(checkpoint.ts)
    .bind(sequences)
    .execute(pool)
    .await?;
    Ok(())
}
