use super::{PgRecordStore, RecordStore};
use crate::record::{FieldPatch, SENSOR_FIELDS};
use anyhow::Result;
use chrono::{TimeZone, Utc};
use serde_json::{json, Map};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::env;
use uuid::Uuid;

async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(&admin_pool)
        .await?;
    drop(admin_pool);

    let schema_name = schema.to_string();
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .after_connect(move |conn, _meta| {
            let schema = schema_name.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {}", schema))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;
    Ok(pool)
}

async fn drop_schema(database_url: &str, schema: &str) -> Result<()> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
        .execute(&admin_pool)
        .await;
    Ok(())
}

#[tokio::test]
async fn test_pg_store_projects_patches_and_deletes() -> Result<()> {
    if env::var("RECONCILER_INTEGRATION_TEST").ok().as_deref() != Some("1") {
        return Ok(());
    }
    let database_url = match env::var("RECONCILER_TEST_DATABASE_URL") {
        Ok(value) => value,
        Err(_) => return Ok(()),
    };

    let schema = format!("reconciler_test_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;
    let store = PgRecordStore::new(pool.clone(), "sensor_readings");
    store.ensure_schema().await?;

    let older = Uuid::new_v4();
    let newer = Uuid::new_v4();
    for (id, ts, doc) in [
        (
            older,
            Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(),
            json!({ "temperature": { "value": "n/a", "unit": "C" }, "deviceId": "esp32-01" }),
        ),
        (
            newer,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
            json!({ "temperature": 22.5 }),
        ),
    ] {
        sqlx::query("INSERT INTO sensor_readings (id, created_at, doc) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(ts)
            .bind(sqlx::types::Json(doc))
            .execute(&pool)
            .await?;
    }

    let rows = store.find_recent(&SENSOR_FIELDS, 10).await?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].id, newer);
    assert!(rows[1].doc.get("deviceId").is_none());

    let mut fields = Map::new();
    fields.insert(
        "temperature".to_string(),
        json!({ "value": 22.5, "unit": "C" }),
    );
    let modified = store
        .update_fields(
            older,
            &FieldPatch {
                fields,
                data_quality: Some("complete".to_string()),
                provenance: None,
            },
        )
        .await?;
    assert_eq!(modified, 1);

    let device: Option<String> =
        sqlx::query_scalar("SELECT doc->>'deviceId' FROM sensor_readings WHERE id = $1")
            .bind(older)
            .fetch_one(&pool)
            .await?;
    assert_eq!(device.as_deref(), Some("esp32-01"));

    let deleted = store.delete_many(&[newer, Uuid::new_v4()]).await?;
    assert_eq!(deleted, 1);
    let deleted_again = store.delete_many(&[newer]).await?;
    assert_eq!(deleted_again, 0);

    store.close().await;
    drop_schema(&database_url, &schema).await?;
    Ok(())
}
