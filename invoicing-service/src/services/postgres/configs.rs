//! Invoicing config persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::InvoicingError;
use crate::models::{
    resolve_integration_id, FilterSet, InvoicingConfig, NewInvoicingConfig, ProviderConfig,
};
use crate::services::database::{db_error, Database};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::repository::{ConfigRepository, StoreResult};

const CONFIG_COLUMNS: &str = r#"
    config_id, business_id, source_integration_id, invoicing_integration_id,
    invoicing_provider_id, provider, enabled, auto_invoice, filters, invoice_config,
    description, max_retries, created_by, created_utc, updated_utc
"#;

#[derive(sqlx::FromRow)]
struct ConfigRow {
    config_id: Uuid,
    business_id: Uuid,
    source_integration_id: Uuid,
    invoicing_integration_id: Option<Uuid>,
    invoicing_provider_id: Option<Uuid>,
    provider: String,
    enabled: bool,
    auto_invoice: bool,
    filters: Json<FilterSet>,
    invoice_config: Json<serde_json::Value>,
    description: Option<String>,
    max_retries: i32,
    created_by: Option<Uuid>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl ConfigRow {
    fn into_config(self) -> StoreResult<InvoicingConfig> {
        let invoicing_integration_id =
            resolve_integration_id(self.invoicing_integration_id, self.invoicing_provider_id)
                .ok_or(InvoicingError::ProviderNotConfigured(self.source_integration_id))?;

        Ok(InvoicingConfig {
            config_id: self.config_id,
            business_id: self.business_id,
            source_integration_id: self.source_integration_id,
            invoicing_integration_id,
            provider: self.provider,
            enabled: self.enabled,
            auto_invoice: self.auto_invoice,
            filters: self.filters.0,
            invoice_config: ProviderConfig::from_value(self.invoice_config.0),
            description: self.description,
            max_retries: self.max_retries,
            created_by: self.created_by,
            created_utc: self.created_utc,
            updated_utc: self.updated_utc,
        })
    }
}

fn config_write_error(operation: &str, err: sqlx::Error) -> InvoicingError {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.is_unique_violation() {
            return match db_err.constraint() {
                Some("uq_invoicing_configs_enabled_business") => {
                    InvoicingError::ActiveInvoicingConfigExists
                }
                _ => InvoicingError::ConfigAlreadyExists,
            };
        }
    }
    db_error(operation, err)
}

fn collect(rows: Vec<ConfigRow>) -> StoreResult<Vec<InvoicingConfig>> {
    rows.into_iter().map(ConfigRow::into_config).collect()
}

#[async_trait]
impl ConfigRepository for Database {
    #[instrument(skip(self, input), fields(business_id = %input.business_id, source_integration_id = %input.source_integration_id))]
    async fn insert_config(&self, input: &NewInvoicingConfig) -> StoreResult<InvoicingConfig> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_config"])
            .start_timer();

        let row = sqlx::query_as::<_, ConfigRow>(&format!(
            r#"
            INSERT INTO invoicing_configs (
                config_id, business_id, source_integration_id, invoicing_integration_id,
                provider, enabled, auto_invoice, filters, invoice_config, description,
                max_retries, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {CONFIG_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(input.business_id)
        .bind(input.source_integration_id)
        .bind(input.invoicing_integration_id)
        .bind(&input.provider)
        .bind(input.enabled)
        .bind(input.auto_invoice)
        .bind(Json(&input.filters))
        .bind(Json(&input.invoice_config))
        .bind(&input.description)
        .bind(input.max_retries)
        .bind(input.created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| config_write_error("insert config", e))?;

        timer.observe_duration();

        let config = row.into_config()?;
        info!(config_id = %config.config_id, enabled = config.enabled, "Invoicing config created");
        Ok(config)
    }

    #[instrument(skip(self, config), fields(config_id = %config.config_id))]
    async fn save_config(&self, config: &InvoicingConfig) -> StoreResult<InvoicingConfig> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_config"])
            .start_timer();

        let row = sqlx::query_as::<_, ConfigRow>(&format!(
            r#"
            UPDATE invoicing_configs
            SET invoicing_integration_id = $2,
                provider = $3,
                enabled = $4,
                auto_invoice = $5,
                filters = $6,
                invoice_config = $7,
                description = $8,
                max_retries = $9,
                created_by = $10,
                business_id = $11,
                updated_utc = NOW()
            WHERE config_id = $1 AND deleted_utc IS NULL
            RETURNING {CONFIG_COLUMNS}
            "#
        ))
        .bind(config.config_id)
        .bind(config.invoicing_integration_id)
        .bind(&config.provider)
        .bind(config.enabled)
        .bind(config.auto_invoice)
        .bind(Json(&config.filters))
        .bind(Json(&config.invoice_config))
        .bind(&config.description)
        .bind(config.max_retries)
        .bind(config.created_by)
        .bind(config.business_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| config_write_error("save config", e))?;

        timer.observe_duration();

        row.ok_or(InvoicingError::ConfigNotFound)?.into_config()
    }

    #[instrument(skip(self))]
    async fn get_config(&self, config_id: Uuid) -> StoreResult<Option<InvoicingConfig>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_config"])
            .start_timer();

        let row = sqlx::query_as::<_, ConfigRow>(&format!(
            "SELECT {CONFIG_COLUMNS} FROM invoicing_configs WHERE config_id = $1 AND deleted_utc IS NULL"
        ))
        .bind(config_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get config", e))?;

        timer.observe_duration();

        row.map(ConfigRow::into_config).transpose()
    }

    #[instrument(skip(self))]
    async fn get_config_by_source_integration(
        &self,
        integration_id: Uuid,
    ) -> StoreResult<Option<InvoicingConfig>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_config_by_source_integration"])
            .start_timer();

        let row = sqlx::query_as::<_, ConfigRow>(&format!(
            r#"
            SELECT {CONFIG_COLUMNS} FROM invoicing_configs
            WHERE source_integration_id = $1 AND deleted_utc IS NULL
            "#
        ))
        .bind(integration_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get config by integration", e))?;

        timer.observe_duration();

        row.map(ConfigRow::into_config).transpose()
    }

    #[instrument(skip(self))]
    async fn get_enabled_config_by_business(
        &self,
        business_id: Uuid,
    ) -> StoreResult<Option<InvoicingConfig>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_enabled_config_by_business"])
            .start_timer();

        let row = sqlx::query_as::<_, ConfigRow>(&format!(
            r#"
            SELECT {CONFIG_COLUMNS} FROM invoicing_configs
            WHERE business_id = $1 AND enabled AND deleted_utc IS NULL
            "#
        ))
        .bind(business_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get enabled config", e))?;

        timer.observe_duration();

        row.map(ConfigRow::into_config).transpose()
    }

    #[instrument(skip(self))]
    async fn list_configs(&self, business_id: Option<Uuid>) -> StoreResult<Vec<InvoicingConfig>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_configs"])
            .start_timer();

        let rows = sqlx::query_as::<_, ConfigRow>(&format!(
            r#"
            SELECT {CONFIG_COLUMNS} FROM invoicing_configs
            WHERE deleted_utc IS NULL AND ($1::uuid IS NULL OR business_id = $1)
            ORDER BY created_utc DESC
            "#
        ))
        .bind(business_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list configs", e))?;

        timer.observe_duration();

        collect(rows)
    }

    #[instrument(skip(self))]
    async fn list_enabled_configs(&self) -> StoreResult<Vec<InvoicingConfig>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_enabled_configs"])
            .start_timer();

        let rows = sqlx::query_as::<_, ConfigRow>(&format!(
            "SELECT {CONFIG_COLUMNS} FROM invoicing_configs WHERE enabled AND deleted_utc IS NULL"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list enabled configs", e))?;

        timer.observe_duration();

        collect(rows)
    }

    #[instrument(skip(self))]
    async fn delete_config(&self, config_id: Uuid) -> StoreResult<bool> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_config"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE invoicing_configs
            SET deleted_utc = NOW(), enabled = FALSE, updated_utc = NOW()
            WHERE config_id = $1 AND deleted_utc IS NULL
            "#,
        )
        .bind(config_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("delete config", e))?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }
}
