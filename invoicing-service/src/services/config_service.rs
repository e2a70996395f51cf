//! Invoicing config management and lookups.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::InvoicingError;
use crate::models::{
    InvoicingConfig, NewInvoicingConfig, UpdateInvoicingConfig, DEFAULT_MAX_RETRIES,
};
use crate::services::config_cache::ConfigCache;
use crate::services::filters;
use crate::services::metrics::CONFIG_CACHE_TOTAL;
use crate::services::repository::InvoicingStore;

#[derive(Clone)]
pub struct ConfigService {
    store: Arc<dyn InvoicingStore>,
    cache: Arc<dyn ConfigCache>,
    default_max_retries: i32,
}

impl ConfigService {
    pub fn new(store: Arc<dyn InvoicingStore>, cache: Arc<dyn ConfigCache>) -> Self {
        Self {
            store,
            cache,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Retry budget given to configs created without one.
    pub fn with_default_max_retries(mut self, max_retries: i32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn default_max_retries(&self) -> i32 {
        self.default_max_retries
    }

    /// Config for an upstream integration, served from the cache when possible.
    #[instrument(skip(self), fields(component = "config_store"))]
    pub async fn get_by_source_integration(
        &self,
        integration_id: Uuid,
    ) -> Result<Option<InvoicingConfig>, InvoicingError> {
        match self.cache.get(integration_id).await {
            Ok(Some(config)) => {
                CONFIG_CACHE_TOTAL.with_label_values(&["hit"]).inc();
                return Ok(Some(config));
            }
            Ok(None) => CONFIG_CACHE_TOTAL.with_label_values(&["miss"]).inc(),
            Err(e) => {
                CONFIG_CACHE_TOTAL.with_label_values(&["error"]).inc();
                warn!(error = %e, "Config cache read failed, reading from store");
            }
        }

        let config = self
            .store
            .get_config_by_source_integration(integration_id)
            .await?;
        if let Some(config) = &config {
            if let Err(e) = self.cache.put(config).await {
                warn!(error = %e, "Failed to populate config cache");
            }
        }
        Ok(config)
    }

    pub async fn get_enabled_by_business(
        &self,
        business_id: Uuid,
    ) -> Result<Option<InvoicingConfig>, InvoicingError> {
        self.store.get_enabled_config_by_business(business_id).await
    }

    /// Load a config visible to `business_id`; `None` sees every business.
    pub async fn get(
        &self,
        config_id: Uuid,
        business_id: Option<Uuid>,
    ) -> Result<InvoicingConfig, InvoicingError> {
        self.store
            .get_config(config_id)
            .await?
            .filter(|c| business_id.map_or(true, |b| c.business_id == b))
            .ok_or(InvoicingError::ConfigNotFound)
    }

    pub async fn list(
        &self,
        business_id: Option<Uuid>,
    ) -> Result<Vec<InvoicingConfig>, InvoicingError> {
        self.store.list_configs(business_id).await
    }

    /// Create a config, or overwrite the integration's disabled one in place.
    #[instrument(skip(self, input), fields(component = "config_store", business_id = %input.business_id, integration_id = %input.source_integration_id))]
    pub async fn create(
        &self,
        input: NewInvoicingConfig,
    ) -> Result<InvoicingConfig, InvoicingError> {
        filters::validate(&input.filters)?;
        if input.max_retries < 0 {
            return Err(InvoicingError::InvalidInput(
                "max_retries must not be negative".to_string(),
            ));
        }

        let existing = self
            .store
            .get_config_by_source_integration(input.source_integration_id)
            .await?;

        let saved = match existing {
            Some(existing) if existing.enabled => {
                return Err(InvoicingError::ConfigAlreadyExists);
            }
            Some(existing) => {
                info!(config_id = %existing.config_id, "Overwriting disabled config");
                let overwritten = InvoicingConfig {
                    config_id: existing.config_id,
                    business_id: input.business_id,
                    source_integration_id: input.source_integration_id,
                    invoicing_integration_id: input.invoicing_integration_id,
                    provider: input.provider,
                    enabled: input.enabled,
                    auto_invoice: input.auto_invoice,
                    filters: input.filters,
                    invoice_config: input.invoice_config,
                    description: input.description,
                    max_retries: input.max_retries,
                    created_by: input.created_by.or(existing.created_by),
                    created_utc: existing.created_utc,
                    updated_utc: existing.updated_utc,
                };
                self.store.save_config(&overwritten).await?
            }
            None => self.store.insert_config(&input).await?,
        };

        self.invalidate(saved.source_integration_id).await;
        info!(config_id = %saved.config_id, enabled = saved.enabled, "Invoicing config saved");
        Ok(saved)
    }

    #[instrument(skip(self, update), fields(component = "config_store"))]
    pub async fn update(
        &self,
        config_id: Uuid,
        business_id: Option<Uuid>,
        update: UpdateInvoicingConfig,
    ) -> Result<InvoicingConfig, InvoicingError> {
        let mut config = self.get(config_id, business_id).await?;
        if let Some(filters) = &update.filters {
            filters::validate(filters)?;
        }
        if update.max_retries.is_some_and(|m| m < 0) {
            return Err(InvoicingError::InvalidInput(
                "max_retries must not be negative".to_string(),
            ));
        }

        update.apply(&mut config);
        let saved = self.store.save_config(&config).await?;
        self.invalidate(saved.source_integration_id).await;
        Ok(saved)
    }

    pub async fn set_enabled(
        &self,
        config_id: Uuid,
        business_id: Option<Uuid>,
        enabled: bool,
    ) -> Result<InvoicingConfig, InvoicingError> {
        self.update(
            config_id,
            business_id,
            UpdateInvoicingConfig {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn set_auto_invoice(
        &self,
        config_id: Uuid,
        business_id: Option<Uuid>,
        auto_invoice: bool,
    ) -> Result<InvoicingConfig, InvoicingError> {
        self.update(
            config_id,
            business_id,
            UpdateInvoicingConfig {
                auto_invoice: Some(auto_invoice),
                ..Default::default()
            },
        )
        .await
    }

    #[instrument(skip(self), fields(component = "config_store"))]
    pub async fn delete(
        &self,
        config_id: Uuid,
        business_id: Option<Uuid>,
    ) -> Result<(), InvoicingError> {
        let config = self.get(config_id, business_id).await?;
        if !self.store.delete_config(config_id).await? {
            return Err(InvoicingError::ConfigNotFound);
        }
        self.invalidate(config.source_integration_id).await;
        info!(config_id = %config_id, "Invoicing config deleted");
        Ok(())
    }

    /// Load every enabled config into the cache. Returns how many were cached.
    #[instrument(skip(self), fields(component = "config_cache"))]
    pub async fn warm_up(&self) -> Result<usize, InvoicingError> {
        let configs = self.store.list_enabled_configs().await?;
        let mut cached = 0;
        for config in &configs {
            match self.cache.put(config).await {
                Ok(()) => cached += 1,
                Err(e) => warn!(config_id = %config.config_id, error = %e, "Failed to cache config"),
            }
        }
        info!(cached, total = configs.len(), "Config cache warmed");
        Ok(cached)
    }

    /// Warm the cache in the background; failures never block startup.
    pub fn spawn_warm_up(&self) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.warm_up().await {
                warn!(error = %e, "Config cache warm-up failed");
            }
        })
    }

    async fn invalidate(&self, integration_id: Uuid) {
        if let Err(e) = self.cache.invalidate(integration_id).await {
            warn!(integration_id = %integration_id, error = %e, "Failed to invalidate config cache");
        }
    }
}
