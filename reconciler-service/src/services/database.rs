use crate::config::MongoConfig;
use crate::models::{
    AccountMapping, DestinationTransaction, FieldMapping, FieldRule, SourceTransaction,
    SyncStatusRecord,
};
use crate::services::stores::{
    AccountMappingStore, DestinationTransactionStore, FieldMappingStore, SourceTransactionStore,
    SyncStatusStore,
};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, Bson, DateTime as BsonDateTime, Document},
    options::{IndexOptions, UpdateOptions},
    Client as MongoClient, Collection, Database, IndexModel,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;

const FIELD_MAPPINGS: &str = "field_mappings";
const ACCOUNT_MAPPINGS: &str = "account_mappings";
const SYNC_STATUS: &str = "sync_status";
const TRANSACTIONS: &str = "transactions";

/// Key of an account mapping document, as written by the account linker.
const ACCOUNT_MAPPING_KEY: &str = "nordigen_account_id";

/// MongoDB-backed implementation of every reconciler store.
#[derive(Clone)]
pub struct MongoStores {
    client: MongoClient,
    mapping_db: Database,
    source_db: Database,
    destination_db: Database,
}

impl MongoStores {
    pub async fn connect(config: &MongoConfig) -> Result<Self, AppError> {
        tracing::info!("Connecting to MongoDB");
        let client = MongoClient::with_uri_str(config.uri.expose_secret())
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to MongoDB: {}", e);
                AppError::from(e)
            })?;

        let stores = Self {
            mapping_db: client.database(&config.mapping_database),
            source_db: client.database(&config.source_database),
            destination_db: client.database(&config.destination_database),
            client,
        };

        tracing::info!(
            mapping_database = %config.mapping_database,
            source_database = %config.source_database,
            destination_database = %config.destination_database,
            "Successfully connected to MongoDB databases"
        );
        Ok(stores)
    }

    pub async fn initialize_indexes(&self) -> Result<(), AppError> {
        tracing::info!("Creating MongoDB indexes for reconciler-service");

        // One mark per (account, transaction); upserts rely on it
        let sync_key_index = IndexModel::builder()
            .keys(doc! { "account_id": 1, "transaction_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("sync_status_key".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        self.sync_status()
            .create_index(sync_key_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create sync_status key index: {}", e);
                AppError::from(e)
            })?;
        tracing::info!("Created index on sync_status.(account_id, transaction_id)");

        let field_mapping_index = IndexModel::builder()
            .keys(doc! { "account_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("field_mapping_account_lookup".to_string())
                    .build(),
            )
            .build();

        self.field_mappings()
            .create_index(field_mapping_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create field_mappings index: {}", e);
                AppError::from(e)
            })?;
        tracing::info!("Created index on field_mappings.account_id");

        let account_mapping_index = IndexModel::builder()
            .keys(doc! { ACCOUNT_MAPPING_KEY: 1 })
            .options(
                IndexOptions::builder()
                    .name("account_mapping_source_lookup".to_string())
                    .build(),
            )
            .build();

        self.account_mappings()
            .create_index(account_mapping_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create account_mappings index: {}", e);
                AppError::from(e)
            })?;
        tracing::info!("Created index on account_mappings.{}", ACCOUNT_MAPPING_KEY);

        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| {
                tracing::error!("MongoDB health check failed: {}", e);
                AppError::from(e)
            })?;
        Ok(())
    }

    fn field_mappings(&self) -> Collection<Document> {
        self.mapping_db.collection(FIELD_MAPPINGS)
    }

    fn account_mappings(&self) -> Collection<AccountMapping> {
        self.mapping_db.collection(ACCOUNT_MAPPINGS)
    }

    fn sync_status(&self) -> Collection<Document> {
        self.mapping_db.collection(SYNC_STATUS)
    }

    /// Upsert the rule set for an account, preserving rule order.
    pub async fn store_field_mapping(&self, mapping: &FieldMapping) -> Result<(), AppError> {
        self.field_mappings()
            .update_one(
                doc! { "account_id": mapping.account_id.as_str() },
                doc! { "$set": { "field_mapping": field_mapping_rules(mapping) } },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;

        tracing::info!(account_id = %mapping.account_id, "Stored field mapping");
        Ok(())
    }

    pub async fn store_account_mapping(&self, mapping: &AccountMapping) -> Result<(), AppError> {
        let document = mongodb::bson::to_document(mapping).map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Failed to encode account mapping: {}", e))
        })?;

        self.mapping_db
            .collection::<Document>(ACCOUNT_MAPPINGS)
            .update_one(
                doc! { ACCOUNT_MAPPING_KEY: mapping.source_account_id.as_str() },
                doc! { "$set": document },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;

        tracing::info!(
            source_account_id = %mapping.source_account_id,
            "Stored account mapping"
        );
        Ok(())
    }

    async fn find_transactions(
        collection: Collection<Document>,
        account_id: &str,
    ) -> Result<Vec<serde_json::Value>, AppError> {
        let cursor = collection
            .find(doc! { "account_id": account_id }, None)
            .await?;
        let documents: Vec<Document> = cursor.try_collect().await?;

        Ok(documents
            .into_iter()
            .map(|d| Bson::Document(d).into_relaxed_extjson())
            .collect())
    }
}

/// Rules as an ordered `{source_path: dest_field}` sub-document.
fn field_mapping_rules(mapping: &FieldMapping) -> Document {
    mapping
        .rules
        .iter()
        .map(|rule| (rule.source_path.clone(), Bson::from(rule.dest_field.as_str())))
        .collect()
}

/// Read the ordered `field_mapping` sub-document into rules.
fn parse_field_mapping(account_id: &str, document: &Document) -> FieldMapping {
    let rules = match document.get_document("field_mapping") {
        Ok(rules) => rules
            .iter()
            .filter_map(|(source_path, dest)| match dest.as_str() {
                Some(dest_field) => Some(FieldRule {
                    source_path: source_path.clone(),
                    dest_field: dest_field.to_string(),
                }),
                None => {
                    tracing::warn!(
                        account_id = %account_id,
                        source_path = %source_path,
                        "Ignoring field mapping rule with non-string destination"
                    );
                    None
                }
            })
            .collect(),
        Err(_) => Vec::new(),
    };

    FieldMapping {
        account_id: account_id.to_string(),
        rules,
    }
}

#[async_trait]
impl FieldMappingStore for MongoStores {
    async fn get_field_mapping(&self, account_id: &str) -> Result<Option<FieldMapping>, AppError> {
        let document = self
            .field_mappings()
            .find_one(doc! { "account_id": account_id }, None)
            .await?;

        match document {
            Some(document) => {
                tracing::debug!(account_id = %account_id, "Retrieved field mapping");
                Ok(Some(parse_field_mapping(account_id, &document)))
            }
            None => {
                tracing::warn!(account_id = %account_id, "No field mapping found");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl AccountMappingStore for MongoStores {
    async fn get_account_mapping(
        &self,
        source_account_id: &str,
    ) -> Result<Option<AccountMapping>, AppError> {
        let mapping = self
            .account_mappings()
            .find_one(doc! { ACCOUNT_MAPPING_KEY: source_account_id }, None)
            .await?;

        if mapping.is_none() {
            tracing::warn!(source_account_id = %source_account_id, "No account mapping found");
        }
        Ok(mapping)
    }
}

#[async_trait]
impl SourceTransactionStore for MongoStores {
    async fn fetch_source_transactions(
        &self,
        account_id: &str,
    ) -> Result<Vec<SourceTransaction>, AppError> {
        Self::find_transactions(self.source_db.collection(TRANSACTIONS), account_id).await
    }
}

#[async_trait]
impl DestinationTransactionStore for MongoStores {
    async fn fetch_destination_transactions(
        &self,
        dest_account_id: &str,
    ) -> Result<Vec<DestinationTransaction>, AppError> {
        Self::find_transactions(self.destination_db.collection(TRANSACTIONS), dest_account_id).await
    }
}

#[async_trait]
impl SyncStatusStore for MongoStores {
    async fn upsert_sync_status(&self, record: &SyncStatusRecord) -> Result<(), AppError> {
        self.sync_status()
            .update_one(
                doc! {
                    "account_id": record.account_id.as_str(),
                    "transaction_id": record.transaction_id.as_str(),
                },
                doc! { "$set": {
                    "sync_timestamp": BsonDateTime::from_chrono(record.sync_timestamp),
                } },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    async fn sync_status_exists(
        &self,
        account_id: &str,
        transaction_id: &str,
    ) -> Result<bool, AppError> {
        let status = self
            .sync_status()
            .find_one(
                doc! { "account_id": account_id, "transaction_id": transaction_id },
                None,
            )
            .await?;
        Ok(status.is_some())
    }
}
