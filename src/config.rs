use crate::error::MergeDbError;

/// Runtime configuration for a mergedb instance.
#[derive(Debug, Clone)]
pub struct MergeDbConfig {
    pub node_tag: String,
    pub database_name: String,
    pub database_id: String,
    pub database_group_id: String,
    pub cluster_transaction_id: String,
    pub identity_parts_separator: char,
    pub max_batches_per_transaction: usize,
    pub max_commands_per_transaction: usize,
    pub epoch_max_wait_us: u64,
    pub merger_queue_capacity: usize,
    pub submit_timeout_ms: u64,
    pub max_identity_retries: usize,
    pub cluster_commit_timeout_ms: u64,
    pub cluster_result_cache_size: usize,
    pub bulk_insert_threshold_bytes: usize,
    pub bulk_min_flush_bytes: usize,
    pub replay_progress_interval: u64,
}

impl Default for MergeDbConfig {
    fn default() -> Self {
        Self {
            node_tag: "A".into(),
            database_name: "db".into(),
            database_id: "AAAAAAAAAAAAAAAAAAAAAA".into(),
            database_group_id: "GGGGGGGGGGGGGGGGGGGGGG".into(),
            cluster_transaction_id: "TTTTTTTTTTTTTTTTTTTTTT".into(),
            identity_parts_separator: '/',
            max_batches_per_transaction: 64,
            max_commands_per_transaction: 16 * 1024,
            epoch_max_wait_us: 100,
            merger_queue_capacity: 1024,
            submit_timeout_ms: 30_000,
            max_identity_retries: 8,
            cluster_commit_timeout_ms: 15_000,
            cluster_result_cache_size: 1024,
            bulk_insert_threshold_bytes: 32 * 1024 * 1024,
            bulk_min_flush_bytes: 1024 * 1024,
            replay_progress_interval: 1024,
        }
    }
}

impl MergeDbConfig {
    /// Fresh identifiers for every id field, for databases created at runtime.
    pub fn with_generated_ids(node_tag: &str, database_name: &str) -> Self {
        Self {
            node_tag: node_tag.to_string(),
            database_name: database_name.to_string(),
            database_id: short_id(),
            database_group_id: short_id(),
            cluster_transaction_id: short_id(),
            ..Self::default()
        }
    }

    pub fn production() -> Self {
        Self {
            max_batches_per_transaction: 128,
            submit_timeout_ms: 60_000,
            ..Self::default()
        }
    }

    pub fn development() -> Self {
        Self {
            submit_timeout_ms: 5_000,
            cluster_commit_timeout_ms: 2_000,
            bulk_insert_threshold_bytes: 4 * 1024 * 1024,
            ..Self::default()
        }
    }

    /// Low-latency profile: small epochs so single batches are not held back.
    pub fn low_latency() -> Self {
        Self {
            max_batches_per_transaction: 16,
            epoch_max_wait_us: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), MergeDbError> {
        if self.node_tag.is_empty() || self.node_tag.contains([':', '-', ',', ' ']) {
            return Err(MergeDbError::InvalidConfig {
                message: format!("node tag '{}' is not a valid change vector tag", self.node_tag),
            });
        }
        for (name, value) in [
            ("database_id", &self.database_id),
            ("database_group_id", &self.database_group_id),
            ("cluster_transaction_id", &self.cluster_transaction_id),
        ] {
            if value.is_empty() || value.contains([',', ' ']) {
                return Err(MergeDbError::InvalidConfig {
                    message: format!("{name} '{value}' is not a valid change vector node id"),
                });
            }
        }
        if self.max_batches_per_transaction == 0 || self.max_commands_per_transaction == 0 {
            return Err(MergeDbError::InvalidConfig {
                message: "transaction limits must be non-zero".into(),
            });
        }
        if self.merger_queue_capacity == 0 {
            return Err(MergeDbError::InvalidConfig {
                message: "merger_queue_capacity must be non-zero".into(),
            });
        }
        if self.bulk_insert_threshold_bytes == 0 {
            return Err(MergeDbError::InvalidConfig {
                message: "bulk_insert_threshold_bytes must be non-zero".into(),
            });
        }
        if self.replay_progress_interval == 0 {
            return Err(MergeDbError::InvalidConfig {
                message: "replay_progress_interval must be non-zero".into(),
            });
        }
        Ok(())
    }
}

fn short_id() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    simple[..22].to_string()
}

#[cfg(test)]
mod tests {
    use super::MergeDbConfig;

    #[test]
    fn profiles_validate() {
        MergeDbConfig::default().validate().expect("default");
        MergeDbConfig::production().validate().expect("production");
        MergeDbConfig::development().validate().expect("development");
        MergeDbConfig::low_latency().validate().expect("low latency");
        MergeDbConfig::with_generated_ids("B", "orders")
            .validate()
            .expect("generated");
    }

    #[test]
    fn rejects_tag_that_breaks_text_encoding() {
        let config = MergeDbConfig {
            node_tag: "A:1".into(),
            ..MergeDbConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
