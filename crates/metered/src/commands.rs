// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One-shot operator commands.

use metered_config::model::MeteredConfig;
use metered_core::{Credits, MeteredError, OperationId, UserId};

use crate::serve::Services;

pub async fn balance(config: &MeteredConfig, user: &str) -> Result<String, MeteredError> {
    let services = Services::open(config).await?;
    let credits = services.ledger.balance(&UserId::new(user)).await?;
    Ok(format!("{user}: {credits} credits"))
}

pub async fn grant(
    config: &MeteredConfig,
    user: &str,
    amount: Credits,
) -> Result<String, MeteredError> {
    let services = Services::open(config).await?;
    let balance = services.ledger.grant(&UserId::new(user), amount).await?;
    Ok(format!("granted {amount} credits to {user}, balance now {balance}"))
}

/// The operation record as pretty-printed JSON.
pub async fn operation(config: &MeteredConfig, id: &str) -> Result<String, MeteredError> {
    let services = Services::open(config).await?;
    let operation = services.ledger.operation(&OperationId(id.to_string())).await?;
    serde_json::to_string_pretty(&operation)
        .map_err(|e| MeteredError::Internal(format!("could not render operation: {e}")))
}

pub async fn reconcile(config: &MeteredConfig) -> Result<String, MeteredError> {
    let services = Services::open(config).await?;
    let report = services.reconciler(config).sweep().await?;
    Ok(format!(
        "checked {} reservations, compensated {}, re-settled {} operations, {} errors",
        report.checked, report.compensated, report.resettled, report.errors
    ))
}

pub async fn drive(config: &MeteredConfig) -> Result<String, MeteredError> {
    let services = Services::open(config).await?;
    let report = services.driver(config).poll_once().await?;
    Ok(format!(
        "examined {} pending operations: {} charged, {} refunded, {} waiting, {} errors",
        report.examined, report.charged, report.refunded, report.waiting, report.errors
    ))
}

#[cfg(test)]
mod tests {
    use metered_config::model::StorageConfig;
    use tempfile::TempDir;

    use super::*;

    fn config(dir: &TempDir) -> MeteredConfig {
        MeteredConfig {
            storage: StorageConfig {
                database_path: dir.path().join("cli.db").to_string_lossy().to_string(),
                ..StorageConfig::default()
            },
            ..MeteredConfig::default()
        }
    }

    #[tokio::test]
    async fn grant_then_balance() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let out = grant(&config, "alice", 25).await.unwrap();
        assert!(out.contains("balance now 25"), "{out}");
        assert_eq!(balance(&config, "alice").await.unwrap(), "alice: 25 credits");
    }

    #[tokio::test]
    async fn operation_prints_json() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let services = Services::open(&config).await.unwrap();
        let user = UserId::new("bob");
        services.ledger.grant(&user, 10).await.unwrap();
        let id = services
            .ledger
            .start(&user, metered_core::Feature::Image, 4, serde_json::json!({"size": "1024"}))
            .await
            .unwrap();

        let out = operation(&config, id.as_str()).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["status"], "pending");
        assert_eq!(parsed["estimate"], 4);
        assert_eq!(parsed["feature"], "image");
    }

    #[tokio::test]
    async fn unknown_operation_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = operation(&config(&dir), "missing").await.unwrap_err();
        assert!(matches!(err, MeteredError::OperationNotFound(_)));
    }

    #[tokio::test]
    async fn sweeps_on_empty_database_report_nothing() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        assert!(reconcile(&config).await.unwrap().contains("compensated 0"));
        assert!(drive(&config).await.unwrap().starts_with("examined 0"));
    }
}
