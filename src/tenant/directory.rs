//! Read-only tenant directory: tenants, their provisioned stores, and accounts.

use async_trait::async_trait;
use libsql::params;

use crate::error::DatabaseError;
use crate::store::LibSqlBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantInfo {
    pub id: String,
    pub name: String,
    /// Ids of the tenant's provisioned stores (tenant-details).
    pub detail_ids: Vec<String>,
}

/// One provisioned store of a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailInfo {
    pub id: String,
    pub tenant_id: String,
    pub store_name: String,
    pub tax_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub id: String,
    pub detail_id: String,
    pub bank_name: Option<String>,
    pub account_number: Option<String>,
}

/// Lookups against the tenant directory.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn lookup_tenant(&self, tenant_id: &str) -> Result<Option<TenantInfo>, DatabaseError>;

    async fn lookup_detail(&self, detail_id: &str) -> Result<Option<DetailInfo>, DatabaseError>;

    async fn lookup_account(&self, account_id: &str)
    -> Result<Option<AccountInfo>, DatabaseError>;
}

#[async_trait]
impl TenantDirectory for LibSqlBackend {
    async fn lookup_tenant(&self, tenant_id: &str) -> Result<Option<TenantInfo>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name FROM tenants WHERE id = ?1",
                params![tenant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("lookup_tenant: {e}")))?;

        let (id, name): (String, String) = match rows.next().await {
            Ok(Some(row)) => (
                row.get(0)
                    .map_err(|e| DatabaseError::Query(format!("lookup_tenant: {e}")))?,
                row.get(1)
                    .map_err(|e| DatabaseError::Query(format!("lookup_tenant: {e}")))?,
            ),
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("lookup_tenant: {e}"))),
        };

        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM tenant_details WHERE tenant_id = ?1 ORDER BY id ASC",
                params![tenant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("lookup_tenant: {e}")))?;

        let mut detail_ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(detail_id) = row.get::<String>(0) {
                detail_ids.push(detail_id);
            }
        }

        Ok(Some(TenantInfo {
            id,
            name,
            detail_ids,
        }))
    }

    async fn lookup_detail(&self, detail_id: &str) -> Result<Option<DetailInfo>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, tenant_id, store_name, tax_id FROM tenant_details WHERE id = ?1",
                params![detail_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("lookup_detail: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let detail = row_to_detail(&row)
                    .map_err(|e| DatabaseError::Query(format!("lookup_detail: {e}")))?;
                Ok(Some(detail))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("lookup_detail: {e}"))),
        }
    }

    async fn lookup_account(
        &self,
        account_id: &str,
    ) -> Result<Option<AccountInfo>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, detail_id, bank_name, account_number FROM accounts WHERE id = ?1",
                params![account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("lookup_account: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let account = row_to_account(&row)
                    .map_err(|e| DatabaseError::Query(format!("lookup_account: {e}")))?;
                Ok(Some(account))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("lookup_account: {e}"))),
        }
    }
}

fn row_to_detail(row: &libsql::Row) -> Result<DetailInfo, libsql::Error> {
    Ok(DetailInfo {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        store_name: row.get(2)?,
        tax_id: row.get(3)?,
    })
}

fn row_to_account(row: &libsql::Row) -> Result<AccountInfo, libsql::Error> {
    Ok(AccountInfo {
        id: row.get(0)?,
        detail_id: row.get(1)?,
        bank_name: row.get(2)?,
        account_number: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> LibSqlBackend {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.register_tenant("t1", "Acme").await.unwrap();
        db.register_detail("d1", "t1", "acme_main", Some("20123456789"))
            .await
            .unwrap();
        db.register_detail("d2", "t1", "acme_branch", None).await.unwrap();
        db.register_account("acc-1", "d1", Some("BCP"), Some("191-1234"))
            .await
            .unwrap();
        db.register_account("acc-2", "d1", None, None).await.unwrap();
        db
    }

    #[tokio::test]
    async fn tenant_lists_details() {
        let db = seeded().await;
        let tenant = db.lookup_tenant("t1").await.unwrap().unwrap();
        assert_eq!(tenant.name, "Acme");
        assert_eq!(tenant.detail_ids, vec!["d1".to_string(), "d2".to_string()]);
        assert!(db.lookup_tenant("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn detail_and_account_lookup() {
        let db = seeded().await;
        let detail = db.lookup_detail("d1").await.unwrap().unwrap();
        assert_eq!(detail.tenant_id, "t1");
        assert_eq!(detail.store_name, "acme_main");
        assert_eq!(detail.tax_id.as_deref(), Some("20123456789"));

        let account = db.lookup_account("acc-2").await.unwrap().unwrap();
        assert_eq!(account.bank_name, None);
        assert!(db.lookup_account("acc-9").await.unwrap().is_none());
    }
}
