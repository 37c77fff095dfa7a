//! Customer linking
//!
//! Maps a local user id to one ledger customer and, per provider variant, to one
//! provider-side customer. Provider customers are created lazily the first time a
//! user transacts through that provider.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{CustomerRequest, ProviderRegistry};
use crate::store::{LedgerStore, StoreError};
use crate::types::{Customer, Metadata, Provider, ProviderCustomerIds};

pub struct CustomerLinker {
    store: Arc<dyn LedgerStore>,
    providers: ProviderRegistry,
}

impl CustomerLinker {
    pub fn new(store: Arc<dyn LedgerStore>, providers: ProviderRegistry) -> Self {
        Self { store, providers }
    }

    /// Return the user's customer, linked to `provider`, creating whatever is missing
    ///
    /// Two first-time calls racing for the same user may both create a provider
    /// customer. Only one local row survives the insert; the loser attaches its
    /// provider id to the winner's row if that slot is still empty, otherwise the
    /// loser's provider customer is left orphaned on the provider side.
    pub async fn resolve(
        &self,
        user_id: &str,
        email: &str,
        name: &str,
        provider: Provider,
    ) -> BillingResult<Customer> {
        if let Some(existing) = self.store.find_customer_by_user(user_id).await? {
            return self.ensure_linked(existing, email, name, provider).await;
        }

        let provider_customer_id = self.create_provider_customer(user_id, email, name, provider).await?;

        let now = OffsetDateTime::now_utc();
        let mut provider_ids = ProviderCustomerIds::default();
        provider_ids.set(provider, provider_customer_id.clone());
        let customer = Customer {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            email: email.to_string(),
            name: name.to_string(),
            provider_ids,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        match self.store.insert_customer(&customer).await {
            Ok(created) => {
                tracing::info!(
                    user_id = %user_id,
                    customer_id = %created.id,
                    provider = %provider,
                    provider_customer_id = %provider_customer_id,
                    "Created customer"
                );
                Ok(created)
            }
            Err(StoreError::Conflict(_)) => {
                tracing::warn!(
                    user_id = %user_id,
                    provider = %provider,
                    provider_customer_id = %provider_customer_id,
                    "Concurrent customer creation, adopting existing row"
                );
                let winner = self.store.find_customer_by_user(user_id).await?.ok_or_else(|| {
                    BillingError::PersistenceFailed(format!(
                        "customer for user {} conflicted but could not be re-read",
                        user_id
                    ))
                })?;
                Ok(self
                    .store
                    .attach_provider_customer(winner.id, provider, &provider_customer_id)
                    .await?)
            }
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    provider_customer_id = %provider_customer_id,
                    error = %e,
                    "Provider customer created but ledger insert failed"
                );
                Err(e.into())
            }
        }
    }

    pub async fn find(&self, user_id: &str) -> BillingResult<Option<Customer>> {
        Ok(self.store.find_customer_by_user(user_id).await?)
    }

    /// Mark the user's customer deleted; the user id becomes free for a new customer
    pub async fn soft_delete(&self, user_id: &str) -> BillingResult<OffsetDateTime> {
        let customer = self
            .store
            .find_customer_by_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("customer for user {}", user_id)))?;

        let deleted_at = self.store.soft_delete_customer(customer.id).await?;
        tracing::info!(user_id = %user_id, customer_id = %customer.id, "Customer soft-deleted");
        Ok(deleted_at)
    }

    async fn ensure_linked(
        &self,
        customer: Customer,
        email: &str,
        name: &str,
        provider: Provider,
    ) -> BillingResult<Customer> {
        if customer.provider_ids.get(provider).is_some() {
            return Ok(customer);
        }

        let provider_customer_id = self
            .create_provider_customer(&customer.user_id, email, name, provider)
            .await?;
        let linked = self
            .store
            .attach_provider_customer(customer.id, provider, &provider_customer_id)
            .await?;

        if linked.provider_ids.get(provider) != Some(provider_customer_id.as_str()) {
            tracing::warn!(
                customer_id = %customer.id,
                provider = %provider,
                orphaned = %provider_customer_id,
                "Provider slot filled concurrently, keeping existing id"
            );
        } else {
            tracing::info!(
                customer_id = %customer.id,
                provider = %provider,
                provider_customer_id = %provider_customer_id,
                "Linked provider customer"
            );
        }
        Ok(linked)
    }

    async fn create_provider_customer(
        &self,
        user_id: &str,
        email: &str,
        name: &str,
        provider: Provider,
    ) -> BillingResult<String> {
        let gateway = self.providers.gateway(provider)?;
        let snapshot = gateway
            .create_customer(&CustomerRequest {
                user_id: user_id.to_string(),
                email: email.to_string(),
                name: name.to_string(),
            })
            .await
            .map_err(|e| {
                tracing::error!(user_id = %user_id, provider = %provider, error = %e, "Provider customer creation failed");
                BillingError::Provider(e)
            })?;
        Ok(snapshot.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_registry, memory_ledger};

    #[tokio::test]
    async fn test_resolve_creates_customer_with_provider_id() {
        let (gateway, registry) = fake_registry();
        let linker = CustomerLinker::new(memory_ledger(), registry);

        let customer = linker
            .resolve("user-1", "a@example.com", "Alice", Provider::Stripe)
            .await
            .unwrap();
        assert_eq!(customer.user_id, "user-1");
        assert!(customer.provider_ids.get(Provider::Stripe).is_some());
        assert_eq!(gateway.call_count("create_customer"), 1);

        let again = linker
            .resolve("user-1", "a@example.com", "Alice", Provider::Stripe)
            .await
            .unwrap();
        assert_eq!(again.id, customer.id);
        assert_eq!(gateway.call_count("create_customer"), 1);
    }

    #[tokio::test]
    async fn test_resolve_for_unconfigured_provider_fails() {
        let (_, registry) = fake_registry();
        let linker = CustomerLinker::new(memory_ledger(), registry);

        let err = linker
            .resolve("user-1", "a@example.com", "Alice", Provider::Swish)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ProviderUnavailable(Provider::Swish)));
        assert!(linker.find("user-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_first_resolve_keeps_one_customer() {
        let (_, registry) = fake_registry();
        let linker = Arc::new(CustomerLinker::new(memory_ledger(), registry));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let linker = Arc::clone(&linker);
            handles.push(tokio::spawn(async move {
                linker
                    .resolve("user-race", "r@example.com", "Race", Provider::Stripe)
                    .await
                    .unwrap()
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        let stored = linker.find("user-race").await.unwrap().unwrap();
        assert!(stored.provider_ids.get(Provider::Stripe).is_some());
    }

    #[tokio::test]
    async fn test_soft_delete_frees_user_id() {
        let (_, registry) = fake_registry();
        let linker = CustomerLinker::new(memory_ledger(), registry);

        let first = linker
            .resolve("user-1", "a@example.com", "Alice", Provider::Stripe)
            .await
            .unwrap();
        linker.soft_delete("user-1").await.unwrap();
        assert!(linker.find("user-1").await.unwrap().is_none());

        let second = linker
            .resolve("user-1", "a@example.com", "Alice", Provider::Stripe)
            .await
            .unwrap();
        assert_ne!(first.id, second.id);

        assert!(matches!(
            linker.soft_delete("nobody").await,
            Err(BillingError::NotFound(_))
        ));
    }
}
