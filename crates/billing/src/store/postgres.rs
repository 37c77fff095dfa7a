//! PostgreSQL ledger store

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::store::{
    LedgerStore, NewWebhookEvent, PaymentStateUpdate, RefundLedgerAnomaly, RefundTransition,
    StatusWrite, StoreError, StoreResult, SubscriptionState, WebhookClaim, WebhookFilter,
};
use crate::types::{
    Customer, Metadata, Page, Payment, PaymentStatus, Provider, ProviderCustomerIds, Refund,
    RefundStatus,
    Subscription, UnknownVariant, WebhookEventRecord,
};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(err.to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

fn parse_column<T>(value: &str) -> StoreResult<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    value
        .parse()
        .map_err(|e: UnknownVariant| StoreError::Corrupt(e.to_string()))
}

const CUSTOMER_COLUMNS: &str = "id, user_id, email, name, stripe_customer_id, swish_customer_id, \
     metadata, created_at, updated_at, deleted_at";

const PAYMENT_COLUMNS: &str = "id, customer_id, subscription_id, provider, provider_payment_id, \
     amount, currency, status, description, statement_descriptor, client_secret, \
     payment_method_type, failure_code, failure_message, metadata, idempotency_key, \
     refunded_amount, created_at, updated_at, completed_at";

const SUBSCRIPTION_COLUMNS: &str = "id, customer_id, provider, provider_subscription_id, amount, \
     currency, interval, interval_count, status, current_period_start, current_period_end, \
     trial_start, trial_end, cancel_at_period_end, cancel_at, canceled_at, product_name, \
     product_description, metadata, idempotency_key, created_at, updated_at";

const REFUND_COLUMNS: &str = "id, payment_id, provider, provider_refund_id, amount, currency, \
     status, reason, notes, failure_reason, metadata, idempotency_key, created_at, updated_at";

const WEBHOOK_COLUMNS: &str = "id, provider, provider_event_id, event_type, resource_type, \
     resource_id, payload, processed, processing_error, error_replayable, processing_attempts, \
     received_at, processing_started_at, processed_at";

#[derive(Debug, sqlx::FromRow)]
struct CustomerRow {
    id: Uuid,
    user_id: String,
    email: String,
    name: String,
    stripe_customer_id: Option<String>,
    swish_customer_id: Option<String>,
    metadata: Json<Metadata>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    deleted_at: Option<OffsetDateTime>,
}

impl From<CustomerRow> for Customer {
    fn from(row: CustomerRow) -> Self {
        Customer {
            id: row.id,
            user_id: row.user_id,
            email: row.email,
            name: row.name,
            provider_ids: ProviderCustomerIds {
                stripe: row.stripe_customer_id,
                swish: row.swish_customer_id,
            },
            metadata: row.metadata.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    customer_id: Uuid,
    subscription_id: Option<Uuid>,
    provider: String,
    provider_payment_id: String,
    amount: i64,
    currency: String,
    status: String,
    description: Option<String>,
    statement_descriptor: Option<String>,
    client_secret: Option<String>,
    payment_method_type: Option<String>,
    failure_code: Option<String>,
    failure_message: Option<String>,
    metadata: Json<Metadata>,
    idempotency_key: Option<String>,
    refunded_amount: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = StoreError;

    fn try_from(row: PaymentRow) -> StoreResult<Self> {
        Ok(Payment {
            id: row.id,
            customer_id: row.customer_id,
            subscription_id: row.subscription_id,
            provider: parse_column(&row.provider)?,
            provider_payment_id: row.provider_payment_id,
            amount: row.amount,
            currency: parse_column(&row.currency)?,
            status: parse_column(&row.status)?,
            description: row.description,
            statement_descriptor: row.statement_descriptor,
            client_secret: row.client_secret,
            payment_method_type: row.payment_method_type,
            failure_code: row.failure_code,
            failure_message: row.failure_message,
            metadata: row.metadata.0,
            idempotency_key: row.idempotency_key,
            refunded_amount: row.refunded_amount,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    customer_id: Uuid,
    provider: String,
    provider_subscription_id: String,
    amount: i64,
    currency: String,
    interval: String,
    interval_count: i32,
    status: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    trial_start: Option<OffsetDateTime>,
    trial_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    cancel_at: Option<OffsetDateTime>,
    canceled_at: Option<OffsetDateTime>,
    product_name: String,
    product_description: Option<String>,
    metadata: Json<Metadata>,
    idempotency_key: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> StoreResult<Self> {
        Ok(Subscription {
            id: row.id,
            customer_id: row.customer_id,
            provider: parse_column(&row.provider)?,
            provider_subscription_id: row.provider_subscription_id,
            amount: row.amount,
            currency: parse_column(&row.currency)?,
            interval: parse_column(&row.interval)?,
            interval_count: row.interval_count,
            status: parse_column(&row.status)?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            trial_start: row.trial_start,
            trial_end: row.trial_end,
            cancel_at_period_end: row.cancel_at_period_end,
            cancel_at: row.cancel_at,
            canceled_at: row.canceled_at,
            product_name: row.product_name,
            product_description: row.product_description,
            metadata: row.metadata.0,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RefundRow {
    id: Uuid,
    payment_id: Uuid,
    provider: String,
    provider_refund_id: String,
    amount: i64,
    currency: String,
    status: String,
    reason: Option<String>,
    notes: Option<String>,
    failure_reason: Option<String>,
    metadata: Json<Metadata>,
    idempotency_key: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<RefundRow> for Refund {
    type Error = StoreError;

    fn try_from(row: RefundRow) -> StoreResult<Self> {
        Ok(Refund {
            id: row.id,
            payment_id: row.payment_id,
            provider: parse_column(&row.provider)?,
            provider_refund_id: row.provider_refund_id,
            amount: row.amount,
            currency: parse_column(&row.currency)?,
            status: parse_column(&row.status)?,
            reason: row.reason,
            notes: row.notes,
            failure_reason: row.failure_reason,
            metadata: row.metadata.0,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WebhookRow {
    id: Uuid,
    provider: String,
    provider_event_id: String,
    event_type: String,
    resource_type: String,
    resource_id: Option<String>,
    payload: Json<serde_json::Value>,
    processed: bool,
    processing_error: Option<String>,
    error_replayable: bool,
    processing_attempts: i32,
    received_at: OffsetDateTime,
    processing_started_at: Option<OffsetDateTime>,
    processed_at: Option<OffsetDateTime>,
}

impl TryFrom<WebhookRow> for WebhookEventRecord {
    type Error = StoreError;

    fn try_from(row: WebhookRow) -> StoreResult<Self> {
        Ok(WebhookEventRecord {
            id: row.id,
            provider: parse_column(&row.provider)?,
            provider_event_id: row.provider_event_id,
            event_type: row.event_type,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            payload: row.payload.0,
            processed: row.processed,
            processing_error: row.processing_error,
            error_replayable: row.error_replayable,
            processing_attempts: row.processing_attempts,
            received_at: row.received_at,
            processing_started_at: row.processing_started_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RefundAuditRow {
    payment_id: Uuid,
    amount: i64,
    refunded_amount: i64,
    succeeded_total: i64,
    reserved_total: i64,
}

fn convert_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Ledger store backed by PostgreSQL
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {}", e)))?;
        tracing::info!("Ledger migrations applied");
        Ok(())
    }

    async fn fetch_webhook(&self, id: Uuid) -> StoreResult<WebhookEventRecord> {
        let sql = format!("SELECT {} FROM webhook_events WHERE id = $1", WEBHOOK_COLUMNS);
        let row: WebhookRow = sqlx::query_as(&sql).bind(id).fetch_one(&self.pool).await?;
        row.try_into()
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn find_customer_by_user(&self, user_id: &str) -> StoreResult<Option<Customer>> {
        let sql = format!(
            "SELECT {} FROM customers WHERE user_id = $1 AND deleted_at IS NULL",
            CUSTOMER_COLUMNS
        );
        let row: Option<CustomerRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Customer::from))
    }

    async fn get_customer(&self, id: Uuid) -> StoreResult<Option<Customer>> {
        let sql = format!("SELECT {} FROM customers WHERE id = $1", CUSTOMER_COLUMNS);
        let row: Option<CustomerRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Customer::from))
    }

    async fn insert_customer(&self, customer: &Customer) -> StoreResult<Customer> {
        let sql = format!(
            r#"
            INSERT INTO customers
                (id, user_id, email, name, stripe_customer_id, swish_customer_id,
                 metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING {}
            "#,
            CUSTOMER_COLUMNS
        );
        let row: CustomerRow = sqlx::query_as(&sql)
            .bind(customer.id)
            .bind(&customer.user_id)
            .bind(&customer.email)
            .bind(&customer.name)
            .bind(&customer.provider_ids.stripe)
            .bind(&customer.provider_ids.swish)
            .bind(Json(&customer.metadata))
            .bind(customer.created_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    async fn attach_provider_customer(
        &self,
        customer_id: Uuid,
        provider: Provider,
        provider_customer_id: &str,
    ) -> StoreResult<Customer> {
        // Only an empty slot is written; a concurrent winner keeps its id
        let sql = match provider {
            Provider::Stripe => {
                "UPDATE customers SET stripe_customer_id = $2, updated_at = NOW() \
                 WHERE id = $1 AND stripe_customer_id IS NULL"
            }
            Provider::Swish => {
                "UPDATE customers SET swish_customer_id = $2, updated_at = NOW() \
                 WHERE id = $1 AND swish_customer_id IS NULL"
            }
        };
        sqlx::query(sql)
            .bind(customer_id)
            .bind(provider_customer_id)
            .execute(&self.pool)
            .await?;

        self.get_customer(customer_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("customer {}", customer_id)))
    }

    async fn soft_delete_customer(&self, id: Uuid) -> StoreResult<OffsetDateTime> {
        let deleted_at: Option<OffsetDateTime> = sqlx::query_scalar(
            r#"
            UPDATE customers
            SET deleted_at = COALESCE(deleted_at, NOW()), updated_at = NOW()
            WHERE id = $1
            RETURNING deleted_at
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        deleted_at.ok_or_else(|| StoreError::NotFound(format!("customer {}", id)))
    }

    async fn insert_payment(&self, payment: &Payment) -> StoreResult<Payment> {
        let sql = format!(
            r#"
            INSERT INTO payments
                (id, customer_id, subscription_id, provider, provider_payment_id, amount,
                 currency, status, description, statement_descriptor, client_secret,
                 payment_method_type, failure_code, failure_message, metadata,
                 idempotency_key, refunded_amount, created_at, updated_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $18, $19)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        );
        let row: PaymentRow = sqlx::query_as(&sql)
            .bind(payment.id)
            .bind(payment.customer_id)
            .bind(payment.subscription_id)
            .bind(payment.provider.as_str())
            .bind(&payment.provider_payment_id)
            .bind(payment.amount)
            .bind(payment.currency.as_str())
            .bind(payment.status.as_str())
            .bind(&payment.description)
            .bind(&payment.statement_descriptor)
            .bind(&payment.client_secret)
            .bind(&payment.payment_method_type)
            .bind(&payment.failure_code)
            .bind(&payment.failure_message)
            .bind(Json(&payment.metadata))
            .bind(&payment.idempotency_key)
            .bind(payment.refunded_amount)
            .bind(payment.created_at)
            .bind(payment.completed_at)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn get_payment(&self, id: Uuid) -> StoreResult<Option<Payment>> {
        let sql = format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS);
        let row: Option<PaymentRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Payment::try_from).transpose()
    }

    async fn find_payment_by_provider_id(
        &self,
        provider: Provider,
        provider_payment_id: &str,
    ) -> StoreResult<Option<Payment>> {
        let sql = format!(
            "SELECT {} FROM payments WHERE provider = $1 AND provider_payment_id = $2",
            PAYMENT_COLUMNS
        );
        let row: Option<PaymentRow> = sqlx::query_as(&sql)
            .bind(provider.as_str())
            .bind(provider_payment_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Payment::try_from).transpose()
    }

    async fn list_payments(
        &self,
        customer_id: Uuid,
        page: Page,
    ) -> StoreResult<(Vec<Payment>, i64)> {
        let sql = format!(
            r#"
            SELECT {} FROM payments
            WHERE customer_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
            PAYMENT_COLUMNS
        );
        let rows: Vec<PaymentRow> = sqlx::query_as(&sql)
            .bind(customer_id)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payments WHERE customer_id = $1")
            .bind(customer_id)
            .fetch_one(&self.pool)
            .await?;
        Ok((convert_all(rows)?, total))
    }

    async fn update_payment_state(
        &self,
        id: Uuid,
        update: &PaymentStateUpdate,
    ) -> StoreResult<StatusWrite<OffsetDateTime, PaymentStatus>> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM payments WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let current = current.ok_or_else(|| StoreError::NotFound(format!("payment {}", id)))?;
        let current: PaymentStatus = parse_column(&current)?;
        if current.is_terminal() && current != update.status {
            return Ok(StatusWrite::TerminalRefused { current });
        }

        let updated_at: OffsetDateTime = sqlx::query_scalar(
            r#"
            UPDATE payments
            SET status = $2,
                payment_method_type = COALESCE($3, payment_method_type),
                failure_code = $4,
                failure_message = $5,
                completed_at = CASE
                    WHEN $2 = 'succeeded' THEN COALESCE(completed_at, NOW())
                    ELSE completed_at
                END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING updated_at
            "#,
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(&update.payment_method_type)
        .bind(&update.failure_code)
        .bind(&update.failure_message)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(StatusWrite::Applied(updated_at))
    }

    async fn reserve_refund(&self, payment_id: Uuid, amount: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET refunded_amount = refunded_amount + $2, updated_at = NOW()
            WHERE id = $1 AND refunded_amount + $2 <= amount
            "#,
        )
        .bind(payment_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_refund(&self, payment_id: Uuid, amount: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE payments
            SET refunded_amount = GREATEST(refunded_amount - $2, 0), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> StoreResult<Subscription> {
        let sql = format!(
            r#"
            INSERT INTO subscriptions
                (id, customer_id, provider, provider_subscription_id, amount, currency,
                 interval, interval_count, status, current_period_start, current_period_end,
                 trial_start, trial_end, cancel_at_period_end, cancel_at, canceled_at,
                 product_name, product_description, metadata, idempotency_key,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, $21)
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let row: SubscriptionRow = sqlx::query_as(&sql)
            .bind(subscription.id)
            .bind(subscription.customer_id)
            .bind(subscription.provider.as_str())
            .bind(&subscription.provider_subscription_id)
            .bind(subscription.amount)
            .bind(subscription.currency.as_str())
            .bind(subscription.interval.as_str())
            .bind(subscription.interval_count)
            .bind(subscription.status.as_str())
            .bind(subscription.current_period_start)
            .bind(subscription.current_period_end)
            .bind(subscription.trial_start)
            .bind(subscription.trial_end)
            .bind(subscription.cancel_at_period_end)
            .bind(subscription.cancel_at)
            .bind(subscription.canceled_at)
            .bind(&subscription.product_name)
            .bind(&subscription.product_description)
            .bind(Json(&subscription.metadata))
            .bind(&subscription.idempotency_key)
            .bind(subscription.created_at)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn get_subscription(&self, id: Uuid) -> StoreResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn find_subscription_by_provider_id(
        &self,
        provider: Provider,
        provider_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE provider = $1 AND provider_subscription_id = $2",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(provider.as_str())
            .bind(provider_subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn list_subscriptions(
        &self,
        customer_id: Uuid,
        page: Page,
    ) -> StoreResult<(Vec<Subscription>, i64)> {
        let sql = format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE customer_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(customer_id)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await?;
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions WHERE customer_id = $1")
                .bind(customer_id)
                .fetch_one(&self.pool)
                .await?;
        Ok((convert_all(rows)?, total))
    }

    async fn update_subscription_state(
        &self,
        id: Uuid,
        state: &SubscriptionState,
    ) -> StoreResult<OffsetDateTime> {
        let updated_at: Option<OffsetDateTime> = sqlx::query_scalar(
            r#"
            UPDATE subscriptions
            SET status = $2,
                current_period_start = $3,
                current_period_end = $4,
                trial_start = $5,
                trial_end = $6,
                cancel_at_period_end = $7,
                cancel_at = $8,
                canceled_at = $9,
                metadata = COALESCE($10, metadata),
                updated_at = NOW()
            WHERE id = $1
            RETURNING updated_at
            "#,
        )
        .bind(id)
        .bind(state.status.as_str())
        .bind(state.current_period_start)
        .bind(state.current_period_end)
        .bind(state.trial_start)
        .bind(state.trial_end)
        .bind(state.cancel_at_period_end)
        .bind(state.cancel_at)
        .bind(state.canceled_at)
        .bind(state.metadata.as_ref().map(Json))
        .fetch_optional(&self.pool)
        .await?;

        updated_at.ok_or_else(|| StoreError::NotFound(format!("subscription {}", id)))
    }

    async fn insert_refund(&self, refund: &Refund) -> StoreResult<Refund> {
        let sql = format!(
            r#"
            INSERT INTO refunds
                (id, payment_id, provider, provider_refund_id, amount, currency, status,
                 reason, notes, failure_reason, metadata, idempotency_key,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
            RETURNING {}
            "#,
            REFUND_COLUMNS
        );
        let row: RefundRow = sqlx::query_as(&sql)
            .bind(refund.id)
            .bind(refund.payment_id)
            .bind(refund.provider.as_str())
            .bind(&refund.provider_refund_id)
            .bind(refund.amount)
            .bind(refund.currency.as_str())
            .bind(refund.status.as_str())
            .bind(&refund.reason)
            .bind(&refund.notes)
            .bind(&refund.failure_reason)
            .bind(Json(&refund.metadata))
            .bind(&refund.idempotency_key)
            .bind(refund.created_at)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn get_refund(&self, id: Uuid) -> StoreResult<Option<Refund>> {
        let sql = format!("SELECT {} FROM refunds WHERE id = $1", REFUND_COLUMNS);
        let row: Option<RefundRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Refund::try_from).transpose()
    }

    async fn find_refund_by_provider_id(
        &self,
        provider: Provider,
        provider_refund_id: &str,
    ) -> StoreResult<Option<Refund>> {
        let sql = format!(
            "SELECT {} FROM refunds WHERE provider = $1 AND provider_refund_id = $2",
            REFUND_COLUMNS
        );
        let row: Option<RefundRow> = sqlx::query_as(&sql)
            .bind(provider.as_str())
            .bind(provider_refund_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Refund::try_from).transpose()
    }

    async fn list_refunds_by_payment(
        &self,
        payment_id: Uuid,
        page: Page,
    ) -> StoreResult<(Vec<Refund>, i64)> {
        let sql = format!(
            r#"
            SELECT {} FROM refunds
            WHERE payment_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
            REFUND_COLUMNS
        );
        let rows: Vec<RefundRow> = sqlx::query_as(&sql)
            .bind(payment_id)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM refunds WHERE payment_id = $1")
            .bind(payment_id)
            .fetch_one(&self.pool)
            .await?;
        Ok((convert_all(rows)?, total))
    }

    async fn list_refunds_by_customer(
        &self,
        customer_id: Uuid,
        page: Page,
    ) -> StoreResult<(Vec<Refund>, i64)> {
        let columns = REFUND_COLUMNS
            .split(", ")
            .map(|c| format!("r.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            SELECT {} FROM refunds r
            JOIN payments p ON p.id = r.payment_id
            WHERE p.customer_id = $1
            ORDER BY r.created_at DESC, r.id DESC
            LIMIT $2 OFFSET $3
            "#,
            columns
        );
        let rows: Vec<RefundRow> = sqlx::query_as(&sql)
            .bind(customer_id)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await?;
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM refunds r
            JOIN payments p ON p.id = r.payment_id
            WHERE p.customer_id = $1
            "#,
        )
        .bind(customer_id)
        .fetch_one(&self.pool)
        .await?;
        Ok((convert_all(rows)?, total))
    }

    async fn update_refund_status(
        &self,
        id: Uuid,
        status: RefundStatus,
        failure_reason: Option<&str>,
    ) -> StoreResult<StatusWrite<RefundTransition, RefundStatus>> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String, i64, Uuid)> = sqlx::query_as(
            "SELECT status, amount, payment_id FROM refunds WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let (previous, amount, payment_id) =
            current.ok_or_else(|| StoreError::NotFound(format!("refund {}", id)))?;
        let previous: RefundStatus = parse_column(&previous)?;
        // Dropping the transaction rolls back and releases the row lock
        if previous.is_terminal() && previous != status {
            return Ok(StatusWrite::TerminalRefused { current: previous });
        }

        let updated_at: OffsetDateTime = sqlx::query_scalar(
            r#"
            UPDATE refunds
            SET status = $2, failure_reason = COALESCE($3, failure_reason), updated_at = NOW()
            WHERE id = $1
            RETURNING updated_at
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(failure_reason)
        .fetch_one(&mut *tx)
        .await?;

        let released_reservation = previous.holds_reservation() && !status.holds_reservation();
        if released_reservation {
            sqlx::query(
                r#"
                UPDATE payments
                SET refunded_amount = GREATEST(refunded_amount - $2, 0), updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(payment_id)
            .bind(amount)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(StatusWrite::Applied(RefundTransition {
            previous,
            current: status,
            released_reservation,
            updated_at,
        }))
    }

    async fn claim_webhook_event(
        &self,
        event: &NewWebhookEvent,
        claim_timeout: Duration,
    ) -> StoreResult<WebhookClaim> {
        // Atomic claim: the insert wins for a new event, the conditional update wins
        // for an unprocessed event whose previous claim timed out. Anything else
        // returns no row.
        let sql = format!(
            r#"
            INSERT INTO webhook_events
                (id, provider, provider_event_id, event_type, resource_type, resource_id,
                 payload, processed, processing_attempts, received_at, processing_started_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, 1, NOW(), NOW())
            ON CONFLICT (provider, provider_event_id) DO UPDATE SET
                processing_started_at = NOW(),
                processing_attempts = webhook_events.processing_attempts + 1
            WHERE webhook_events.processed = FALSE
              AND (webhook_events.processing_started_at IS NULL
                   OR webhook_events.processing_started_at < NOW() - make_interval(secs => $8))
            RETURNING {}
            "#,
            WEBHOOK_COLUMNS
        );
        let claimed: Option<WebhookRow> = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(event.provider.as_str())
            .bind(&event.provider_event_id)
            .bind(&event.event_type)
            .bind(event.resource_type.as_str())
            .bind(&event.resource_id)
            .bind(Json(&event.payload))
            .bind(claim_timeout.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = claimed {
            return Ok(WebhookClaim::Claimed(row.try_into()?));
        }

        let existing = self
            .get_webhook_event(event.provider, &event.provider_event_id)
            .await?
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "webhook event {} vanished during claim",
                    event.provider_event_id
                ))
            })?;

        if existing.processed {
            Ok(WebhookClaim::AlreadyProcessed(existing))
        } else {
            Ok(WebhookClaim::InFlight(existing))
        }
    }

    async fn reclaim_stale_webhook_event(
        &self,
        id: Uuid,
        claim_timeout: Duration,
    ) -> StoreResult<Option<WebhookEventRecord>> {
        let sql = format!(
            r#"
            UPDATE webhook_events
            SET processing_started_at = NOW(),
                processing_attempts = processing_attempts + 1
            WHERE id = $1
              AND processed = FALSE
              AND (processing_started_at IS NULL
                   OR processing_started_at < NOW() - make_interval(secs => $2))
            RETURNING {}
            "#,
            WEBHOOK_COLUMNS
        );
        let row: Option<WebhookRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(claim_timeout.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?;
        row.map(WebhookEventRecord::try_from).transpose()
    }

    async fn begin_webhook_replay(
        &self,
        provider: Provider,
        provider_event_id: &str,
    ) -> StoreResult<Option<WebhookEventRecord>> {
        let sql = format!(
            r#"
            UPDATE webhook_events
            SET processing_started_at = NOW(),
                processing_attempts = processing_attempts + 1
            WHERE provider = $1 AND provider_event_id = $2
            RETURNING {}
            "#,
            WEBHOOK_COLUMNS
        );
        let row: Option<WebhookRow> = sqlx::query_as(&sql)
            .bind(provider.as_str())
            .bind(provider_event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(WebhookEventRecord::try_from).transpose()
    }

    async fn mark_webhook_processed(
        &self,
        id: Uuid,
        error: Option<&str>,
        replayable: bool,
    ) -> StoreResult<OffsetDateTime> {
        let processed_at: Option<OffsetDateTime> = sqlx::query_scalar(
            r#"
            UPDATE webhook_events
            SET processed = TRUE,
                processing_error = $2,
                error_replayable = ($2 IS NOT NULL AND $3),
                processed_at = NOW()
            WHERE id = $1
            RETURNING processed_at
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(replayable)
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        match processed_at {
            Some(ts) => Ok(ts),
            None => {
                // Distinguish a missing row from a NULL timestamp (not possible after SET)
                let record = self.fetch_webhook(id).await?;
                record
                    .processed_at
                    .ok_or_else(|| StoreError::Corrupt(format!("webhook event {}", id)))
            }
        }
    }

    async fn get_webhook_event(
        &self,
        provider: Provider,
        provider_event_id: &str,
    ) -> StoreResult<Option<WebhookEventRecord>> {
        let sql = format!(
            "SELECT {} FROM webhook_events WHERE provider = $1 AND provider_event_id = $2",
            WEBHOOK_COLUMNS
        );
        let row: Option<WebhookRow> = sqlx::query_as(&sql)
            .bind(provider.as_str())
            .bind(provider_event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(WebhookEventRecord::try_from).transpose()
    }

    async fn list_webhook_events(
        &self,
        filter: WebhookFilter,
        page: Page,
    ) -> StoreResult<(Vec<WebhookEventRecord>, i64)> {
        let predicate = match filter {
            WebhookFilter::All => "TRUE",
            WebhookFilter::Failed => "processed = TRUE AND processing_error IS NOT NULL",
            WebhookFilter::Unprocessed => "processed = FALSE",
        };
        let sql = format!(
            r#"
            SELECT {} FROM webhook_events
            WHERE {}
            ORDER BY received_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#,
            WEBHOOK_COLUMNS, predicate
        );
        let rows: Vec<WebhookRow> = sqlx::query_as(&sql)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await?;
        let count_sql = format!("SELECT COUNT(*) FROM webhook_events WHERE {}", predicate);
        let total: i64 = sqlx::query_scalar(&count_sql).fetch_one(&self.pool).await?;
        Ok((convert_all(rows)?, total))
    }

    async fn list_stale_webhook_events(
        &self,
        claimed_before: OffsetDateTime,
        limit: i64,
    ) -> StoreResult<Vec<WebhookEventRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM webhook_events
            WHERE processed = FALSE
              AND (processing_started_at IS NULL OR processing_started_at < $1)
            ORDER BY received_at ASC
            LIMIT $2
            "#,
            WEBHOOK_COLUMNS
        );
        let rows: Vec<WebhookRow> = sqlx::query_as(&sql)
            .bind(claimed_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn list_replayable_webhook_events(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> StoreResult<Vec<WebhookEventRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM webhook_events
            WHERE processed = TRUE
              AND processing_error IS NOT NULL
              AND error_replayable = TRUE
              AND processing_attempts < $1
            ORDER BY processing_started_at ASC NULLS FIRST, received_at ASC
            LIMIT $2
            "#,
            WEBHOOK_COLUMNS
        );
        let rows: Vec<WebhookRow> = sqlx::query_as(&sql)
            .bind(max_attempts)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn delete_processed_webhook_events(
        &self,
        received_before: OffsetDateTime,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM webhook_events WHERE processed = TRUE AND received_at < $1",
        )
        .bind(received_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn refund_ledger_anomalies(&self) -> StoreResult<Vec<RefundLedgerAnomaly>> {
        let rows: Vec<RefundAuditRow> = sqlx::query_as(
            r#"
            SELECT payment_id, amount, refunded_amount, succeeded_total, reserved_total
            FROM (
                SELECT p.id AS payment_id,
                       p.amount,
                       p.refunded_amount,
                       COALESCE(SUM(r.amount) FILTER (WHERE r.status = 'succeeded'), 0)::BIGINT
                           AS succeeded_total,
                       COALESCE(SUM(r.amount) FILTER (WHERE r.status NOT IN ('failed', 'canceled')), 0)::BIGINT
                           AS reserved_total
                FROM payments p
                LEFT JOIN refunds r ON r.payment_id = p.id
                GROUP BY p.id, p.amount, p.refunded_amount
            ) totals
            WHERE succeeded_total > amount
               OR refunded_amount > amount
               OR refunded_amount <> reserved_total
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RefundLedgerAnomaly {
                payment_id: row.payment_id,
                amount: row.amount,
                refunded_amount: row.refunded_amount,
                succeeded_total: row.succeeded_total,
                reserved_total: row.reserved_total,
            })
            .filter(RefundLedgerAnomaly::is_anomalous)
            .collect())
    }
}
