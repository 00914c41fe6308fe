// db/requestdb.rs
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::{Error, PgConnection};
use uuid::Uuid;

use super::{db::DBClient, escrowdb::insert_escrow, store::*};
use crate::models::paymentmodel::*;

const ATTEMPT_COLUMNS: &str = r#"
    reference, request_id, target, target_id, provider, method, amount, status,
    failure_reason, created_at, settled_at, applied_at
"#;

async fn lock_request(conn: &mut PgConnection, request_id: Uuid) -> Result<ServiceRequest, Error> {
    sqlx::query_as::<_, ServiceRequest>(
        r#"
        SELECT id, customer_id, artisan_id, status, created_at
        FROM service_requests
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(request_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(Error::RowNotFound)
}

async fn set_request_status(
    conn: &mut PgConnection,
    request_id: Uuid,
    status: RequestStatus,
) -> Result<ServiceRequest, Error> {
    sqlx::query_as::<_, ServiceRequest>(
        r#"
        UPDATE service_requests
        SET status = $2
        WHERE id = $1
        RETURNING id, customer_id, artisan_id, status, created_at
        "#,
    )
    .bind(request_id)
    .bind(status)
    .fetch_one(&mut *conn)
    .await
}

#[async_trait]
impl RequestStore for DBClient {
    async fn save_request(&self, request: ServiceRequest) -> Result<ServiceRequest, Error> {
        sqlx::query_as::<_, ServiceRequest>(
            r#"
            INSERT INTO service_requests (id, customer_id, artisan_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, customer_id, artisan_id, status, created_at
            "#,
        )
        .bind(request.id)
        .bind(request.customer_id)
        .bind(request.artisan_id)
        .bind(request.status)
        .bind(request.created_at)
        .fetch_one(&self.pool)
        .await
    }

    async fn get_request(&self, request_id: Uuid) -> Result<Option<ServiceRequest>, Error> {
        sqlx::query_as::<_, ServiceRequest>(
            "SELECT id, customer_id, artisan_id, status, created_at FROM service_requests WHERE id = $1",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn save_quote(&self, quote: Quote) -> Result<Quote, Error> {
        sqlx::query_as::<_, Quote>(
            r#"
            INSERT INTO quotes (id, request_id, artisan_id, amount, accepted_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, request_id, artisan_id, amount, accepted_at
            "#,
        )
        .bind(quote.id)
        .bind(quote.request_id)
        .bind(quote.artisan_id)
        .bind(quote.amount)
        .bind(quote.accepted_at)
        .fetch_one(&self.pool)
        .await
    }

    async fn get_quote(&self, quote_id: Uuid) -> Result<Option<Quote>, Error> {
        sqlx::query_as::<_, Quote>(
            "SELECT id, request_id, artisan_id, amount, accepted_at FROM quotes WHERE id = $1",
        )
        .bind(quote_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn update_request_status(
        &self,
        request_id: Uuid,
        from: &[RequestStatus],
        to: RequestStatus,
    ) -> Result<TransitionOutcome<ServiceRequest>, Error> {
        let mut tx = self.pool.begin().await?;

        let request = lock_request(&mut tx, request_id).await?;
        if !from.contains(&request.status) {
            tx.rollback().await?;
            return Ok(TransitionOutcome::Rejected(request));
        }

        let updated = set_request_status(&mut tx, request_id, to).await?;
        tx.commit().await?;
        Ok(TransitionOutcome::Applied(updated))
    }

    async fn accept_quote(
        &self,
        acceptance: QuoteAcceptance,
    ) -> Result<TransitionOutcome<ServiceRequest>, Error> {
        let mut tx = self.pool.begin().await?;

        let request = lock_request(&mut tx, acceptance.request_id).await?;
        if request.status != RequestStatus::Open {
            tx.rollback().await?;
            return Ok(TransitionOutcome::Rejected(request));
        }

        sqlx::query("UPDATE quotes SET accepted_at = $2 WHERE id = $1")
            .bind(acceptance.quote_id)
            .bind(acceptance.accepted_at)
            .execute(&mut *tx)
            .await?;

        let fee = &acceptance.service_fee;
        sqlx::query(
            r#"
            INSERT INTO service_fee_payments
                (id, request_id, amount, status, transaction_ref, paid_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(fee.id)
        .bind(fee.request_id)
        .bind(fee.amount)
        .bind(fee.status)
        .bind(&fee.transaction_ref)
        .bind(fee.paid_at)
        .bind(fee.created_at)
        .execute(&mut *tx)
        .await?;

        insert_escrow(&mut tx, &acceptance.escrow).await?;

        let updated =
            set_request_status(&mut tx, acceptance.request_id, RequestStatus::QuoteAccepted)
                .await?;
        tx.commit().await?;
        Ok(TransitionOutcome::Applied(updated))
    }

    async fn get_service_fee(&self, fee_id: Uuid) -> Result<Option<ServiceFeePayment>, Error> {
        sqlx::query_as::<_, ServiceFeePayment>(
            r#"
            SELECT id, request_id, amount, status, transaction_ref, paid_at, created_at
            FROM service_fee_payments
            WHERE id = $1
            "#,
        )
        .bind(fee_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn get_service_fee_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<ServiceFeePayment>, Error> {
        sqlx::query_as::<_, ServiceFeePayment>(
            r#"
            SELECT id, request_id, amount, status, transaction_ref, paid_at, created_at
            FROM service_fee_payments
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn transition_service_fee(
        &self,
        fee_id: Uuid,
        transition: FeeTransition,
    ) -> Result<TransitionOutcome<ServiceFeePayment>, Error> {
        let mut tx = self.pool.begin().await?;

        let mut fee = sqlx::query_as::<_, ServiceFeePayment>(
            r#"
            SELECT id, request_id, amount, status, transaction_ref, paid_at, created_at
            FROM service_fee_payments
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(fee_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(Error::RowNotFound)?;

        if !transition.allowed_from(fee.status) {
            tx.rollback().await?;
            return Ok(TransitionOutcome::Rejected(fee));
        }

        transition.apply(&mut fee, Utc::now());
        sqlx::query(
            r#"
            UPDATE service_fee_payments
            SET status = $2, transaction_ref = $3, paid_at = $4
            WHERE id = $1
            "#,
        )
        .bind(fee.id)
        .bind(fee.status)
        .bind(&fee.transaction_ref)
        .bind(fee.paid_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(TransitionOutcome::Applied(fee))
    }

    async fn insert_attempt(&self, attempt: PaymentAttempt) -> Result<PaymentAttempt, Error> {
        let sql = format!(
            r#"
            INSERT INTO payment_attempts ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {cols}
            "#,
            cols = ATTEMPT_COLUMNS
        );
        sqlx::query_as::<_, PaymentAttempt>(&sql)
            .bind(&attempt.reference)
            .bind(attempt.request_id)
            .bind(attempt.target)
            .bind(attempt.target_id)
            .bind(&attempt.provider)
            .bind(attempt.method)
            .bind(attempt.amount)
            .bind(attempt.status)
            .bind(&attempt.failure_reason)
            .bind(attempt.created_at)
            .bind(attempt.settled_at)
            .bind(attempt.applied_at)
            .fetch_one(&self.pool)
            .await
    }

    async fn get_attempt(&self, reference: &str) -> Result<Option<PaymentAttempt>, Error> {
        let sql = format!(
            "SELECT {} FROM payment_attempts WHERE reference = $1",
            ATTEMPT_COLUMNS
        );
        sqlx::query_as::<_, PaymentAttempt>(&sql)
            .bind(reference)
            .fetch_optional(&self.pool)
            .await
    }

    async fn list_attempts_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<PaymentAttempt>, Error> {
        let sql = format!(
            "SELECT {} FROM payment_attempts WHERE request_id = $1 ORDER BY created_at ASC",
            ATTEMPT_COLUMNS
        );
        sqlx::query_as::<_, PaymentAttempt>(&sql)
            .bind(request_id)
            .fetch_all(&self.pool)
            .await
    }

    async fn settle_attempt(
        &self,
        reference: &str,
        status: AttemptStatus,
        failure_reason: Option<String>,
    ) -> Result<TransitionOutcome<PaymentAttempt>, Error> {
        let sql = format!(
            r#"
            UPDATE payment_attempts
            SET status = $2, failure_reason = $3, settled_at = NOW()
            WHERE reference = $1 AND status = 'initiated'
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        );
        let settled = sqlx::query_as::<_, PaymentAttempt>(&sql)
            .bind(reference)
            .bind(status)
            .bind(failure_reason)
            .fetch_optional(&self.pool)
            .await?;

        match settled {
            Some(attempt) => Ok(TransitionOutcome::Applied(attempt)),
            None => self
                .get_attempt(reference)
                .await?
                .map(TransitionOutcome::Rejected)
                .ok_or(Error::RowNotFound),
        }
    }

    async fn mark_attempt_applied(&self, reference: &str) -> Result<PaymentAttempt, Error> {
        let sql = format!(
            r#"
            UPDATE payment_attempts
            SET applied_at = COALESCE(applied_at, NOW())
            WHERE reference = $1 AND status <> 'initiated'
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        );
        sqlx::query_as::<_, PaymentAttempt>(&sql)
            .bind(reference)
            .fetch_one(&self.pool)
            .await
    }

    async fn list_stale_attempts(&self, older_than: Duration) -> Result<Vec<PaymentAttempt>, Error> {
        let sql = format!(
            r#"
            SELECT {}
            FROM payment_attempts
            WHERE applied_at IS NULL AND created_at <= $1
            ORDER BY created_at ASC
            LIMIT 200
            "#,
            ATTEMPT_COLUMNS
        );
        sqlx::query_as::<_, PaymentAttempt>(&sql)
            .bind(Utc::now() - older_than)
            .fetch_all(&self.pool)
            .await
    }

    async fn save_artisan_contact(&self, contact: ArtisanContact) -> Result<ArtisanContact, Error> {
        sqlx::query_as::<_, ArtisanContact>(
            r#"
            INSERT INTO artisan_contacts (artisan_id, full_name, phone, email, address)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (artisan_id) DO UPDATE
            SET full_name = EXCLUDED.full_name,
                phone = EXCLUDED.phone,
                email = EXCLUDED.email,
                address = EXCLUDED.address
            RETURNING artisan_id, full_name, phone, email, address
            "#,
        )
        .bind(contact.artisan_id)
        .bind(&contact.full_name)
        .bind(&contact.phone)
        .bind(&contact.email)
        .bind(&contact.address)
        .fetch_one(&self.pool)
        .await
    }

    async fn get_artisan_contact(&self, artisan_id: Uuid) -> Result<Option<ArtisanContact>, Error> {
        sqlx::query_as::<_, ArtisanContact>(
            r#"
            SELECT artisan_id, full_name, phone, email, address
            FROM artisan_contacts
            WHERE artisan_id = $1
            "#,
        )
        .bind(artisan_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn record_contact_reveal(&self, reveal: ContactReveal) -> Result<ContactReveal, Error> {
        sqlx::query(
            r#"
            INSERT INTO contact_reveals (request_id, artisan_id, revealed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(reveal.request_id)
        .bind(reveal.artisan_id)
        .bind(reveal.revealed_at)
        .execute(&self.pool)
        .await?;

        self.get_contact_reveal(reveal.request_id)
            .await?
            .ok_or(Error::RowNotFound)
    }

    async fn get_contact_reveal(&self, request_id: Uuid) -> Result<Option<ContactReveal>, Error> {
        sqlx::query_as::<_, ContactReveal>(
            "SELECT request_id, artisan_id, revealed_at FROM contact_reveals WHERE request_id = $1",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
    }
}
