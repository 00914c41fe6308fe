// db/escrowdb.rs
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{types::Json, Error, PgConnection};
use uuid::Uuid;

use super::{db::DBClient, store::*};
use crate::models::escrowmodel::*;

const ESCROW_COLUMNS: &str = r#"
    id, request_id, total_amount, platform_fee, artisan_amount, service_fee_id,
    status, transaction_ref, status_reason, approver_id, milestone_templates,
    escrowed_at, released_at, created_at, updated_at
"#;

const MILESTONE_COLUMNS: &str = r#"
    id, escrow_id, title, amount, percentage, sequence, status, dependencies,
    evidence_required, approval_required, transaction_ref, commission,
    dispute_reason, deposited_at, released_at, created_at
"#;

async fn lock_escrow(conn: &mut PgConnection, escrow_id: Uuid) -> Result<EscrowPayment, Error> {
    let sql = format!(
        "SELECT {} FROM escrow_payments WHERE id = $1 FOR UPDATE",
        ESCROW_COLUMNS
    );
    sqlx::query_as::<_, EscrowPayment>(&sql)
        .bind(escrow_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(Error::RowNotFound)
}

async fn load_entries(conn: &mut PgConnection, escrow_id: Uuid) -> Result<Vec<LedgerEntry>, Error> {
    sqlx::query_as::<_, LedgerEntry>(
        r#"
        SELECT id, escrow_id, milestone_id, kind, amount, reference, created_at
        FROM ledger_entries
        WHERE escrow_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(escrow_id)
    .fetch_all(&mut *conn)
    .await
}

async fn load_plan(
    conn: &mut PgConnection,
    escrow_id: Uuid,
    for_update: bool,
) -> Result<Vec<EscrowMilestone>, Error> {
    let sql = format!(
        "SELECT {} FROM escrow_milestones WHERE escrow_id = $1 ORDER BY sequence ASC{}",
        MILESTONE_COLUMNS,
        if for_update { " FOR UPDATE" } else { "" }
    );
    sqlx::query_as::<_, EscrowMilestone>(&sql)
        .bind(escrow_id)
        .fetch_all(&mut *conn)
        .await
}

async fn write_escrow(conn: &mut PgConnection, escrow: &EscrowPayment) -> Result<(), Error> {
    sqlx::query(
        r#"
        UPDATE escrow_payments
        SET status = $2,
            transaction_ref = $3,
            status_reason = $4,
            approver_id = $5,
            escrowed_at = $6,
            released_at = $7,
            updated_at = $8
        WHERE id = $1
        "#,
    )
    .bind(escrow.id)
    .bind(escrow.status)
    .bind(&escrow.transaction_ref)
    .bind(&escrow.status_reason)
    .bind(escrow.approver_id)
    .bind(escrow.escrowed_at)
    .bind(escrow.released_at)
    .bind(escrow.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_milestone(conn: &mut PgConnection, milestone: &EscrowMilestone) -> Result<(), Error> {
    sqlx::query(
        r#"
        UPDATE escrow_milestones
        SET status = $2,
            transaction_ref = $3,
            commission = $4,
            dispute_reason = $5,
            deposited_at = $6,
            released_at = $7
        WHERE id = $1
        "#,
    )
    .bind(milestone.id)
    .bind(milestone.status)
    .bind(&milestone.transaction_ref)
    .bind(milestone.commission)
    .bind(&milestone.dispute_reason)
    .bind(milestone.deposited_at)
    .bind(milestone.released_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_entries(conn: &mut PgConnection, entries: &[LedgerEntry]) -> Result<(), Error> {
    for entry in entries {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (id, escrow_id, milestone_id, kind, amount, reference, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(entry.escrow_id)
        .bind(entry.milestone_id)
        .bind(entry.kind)
        .bind(entry.amount)
        .bind(&entry.reference)
        .bind(entry.created_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub(crate) async fn insert_escrow(conn: &mut PgConnection, escrow: &EscrowPayment) -> Result<(), Error> {
    sqlx::query(
        r#"
        INSERT INTO escrow_payments
            (id, request_id, total_amount, platform_fee, artisan_amount, service_fee_id,
             status, transaction_ref, status_reason, approver_id, milestone_templates,
             escrowed_at, released_at, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(escrow.id)
    .bind(escrow.request_id)
    .bind(escrow.total_amount)
    .bind(escrow.platform_fee)
    .bind(escrow.artisan_amount)
    .bind(escrow.service_fee_id)
    .bind(escrow.status)
    .bind(&escrow.transaction_ref)
    .bind(&escrow.status_reason)
    .bind(escrow.approver_id)
    .bind(Json(&escrow.milestone_templates))
    .bind(escrow.escrowed_at)
    .bind(escrow.released_at)
    .bind(escrow.created_at)
    .bind(escrow.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl EscrowStore for DBClient {
    async fn get_escrow(&self, escrow_id: Uuid) -> Result<Option<EscrowPayment>, Error> {
        let sql = format!("SELECT {} FROM escrow_payments WHERE id = $1", ESCROW_COLUMNS);
        sqlx::query_as::<_, EscrowPayment>(&sql)
            .bind(escrow_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn get_escrow_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<EscrowPayment>, Error> {
        let sql = format!(
            "SELECT {} FROM escrow_payments WHERE request_id = $1",
            ESCROW_COLUMNS
        );
        sqlx::query_as::<_, EscrowPayment>(&sql)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn transition_escrow(
        &self,
        escrow_id: Uuid,
        transition: EscrowTransition,
    ) -> Result<TransitionOutcome<EscrowPayment>, Error> {
        let mut tx = self.pool.begin().await?;

        let mut escrow = lock_escrow(&mut tx, escrow_id).await?;
        let milestone_disputed: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM escrow_milestones WHERE escrow_id = $1 AND status = 'disputed')",
        )
        .bind(escrow_id)
        .fetch_one(&mut *tx)
        .await?;

        if !escrow.status.can_transition_to(transition.target())
            || (milestone_disputed && transition.blocked_by_milestone_dispute())
        {
            tx.rollback().await?;
            return Ok(TransitionOutcome::Rejected(escrow));
        }

        let existing = load_entries(&mut tx, escrow_id).await?;
        let now = Utc::now();
        let entries = transition.entries(&escrow, &existing, now);
        transition.apply(&mut escrow, now);

        write_escrow(&mut tx, &escrow).await?;
        insert_entries(&mut tx, &entries).await?;
        tx.commit().await?;

        tracing::debug!(
            "Escrow {} -> {} with {} ledger entries",
            escrow.id,
            escrow.status.to_str(),
            entries.len()
        );
        Ok(TransitionOutcome::Applied(escrow))
    }

    async fn ledger_entries(&self, escrow_id: Uuid) -> Result<Vec<LedgerEntry>, Error> {
        let mut conn = self.pool.acquire().await?;
        load_entries(&mut conn, escrow_id).await
    }

    async fn return_duplicate_payment(
        &self,
        escrow_id: Uuid,
        reference: &str,
        amount: i64,
    ) -> Result<Vec<LedgerEntry>, Error> {
        let mut tx = self.pool.begin().await?;

        let escrow = lock_escrow(&mut tx, escrow_id).await?;
        let existing = load_entries(&mut tx, escrow_id).await?;
        let entries = duplicate_payment_entries(&escrow, &existing, reference, amount, Utc::now());

        insert_entries(&mut tx, &entries).await?;
        tx.commit().await?;
        Ok(entries)
    }
}

#[async_trait]
impl MilestoneStore for DBClient {
    async fn insert_plan(
        &self,
        escrow_id: Uuid,
        plan: Vec<EscrowMilestone>,
    ) -> Result<TransitionOutcome<Vec<EscrowMilestone>>, Error> {
        let mut tx = self.pool.begin().await?;

        let escrow = lock_escrow(&mut tx, escrow_id).await?;
        let existing = load_plan(&mut tx, escrow_id, false).await?;
        if escrow.status != EscrowStatus::Escrowed || !existing.is_empty() {
            tx.rollback().await?;
            return Ok(TransitionOutcome::Rejected(existing));
        }

        for milestone in &plan {
            sqlx::query(
                r#"
                INSERT INTO escrow_milestones
                    (id, escrow_id, title, amount, percentage, sequence, status, dependencies,
                     evidence_required, approval_required, transaction_ref, commission,
                     dispute_reason, deposited_at, released_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(milestone.id)
            .bind(milestone.escrow_id)
            .bind(&milestone.title)
            .bind(milestone.amount)
            .bind(milestone.percentage)
            .bind(milestone.sequence)
            .bind(milestone.status)
            .bind(&milestone.dependencies)
            .bind(Json(&milestone.evidence_required))
            .bind(milestone.approval_required)
            .bind(&milestone.transaction_ref)
            .bind(milestone.commission)
            .bind(&milestone.dispute_reason)
            .bind(milestone.deposited_at)
            .bind(milestone.released_at)
            .bind(milestone.created_at)
            .execute(&mut *tx)
            .await?;
        }

        let stored = load_plan(&mut tx, escrow_id, false).await?;
        tx.commit().await?;
        Ok(TransitionOutcome::Applied(stored))
    }

    async fn get_milestone(&self, milestone_id: Uuid) -> Result<Option<EscrowMilestone>, Error> {
        let sql = format!("SELECT {} FROM escrow_milestones WHERE id = $1", MILESTONE_COLUMNS);
        sqlx::query_as::<_, EscrowMilestone>(&sql)
            .bind(milestone_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn list_milestones(&self, escrow_id: Uuid) -> Result<Vec<EscrowMilestone>, Error> {
        let mut conn = self.pool.acquire().await?;
        load_plan(&mut conn, escrow_id, false).await
    }

    async fn transition_milestone(
        &self,
        milestone_id: Uuid,
        transition: MilestoneTransition,
    ) -> Result<TransitionOutcome<MilestoneChange>, Error> {
        let escrow_id: Uuid =
            sqlx::query_scalar("SELECT escrow_id FROM escrow_milestones WHERE id = $1")
                .bind(milestone_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(Error::RowNotFound)?;

        let mut tx = self.pool.begin().await?;

        // Escrow row first, then its milestones: the same order every writer uses.
        let mut escrow = lock_escrow(&mut tx, escrow_id).await?;
        let mut plan = load_plan(&mut tx, escrow_id, true).await?;
        let existing = load_entries(&mut tx, escrow_id).await?;

        let index = plan
            .iter()
            .position(|m| m.id == milestone_id)
            .ok_or(Error::RowNotFound)?;

        let outcome = apply_milestone_transition(
            &mut escrow,
            &mut plan,
            index,
            &existing,
            &transition,
            Utc::now(),
        );

        let change = match outcome {
            TransitionOutcome::Rejected(change) => {
                tx.rollback().await?;
                return Ok(TransitionOutcome::Rejected(change));
            }
            TransitionOutcome::Applied(change) => change,
        };

        write_milestone(&mut tx, &change.milestone).await?;
        for activated in &change.activated {
            write_milestone(&mut tx, activated).await?;
        }
        write_escrow(&mut tx, &change.escrow).await?;
        insert_entries(&mut tx, &change.entries).await?;

        if matches!(transition, MilestoneTransition::Release { .. }) {
            sqlx::query("UPDATE milestone_evidence SET approved = TRUE WHERE milestone_id = $1")
                .bind(milestone_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(TransitionOutcome::Applied(change))
    }

    async fn reconcile_readiness(&self, escrow_id: Uuid) -> Result<Vec<EscrowMilestone>, Error> {
        let mut tx = self.pool.begin().await?;

        let escrow = lock_escrow(&mut tx, escrow_id).await?;
        if escrow.status != EscrowStatus::Escrowed {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let plan = load_plan(&mut tx, escrow_id, true).await?;
        let ready = milestones_to_activate(&plan);

        let mut activated = Vec::with_capacity(ready.len());
        for mut milestone in plan.into_iter().filter(|m| ready.contains(&m.id)) {
            milestone.status = MilestoneStatus::Ready;
            write_milestone(&mut tx, &milestone).await?;
            activated.push(milestone);
        }

        tx.commit().await?;
        Ok(activated)
    }

    async fn escrows_with_pending_milestones(&self) -> Result<Vec<Uuid>, Error> {
        sqlx::query_scalar(
            r#"
            SELECT DISTINCT m.escrow_id
            FROM escrow_milestones m
            JOIN escrow_payments e ON e.id = m.escrow_id
            WHERE m.status = 'pending' AND e.status = 'escrowed'
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    async fn add_evidence(&self, evidence: MilestoneEvidence) -> Result<MilestoneEvidence, Error> {
        sqlx::query_as::<_, MilestoneEvidence>(
            r#"
            INSERT INTO milestone_evidence
                (id, milestone_id, kind, url, note, submitted_by, submitted_at, approved)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, milestone_id, kind, url, note, submitted_by, submitted_at, approved
            "#,
        )
        .bind(evidence.id)
        .bind(evidence.milestone_id)
        .bind(evidence.kind)
        .bind(&evidence.url)
        .bind(&evidence.note)
        .bind(evidence.submitted_by)
        .bind(evidence.submitted_at)
        .bind(evidence.approved)
        .fetch_one(&self.pool)
        .await
    }

    async fn list_evidence(&self, milestone_id: Uuid) -> Result<Vec<MilestoneEvidence>, Error> {
        sqlx::query_as::<_, MilestoneEvidence>(
            r#"
            SELECT id, milestone_id, kind, url, note, submitted_by, submitted_at, approved
            FROM milestone_evidence
            WHERE milestone_id = $1
            ORDER BY submitted_at ASC
            "#,
        )
        .bind(milestone_id)
        .fetch_all(&self.pool)
        .await
    }
}

#[cfg(all(test, feature = "postgres-tests"))]
mod tests {
    use std::sync::Arc;

    use sqlx::PgPool;

    use super::*;
    use crate::{
        db::EngineStore,
        models::paymentmodel::*,
        service::{error::ServiceError, escrow_service::EscrowService},
    };

    async fn funded(db: &DBClient, amount: i64, platform_fee: i64) -> EscrowPayment {
        let now = Utc::now();
        let artisan_id = Uuid::new_v4();
        let request = db
            .save_request(ServiceRequest {
                id: Uuid::new_v4(),
                customer_id: Uuid::new_v4(),
                artisan_id,
                status: RequestStatus::Open,
                created_at: now,
            })
            .await
            .unwrap();
        let quote = db
            .save_quote(Quote {
                id: Uuid::new_v4(),
                request_id: request.id,
                artisan_id,
                amount,
                accepted_at: None,
            })
            .await
            .unwrap();
        let service_fee = ServiceFeePayment {
            id: Uuid::new_v4(),
            request_id: request.id,
            amount: 200_000,
            status: FeePaymentStatus::Pending,
            transaction_ref: None,
            paid_at: None,
            created_at: now,
        };
        let escrow = EscrowPayment {
            id: Uuid::new_v4(),
            request_id: request.id,
            total_amount: amount,
            platform_fee,
            artisan_amount: amount - platform_fee,
            service_fee_id: service_fee.id,
            status: EscrowStatus::Pending,
            transaction_ref: None,
            status_reason: None,
            approver_id: None,
            milestone_templates: Vec::new(),
            escrowed_at: None,
            released_at: None,
            created_at: now,
            updated_at: now,
        };
        db.accept_quote(QuoteAcceptance {
            request_id: request.id,
            quote_id: quote.id,
            service_fee,
            escrow: escrow.clone(),
            accepted_at: now,
        })
        .await
        .unwrap();

        let reference = generate_transaction_reference("ESC");
        db.insert_attempt(PaymentAttempt {
            reference: reference.clone(),
            request_id: request.id,
            target: PaymentTarget::Escrow,
            target_id: escrow.id,
            provider: "paystack".to_string(),
            method: PaymentMethod::Card,
            amount,
            status: AttemptStatus::Initiated,
            failure_reason: None,
            created_at: now,
            settled_at: None,
            applied_at: None,
        })
        .await
        .unwrap();
        db.settle_attempt(&reference, AttemptStatus::Succeeded, None)
            .await
            .unwrap();

        match db
            .transition_escrow(escrow.id, EscrowTransition::Deposit { reference })
            .await
            .unwrap()
        {
            TransitionOutcome::Applied(escrow) => escrow,
            TransitionOutcome::Rejected(current) => panic!("deposit rejected: {:?}", current.status),
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_concurrent_release_and_dispute_lock_the_row(pool: PgPool) {
        let db = DBClient::new(pool);
        let escrow = funded(&db, 15_000, 1_500).await;
        let store: Arc<dyn EngineStore> = Arc::new(db.clone());
        let service = EscrowService::new(store);

        let releaser = service.clone();
        let disputer = service.clone();
        let id = escrow.id;
        let (release, dispute) = tokio::join!(
            tokio::spawn(async move { releaser.release(id, Uuid::new_v4()).await }),
            tokio::spawn(async move { disputer.dispute(id, "quality").await }),
        );
        let release = release.unwrap();
        let dispute = dispute.unwrap();
        assert!(release.is_ok() != dispute.is_ok());

        let statement = service.statement(id).await.unwrap();
        match statement.escrow.status {
            EscrowStatus::Released => {
                assert!(matches!(dispute, Err(ServiceError::InvalidState { .. })));
                assert_eq!(statement.balance.held(), 0);
            }
            EscrowStatus::Disputed => {
                assert!(matches!(release, Err(ServiceError::DisputeActive(_))));
                assert_eq!(statement.entries.len(), 1);
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_double_release_writes_one_payout(pool: PgPool) {
        let db = DBClient::new(pool);
        let escrow = funded(&db, 15_000, 1_500).await;
        let approver = Uuid::new_v4();

        let (a, b) = tokio::join!(
            db.transition_escrow(
                escrow.id,
                EscrowTransition::Release {
                    approver_id: approver,
                    reference: "REL_A".to_string(),
                },
            ),
            db.transition_escrow(
                escrow.id,
                EscrowTransition::Release {
                    approver_id: approver,
                    reference: "REL_B".to_string(),
                },
            ),
        );
        assert!(a.unwrap().is_applied() != b.unwrap().is_applied());

        let balance = EscrowBalance::from_entries(&db.ledger_entries(escrow.id).await.unwrap());
        assert_eq!(balance.paid_to_artisan, 13_500);
        assert_eq!(balance.commission_collected, 1_500);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_duplicate_payment_returned_once(pool: PgPool) {
        let db = DBClient::new(pool);
        let escrow = funded(&db, 15_000, 1_500).await;

        let first = db.return_duplicate_payment(escrow.id, "ESC_DUP", 15_000).await.unwrap();
        let again = db.return_duplicate_payment(escrow.id, "ESC_DUP", 15_000).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(again.is_empty());

        let balance = EscrowBalance::from_entries(&db.ledger_entries(escrow.id).await.unwrap());
        assert_eq!(balance.held(), 15_000);
    }
}
