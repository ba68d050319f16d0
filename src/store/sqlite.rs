use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use super::{InterventionChange, InterventionInsert, InterventionSnapshot, UserDirectory, WorkOrderStore};
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::workflow::types::{
    Activity, ActivityId, ActivityStatus, ActivityType, AuditEntry, Intervention, InterventionId,
    InterventionStatus, Priority, Role, TransitionType, TransitionWrite, User, UserId, WorkOrder,
    WorkOrderId, WorkOrderState,
};

const WORK_ORDER_COLUMNS: &str = "id, number, state, priority, appointment_date, expected_end_date, \
     completion_date, created_by, approved_by";
const INTERVENTION_COLUMNS: &str = "id, work_order_id, sequence, description, estimated_hours, \
     activity_type, status, note, suspension_note, started_at, ended_at";
const AUDIT_COLUMNS: &str = "id, work_order_id, from_state, to_state, transition_type, executed_by, \
     user_role, reason, ip_address, user_agent, created_at";

/// SQLite-backed work order store and user directory
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect, creating the database file if needed, and optionally migrate
    pub async fn new(database_url: &str, max_connections: u32, auto_migrate: bool) -> Result<Self, StoreError> {
        if !Sqlite::database_exists(database_url).await? {
            info!("Creating database at {}", database_url);
            Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;

        if auto_migrate {
            info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Database migrations completed");
        }

        Ok(Self { pool })
    }

    pub async fn from_config(config: &DatabaseConfig) -> Result<Self, StoreError> {
        Self::new(&config.url, config.max_connections, config.auto_migrate).await
    }

    /// Get database pool for queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close database connections gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }

    pub async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO users (id, full_name, email, role, active)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(user.id)
        .bind(&user.full_name)
        .bind(&user.email)
        .bind(user.role.as_str())
        .bind(user.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create a draft work order
    pub async fn create_work_order(
        &self,
        number: &str,
        priority: Priority,
        created_by: Option<UserId>,
    ) -> Result<WorkOrderId, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO work_orders (number, state, priority, created_by)
            VALUES (?1, 'draft', ?2, ?3)
            "#,
        )
        .bind(number)
        .bind(priority.as_str())
        .bind(created_by)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn add_activity(
        &self,
        work_order_id: WorkOrderId,
        description: &str,
        activity_type: ActivityType,
        status: ActivityStatus,
    ) -> Result<ActivityId, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO work_order_activities (work_order_id, description, activity_type, status)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(work_order_id)
        .bind(description)
        .bind(activity_type.as_str())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }
}

/// Compare-and-set update plus audit insert on an open transaction
async fn apply_write(conn: &mut SqliteConnection, write: TransitionWrite) -> Result<AuditEntry, StoreError> {
    let change = write.change;
    let result = sqlx::query(
        r#"
        UPDATE work_orders
        SET state = ?1,
            completion_date = ?2,
            approved_by = COALESCE(?3, approved_by),
            updated_at = ?4
        WHERE id = ?5 AND state = ?6
        "#,
    )
    .bind(change.new_state.as_str())
    .bind(change.completion_date.map(|d| d.to_rfc3339()))
    .bind(change.approved_by)
    .bind(Utc::now().to_rfc3339())
    .bind(change.work_order_id)
    .bind(change.expected.as_str())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(missing_or_conflict(conn, change.work_order_id).await);
    }

    let audit = write.audit;
    let result = sqlx::query(
        r#"
        INSERT INTO work_order_audits
            (work_order_id, from_state, to_state, transition_type, executed_by,
             user_role, reason, ip_address, user_agent, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(audit.work_order_id)
    .bind(audit.from_state.as_str())
    .bind(audit.to_state.as_str())
    .bind(audit.transition_type.as_str())
    .bind(audit.executed_by)
    .bind(&audit.user_role)
    .bind(&audit.reason)
    .bind(&audit.ip_address)
    .bind(&audit.user_agent)
    .bind(audit.created_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(audit.with_id(result.last_insert_rowid()))
}

async fn missing_or_conflict(conn: &mut SqliteConnection, work_order_id: WorkOrderId) -> StoreError {
    let exists = sqlx::query("SELECT 1 FROM work_orders WHERE id = ?1")
        .bind(work_order_id)
        .fetch_optional(&mut *conn)
        .await;
    match exists {
        Ok(Some(_)) => StoreError::Conflict { work_order_id },
        Ok(None) => StoreError::MissingWorkOrder { work_order_id },
        Err(e) => e.into(),
    }
}

fn parse_time(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| StoreError::Corrupt {
                    reason: format!("invalid timestamp '{raw}': {e}"),
                })
        })
        .transpose()
}

fn parse_required_time(raw: String) -> Result<DateTime<Utc>, StoreError> {
    parse_time(Some(raw))?.ok_or(StoreError::Corrupt {
        reason: "missing timestamp".to_string(),
    })
}

fn intervention_from_row(row: &SqliteRow) -> Result<Intervention, StoreError> {
    let sequence: i64 = row.try_get("sequence")?;
    let status: Option<String> = row.try_get("status")?;
    let activity_type: String = row.try_get("activity_type")?;

    Ok(Intervention {
        id: row.try_get("id")?,
        work_order_id: row.try_get("work_order_id")?,
        sequence: u32::try_from(sequence).map_err(|_| StoreError::Corrupt {
            reason: format!("invalid intervention sequence {sequence}"),
        })?,
        description: row.try_get("description")?,
        estimated_hours: row.try_get("estimated_hours")?,
        activity_type: activity_type.parse::<ActivityType>()?,
        status: status.map(|s| s.parse::<InterventionStatus>()).transpose()?,
        note: row.try_get("note")?,
        suspension_note: row.try_get("suspension_note")?,
        started_at: parse_time(row.try_get("started_at")?)?,
        ended_at: parse_time(row.try_get("ended_at")?)?,
    })
}

fn activity_from_row(row: &SqliteRow) -> Result<Activity, StoreError> {
    let activity_type: String = row.try_get("activity_type")?;
    let status: String = row.try_get("status")?;
    Ok(Activity {
        id: row.try_get("id")?,
        description: row.try_get("description")?,
        activity_type: activity_type.parse::<ActivityType>()?,
        status: status.parse::<ActivityStatus>()?,
    })
}

fn audit_from_row(row: &SqliteRow) -> Result<AuditEntry, StoreError> {
    let from_state: String = row.try_get("from_state")?;
    let to_state: String = row.try_get("to_state")?;
    let transition_type: String = row.try_get("transition_type")?;
    Ok(AuditEntry {
        id: row.try_get("id")?,
        work_order_id: row.try_get("work_order_id")?,
        from_state: from_state.parse::<WorkOrderState>()?,
        to_state: to_state.parse::<WorkOrderState>()?,
        transition_type: transition_type.parse::<TransitionType>()?,
        executed_by: row.try_get("executed_by")?,
        user_role: row.try_get("user_role")?,
        reason: row.try_get("reason")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
        created_at: parse_required_time(row.try_get("created_at")?)?,
    })
}

fn user_from_row(row: &SqliteRow) -> Result<User, StoreError> {
    let role: String = row.try_get("role")?;
    Ok(User {
        id: row.try_get("id")?,
        full_name: row.try_get("full_name")?,
        email: row.try_get("email")?,
        role: role.parse::<Role>()?,
        active: row.try_get("active")?,
    })
}

async fn fetch_intervention(
    conn: &mut SqliteConnection,
    intervention_id: InterventionId,
) -> Result<Intervention, StoreError> {
    let sql = format!("SELECT {INTERVENTION_COLUMNS} FROM interventions WHERE id = ?1");
    let row = sqlx::query(&sql)
        .bind(intervention_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StoreError::MissingIntervention { intervention_id })?;
    intervention_from_row(&row)
}

#[async_trait]
impl WorkOrderStore for SqliteStore {
    async fn load_work_order(&self, id: WorkOrderId) -> Result<Option<WorkOrder>, StoreError> {
        // One read transaction so the aggregate is a consistent snapshot
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {WORK_ORDER_COLUMNS} FROM work_orders WHERE id = ?1");
        let Some(row) = sqlx::query(&sql).bind(id).fetch_optional(&mut *tx).await? else {
            return Ok(None);
        };

        let sql = format!(
            "SELECT {INTERVENTION_COLUMNS} FROM interventions WHERE work_order_id = ?1 ORDER BY sequence"
        );
        let interventions = sqlx::query(&sql)
            .bind(id)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(intervention_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let activities = sqlx::query(
            r#"
            SELECT id, description, activity_type, status
            FROM work_order_activities
            WHERE work_order_id = ?1
            ORDER BY id
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(activity_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        tx.commit().await?;

        let state: String = row.try_get("state")?;
        let priority: String = row.try_get("priority")?;
        Ok(Some(WorkOrder {
            id: row.try_get("id")?,
            number: row.try_get("number")?,
            state: state.parse::<WorkOrderState>()?,
            priority: priority.parse::<Priority>()?,
            appointment_date: parse_time(row.try_get("appointment_date")?)?,
            expected_end_date: parse_time(row.try_get("expected_end_date")?)?,
            completion_date: parse_time(row.try_get("completion_date")?)?,
            created_by: row.try_get("created_by")?,
            approved_by: row.try_get("approved_by")?,
            interventions,
            activities,
        }))
    }

    async fn commit_transition(&self, write: TransitionWrite) -> Result<AuditEntry, StoreError> {
        let mut tx = self.pool.begin().await?;
        let entry = apply_write(&mut *tx, write).await?;
        tx.commit().await?;

        debug!(
            work_order_id = entry.work_order_id,
            audit_id = entry.id,
            "Committed transition"
        );
        Ok(entry)
    }

    async fn commit_intervention_change(
        &self,
        change: InterventionChange,
        cascades: Vec<TransitionWrite>,
    ) -> Result<(Intervention, Vec<AuditEntry>), StoreError> {
        let mut tx = self.pool.begin().await?;

        // Writing the parent row first takes the database write lock, so the
        // intervention rows read below stay current until commit
        let touched = sqlx::query("UPDATE work_orders SET updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(change.work_order_id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(StoreError::MissingWorkOrder {
                work_order_id: change.work_order_id,
            });
        }

        let current = sqlx::query("SELECT id, status FROM interventions WHERE work_order_id = ?1 ORDER BY id")
            .bind(change.work_order_id)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| -> Result<(InterventionId, Option<InterventionStatus>), StoreError> {
                let status: Option<String> = row.try_get("status")?;
                Ok((
                    row.try_get("id")?,
                    status.map(|s| s.parse::<InterventionStatus>()).transpose()?,
                ))
            })
            .collect::<Result<InterventionSnapshot, _>>()?;
        if current != change.expected {
            return Err(StoreError::Conflict {
                work_order_id: change.work_order_id,
            });
        }

        let result = sqlx::query(
            r#"
            UPDATE interventions
            SET status = ?1,
                note = COALESCE(?2, note),
                suspension_note = COALESCE(?3, suspension_note),
                started_at = COALESCE(?4, started_at),
                ended_at = COALESCE(?5, ended_at)
            WHERE id = ?6 AND work_order_id = ?7
            "#,
        )
        .bind(change.status.code())
        .bind(&change.note)
        .bind(&change.suspension_note)
        .bind(change.started_at.map(|d| d.to_rfc3339()))
        .bind(change.ended_at.map(|d| d.to_rfc3339()))
        .bind(change.intervention_id)
        .bind(change.work_order_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MissingIntervention {
                intervention_id: change.intervention_id,
            });
        }

        let mut entries = Vec::with_capacity(cascades.len());
        for write in cascades {
            entries.push(apply_write(&mut *tx, write).await?);
        }

        let intervention = fetch_intervention(&mut *tx, change.intervention_id).await?;
        tx.commit().await?;
        Ok((intervention, entries))
    }

    async fn insert_intervention(&self, insert: InterventionInsert) -> Result<Intervention, StoreError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM work_orders WHERE id = ?1")
            .bind(insert.work_order_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::MissingWorkOrder {
                work_order_id: insert.work_order_id,
            });
        }

        let result = sqlx::query(
            r#"
            INSERT INTO interventions
                (work_order_id, sequence, description, estimated_hours, activity_type,
                 status, note, suspension_note)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(insert.work_order_id)
        .bind(i64::from(insert.sequence))
        .bind(&insert.description)
        .bind(insert.estimated_hours)
        .bind(insert.activity_type.as_str())
        .bind(insert.status.map(|s| s.code()))
        .bind(&insert.note)
        .bind(&insert.suspension_note)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::DuplicateSequence {
                work_order_id: insert.work_order_id,
                sequence: insert.sequence,
            },
            other => other.into(),
        })?;

        let intervention = fetch_intervention(&mut *tx, result.last_insert_rowid()).await?;
        tx.commit().await?;
        Ok(intervention)
    }

    async fn audit_trail(&self, work_order_id: WorkOrderId, limit: usize) -> Result<Vec<AuditEntry>, StoreError> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM work_order_audits WHERE work_order_id = ?1 ORDER BY id DESC LIMIT ?2"
        );
        sqlx::query(&sql)
            .bind(work_order_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(audit_from_row)
            .collect()
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        sqlx::query("SELECT id, full_name, email, role, active FROM users WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }

    async fn active_users(&self, roles: Option<Vec<Role>>) -> Result<Vec<User>, StoreError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, full_name, email, role, active FROM users WHERE active = 1");

        if let Some(roles) = roles {
            if roles.is_empty() {
                return Ok(Vec::new());
            }
            builder.push(" AND role IN (");
            let mut separated = builder.separated(", ");
            for role in roles {
                separated.push_bind(role.as_str());
            }
            separated.push_unseparated(")");
        }
        builder.push(" ORDER BY id");

        builder
            .build()
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(user_from_row)
            .collect()
    }
}
