use chrono::{NaiveDate, NaiveTime, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::Actor,
    entities::{
        class_program::{Entity as ClassProgram, Model as ClassProgramModel},
        program_session::{self, Entity as ProgramSession, Model as SessionModel, SessionStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Proposed session time on one date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct SessionSlot {
    pub session_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl SessionSlot {
    fn validate(&self) -> Result<(), ServiceError> {
        if self.start_time >= self.end_time {
            return Err(ServiceError::ValidationError(
                "start_time must be before end_time".to_string(),
            ));
        }
        Ok(())
    }
}

/// Half-open interval overlap: `[a_start, a_end)` and `[b_start, b_end)` share time
pub fn overlaps(a_start: NaiveTime, a_end: NaiveTime, b_start: NaiveTime, b_end: NaiveTime) -> bool {
    a_start < b_end && a_end > b_start
}

/// First scheduled session that collides with `[start, end)`, skipping `exclude`
pub fn find_conflict<'a>(
    sessions: &'a [SessionModel],
    start: NaiveTime,
    end: NaiveTime,
    exclude: Option<Uuid>,
) -> Option<&'a SessionModel> {
    sessions.iter().find(|s| {
        s.status == SessionStatus::Scheduled
            && Some(s.id) != exclude
            && overlaps(start, end, s.start_time, s.end_time)
    })
}

/// Coach availability and program session management
#[derive(Clone)]
pub struct SchedulingService {
    db: DatabaseConnection,
    events: EventSender,
}

impl SchedulingService {
    pub fn new(db: DatabaseConnection, events: EventSender) -> Self {
        Self { db, events }
    }

    async fn coach_sessions_on<C: ConnectionTrait>(
        conn: &C,
        coach_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<SessionModel>, ServiceError> {
        Ok(ProgramSession::find()
            .filter(program_session::Column::CoachId.eq(coach_id))
            .filter(program_session::Column::SessionDate.eq(date))
            .filter(program_session::Column::Status.eq(SessionStatus::Scheduled))
            .all(conn)
            .await?)
    }

    async fn ensure_available<C: ConnectionTrait>(
        conn: &C,
        coach_id: Uuid,
        slot: &SessionSlot,
        exclude: Option<Uuid>,
    ) -> Result<(), ServiceError> {
        let sessions = Self::coach_sessions_on(conn, coach_id, slot.session_date).await?;
        if let Some(conflict) = find_conflict(&sessions, slot.start_time, slot.end_time, exclude) {
            counter!("academy.scheduling.conflicts", 1);
            warn!(%coach_id, conflicting_session = %conflict.id, "coach double-booking rejected");
            return Err(ServiceError::SchedulingConflict(format!(
                "coach already has a session on {} from {} to {}",
                conflict.session_date,
                conflict.start_time.format("%H:%M"),
                conflict.end_time.format("%H:%M")
            )));
        }
        Ok(())
    }

    /// True when the coach has no scheduled session overlapping `[start, end)` on `date`
    #[instrument(skip(self))]
    pub async fn check_coach_availability(
        &self,
        coach_id: Uuid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<bool, ServiceError> {
        let slot = SessionSlot {
            session_date: date,
            start_time: start,
            end_time: end,
        };
        slot.validate()?;
        let sessions = Self::coach_sessions_on(&self.db, coach_id, date).await?;
        Ok(find_conflict(&sessions, start, end, None).is_none())
    }

    async fn managed_program(
        &self,
        actor: &Actor,
        program_id: Uuid,
    ) -> Result<ClassProgramModel, ServiceError> {
        let program = ClassProgram::find_by_id(program_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("program {}", program_id)))?;
        if !actor.can_manage_program(program.coach_id) {
            return Err(ServiceError::Forbidden(
                "not allowed to manage this program".to_string(),
            ));
        }
        Ok(program)
    }

    async fn program_session<C: ConnectionTrait>(
        conn: &C,
        program_id: Uuid,
        session_id: Uuid,
    ) -> Result<SessionModel, ServiceError> {
        ProgramSession::find_by_id(session_id)
            .filter(program_session::Column::ProgramId.eq(program_id))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("session {}", session_id)))
    }

    /// Appends a session after checking the coach is free
    #[instrument(skip(self, actor))]
    pub async fn add_session(
        &self,
        actor: &Actor,
        program_id: Uuid,
        slot: SessionSlot,
    ) -> Result<SessionModel, ServiceError> {
        slot.validate()?;
        let program = self.managed_program(actor, program_id).await?;

        let txn = self.db.begin().await?;
        Self::ensure_available(&txn, program.coach_id, &slot, None).await?;
        let now = Utc::now();
        let session = program_session::ActiveModel {
            id: Set(Uuid::new_v4()),
            program_id: Set(program.id),
            coach_id: Set(program.coach_id),
            session_date: Set(slot.session_date),
            start_time: Set(slot.start_time),
            end_time: Set(slot.end_time),
            status: Set(SessionStatus::Scheduled),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;

        info!(session_id = %session.id, "session scheduled");
        self.events
            .send_or_log(Event::SessionScheduled {
                session_id: session.id,
                program_id: program.id,
                coach_id: program.coach_id,
            });
        Ok(session)
    }

    /// Moves a scheduled session; the session does not conflict with itself
    #[instrument(skip(self, actor))]
    pub async fn update_session(
        &self,
        actor: &Actor,
        program_id: Uuid,
        session_id: Uuid,
        slot: SessionSlot,
    ) -> Result<SessionModel, ServiceError> {
        slot.validate()?;
        let program = self.managed_program(actor, program_id).await?;

        let txn = self.db.begin().await?;
        let session = Self::program_session(&txn, program_id, session_id).await?;
        if session.status != SessionStatus::Scheduled {
            return Err(ServiceError::Conflict(format!(
                "session {} is no longer scheduled",
                session_id
            )));
        }
        Self::ensure_available(&txn, program.coach_id, &slot, Some(session_id)).await?;

        let mut active: program_session::ActiveModel = session.into();
        active.session_date = Set(slot.session_date);
        active.start_time = Set(slot.start_time);
        active.end_time = Set(slot.end_time);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;
        txn.commit().await?;

        info!(%session_id, "session rescheduled");
        Ok(updated)
    }

    /// scheduled -> completed | cancelled; both targets are terminal
    #[instrument(skip(self, actor))]
    pub async fn update_session_status(
        &self,
        actor: &Actor,
        program_id: Uuid,
        session_id: Uuid,
        status: SessionStatus,
    ) -> Result<SessionModel, ServiceError> {
        self.managed_program(actor, program_id).await?;
        let session = Self::program_session(&self.db, program_id, session_id).await?;
        if !session.status.can_transition_to(status) {
            return Err(ServiceError::Conflict(format!(
                "cannot move session from {:?} to {:?}",
                session.status, status
            )));
        }

        let result = ProgramSession::update_many()
            .col_expr(
                program_session::Column::Status,
                sea_orm::sea_query::Expr::value(status),
            )
            .col_expr(
                program_session::Column::UpdatedAt,
                sea_orm::sea_query::Expr::value(Utc::now()),
            )
            .filter(program_session::Column::Id.eq(session_id))
            .filter(program_session::Column::Status.eq(SessionStatus::Scheduled))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(format!(
                "session {} changed concurrently",
                session_id
            )));
        }

        info!(%session_id, ?status, "session status updated");
        Self::program_session(&self.db, program_id, session_id).await
    }
}
