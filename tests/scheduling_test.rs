mod common;

use academy_api::{
    auth::Actor,
    entities::program_session::SessionStatus,
    errors::ServiceError,
    services::scheduling::SessionSlot,
};
use assert_matches::assert_matches;
use common::{coach, hm, jan_10, seed_program, seed_session, TestContext};
use rstest::rstest;
use uuid::Uuid;

fn slot(start: (u32, u32), end: (u32, u32)) -> SessionSlot {
    SessionSlot {
        session_date: jan_10(),
        start_time: hm(start.0, start.1),
        end_time: hm(end.0, end.1),
    }
}

#[rstest]
#[case::overlapping_half_hour((10, 30), (11, 30), false)]
#[case::back_to_back((11, 0), (12, 0), true)]
#[case::ends_when_existing_starts((9, 0), (10, 0), true)]
#[case::contained((10, 15), (10, 45), false)]
#[case::surrounding((9, 0), (12, 0), false)]
#[tokio::test]
async fn availability_uses_half_open_intervals(
    #[case] start: (u32, u32),
    #[case] end: (u32, u32),
    #[case] expected: bool,
) {
    let ctx = TestContext::new().await;
    let coach = coach();
    let program = seed_program(&ctx.db, coach.user_id, 100_000, 10).await;
    seed_session(&ctx.db, &program, jan_10(), hm(10, 0), hm(11, 0)).await;

    let available = ctx
        .services
        .scheduling
        .check_coach_availability(coach.user_id, jan_10(), hm(start.0, start.1), hm(end.0, end.1))
        .await
        .unwrap();
    assert_eq!(available, expected);
}

#[tokio::test]
async fn other_days_and_coaches_do_not_conflict() {
    let ctx = TestContext::new().await;
    let coach = coach();
    let program = seed_program(&ctx.db, coach.user_id, 100_000, 10).await;
    seed_session(&ctx.db, &program, jan_10(), hm(10, 0), hm(11, 0)).await;
    let scheduling = &ctx.services.scheduling;

    let next_day = jan_10().succ_opt().unwrap();
    assert!(scheduling
        .check_coach_availability(coach.user_id, next_day, hm(10, 0), hm(11, 0))
        .await
        .unwrap());
    assert!(scheduling
        .check_coach_availability(Uuid::new_v4(), jan_10(), hm(10, 0), hm(11, 0))
        .await
        .unwrap());
    assert_matches!(
        scheduling
            .check_coach_availability(coach.user_id, jan_10(), hm(11, 0), hm(10, 0))
            .await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn double_booking_is_rejected_across_programs() {
    let ctx = TestContext::new().await;
    let coach = coach();
    let morning = seed_program(&ctx.db, coach.user_id, 100_000, 10).await;
    let evening = seed_program(&ctx.db, coach.user_id, 100_000, 10).await;
    let scheduling = &ctx.services.scheduling;

    let first = scheduling
        .add_session(&coach, morning.id, slot((10, 0), (11, 0)))
        .await
        .unwrap();
    assert_eq!(first.status, SessionStatus::Scheduled);
    assert_eq!(first.coach_id, coach.user_id);

    assert_matches!(
        scheduling
            .add_session(&coach, evening.id, slot((10, 30), (11, 30)))
            .await,
        Err(ServiceError::SchedulingConflict(_))
    );
    scheduling
        .add_session(&coach, evening.id, slot((11, 0), (12, 0)))
        .await
        .unwrap();
}

#[tokio::test]
async fn only_the_programs_coach_or_an_admin_schedules() {
    let ctx = TestContext::new().await;
    let owner = coach();
    let program = seed_program(&ctx.db, owner.user_id, 100_000, 10).await;
    let scheduling = &ctx.services.scheduling;

    assert_matches!(
        scheduling
            .add_session(&coach(), program.id, slot((8, 0), (9, 0)))
            .await,
        Err(ServiceError::Forbidden(_))
    );
    assert_matches!(
        scheduling
            .add_session(&Actor::user(owner.user_id), program.id, slot((8, 0), (9, 0)))
            .await,
        Err(ServiceError::Forbidden(_))
    );
    assert_matches!(
        scheduling
            .add_session(&owner, Uuid::new_v4(), slot((8, 0), (9, 0)))
            .await,
        Err(ServiceError::NotFound(_))
    );

    let by_admin = scheduling
        .add_session(&Actor::admin(Uuid::new_v4()), program.id, slot((8, 0), (9, 0)))
        .await
        .unwrap();
    assert_eq!(by_admin.coach_id, owner.user_id);
}

#[tokio::test]
async fn rescheduling_ignores_the_session_itself() {
    let ctx = TestContext::new().await;
    let coach = coach();
    let program = seed_program(&ctx.db, coach.user_id, 100_000, 10).await;
    let moving = seed_session(&ctx.db, &program, jan_10(), hm(10, 0), hm(11, 0)).await;
    seed_session(&ctx.db, &program, jan_10(), hm(13, 0), hm(14, 0)).await;
    let scheduling = &ctx.services.scheduling;

    let moved = scheduling
        .update_session(&coach, program.id, moving.id, slot((10, 30), (11, 30)))
        .await
        .unwrap();
    assert_eq!(moved.start_time, hm(10, 30));
    assert_eq!(moved.end_time, hm(11, 30));

    assert_matches!(
        scheduling
            .update_session(&coach, program.id, moving.id, slot((12, 30), (13, 30)))
            .await,
        Err(ServiceError::SchedulingConflict(_))
    );
    assert_matches!(
        scheduling
            .update_session(&coach, program.id, Uuid::new_v4(), slot((15, 0), (16, 0)))
            .await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn status_changes_are_terminal_and_free_the_slot() {
    let ctx = TestContext::new().await;
    let coach = coach();
    let program = seed_program(&ctx.db, coach.user_id, 100_000, 10).await;
    let session = seed_session(&ctx.db, &program, jan_10(), hm(10, 0), hm(11, 0)).await;
    let scheduling = &ctx.services.scheduling;

    let cancelled = scheduling
        .update_session_status(&coach, program.id, session.id, SessionStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);

    assert_matches!(
        scheduling
            .update_session_status(&coach, program.id, session.id, SessionStatus::Completed)
            .await,
        Err(ServiceError::Conflict(_))
    );
    assert_matches!(
        scheduling
            .update_session(&coach, program.id, session.id, slot((15, 0), (16, 0)))
            .await,
        Err(ServiceError::Conflict(_))
    );

    // a cancelled session no longer blocks the coach
    assert!(scheduling
        .check_coach_availability(coach.user_id, jan_10(), hm(10, 0), hm(11, 0))
        .await
        .unwrap());
}
