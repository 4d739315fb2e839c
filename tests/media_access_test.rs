mod common;

use academy_api::{
    auth::Actor,
    entities::enrollment::{self, EnrollmentTarget},
    errors::ServiceError,
};
use assert_matches::assert_matches;
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
};
use chrono::Utc;
use common::{seed_media, test_config, TestContext};
use sea_orm::{ActiveModelTrait, Set};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

async fn context_with_media() -> (TestContext, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("courses")).unwrap();
    std::fs::write(dir.path().join("courses/lesson-1.txt"), b"welcome to lesson one").unwrap();

    let mut config = test_config();
    config.media_dir = dir.path().to_string_lossy().into_owned();
    (TestContext::with_config(config).await, dir)
}

async fn enroll(ctx: &TestContext, user_id: Uuid, course_id: Uuid) {
    enrollment::ActiveModel {
        user_id: Set(user_id),
        target_id: Set(course_id),
        target_type: Set(EnrollmentTarget::Course),
        order_id: Set(Uuid::new_v4()),
        enrolled_at: Set(Utc::now()),
    }
    .insert(&ctx.db)
    .await
    .unwrap();
}

#[tokio::test]
async fn enrolled_users_and_admins_read_private_files() {
    let (ctx, _dir) = context_with_media().await;
    let course_id = Uuid::new_v4();
    let file_id = seed_media(&ctx.db, course_id, "courses/lesson-1.txt", true).await;
    let learner = Actor::user(Uuid::new_v4());
    let media = &ctx.services.media;

    assert_matches!(
        media.open_media(file_id, &learner).await,
        Err(ServiceError::Forbidden(_))
    );

    enroll(&ctx, learner.user_id, course_id).await;
    let content = media.open_media(file_id, &learner).await.unwrap();
    assert_eq!(content.size, 21);
    assert!(content.path.ends_with("courses/lesson-1.txt"));
    assert_eq!(content.file_name, "lesson-1.txt");
    assert_eq!(content.mime_type, "text/plain");

    let admin = Actor::admin(Uuid::new_v4());
    assert!(media.open_media(file_id, &admin).await.is_ok());
}

#[tokio::test]
async fn public_files_need_no_enrollment() {
    let (ctx, _dir) = context_with_media().await;
    let file_id = seed_media(&ctx.db, Uuid::new_v4(), "courses/lesson-1.txt", false).await;

    let content = ctx
        .services
        .media
        .open_media(file_id, &Actor::user(Uuid::new_v4()))
        .await
        .unwrap();
    assert!(content.size > 0);
}

#[tokio::test]
async fn missing_records_content_and_escaping_paths() {
    let (ctx, _dir) = context_with_media().await;
    let admin = Actor::admin(Uuid::new_v4());
    let media = &ctx.services.media;

    assert_matches!(
        media.open_media(Uuid::new_v4(), &admin).await,
        Err(ServiceError::NotFound(_))
    );

    let gone = seed_media(&ctx.db, Uuid::new_v4(), "courses/removed.txt", false).await;
    assert_matches!(
        media.open_media(gone, &admin).await,
        Err(ServiceError::NotFound(_))
    );

    let escaping = seed_media(&ctx.db, Uuid::new_v4(), "../outside.txt", false).await;
    assert_matches!(
        media.open_media(escaping, &admin).await,
        Err(ServiceError::InternalError(_))
    );
}

#[tokio::test]
async fn media_route_streams_files_and_honours_ranges() {
    let (ctx, _dir) = context_with_media().await;
    let course_id = Uuid::new_v4();
    let file_id = seed_media(&ctx.db, course_id, "courses/lesson-1.txt", true).await;
    let learner = Actor::user(Uuid::new_v4());
    let bearer = ctx.bearer(learner);
    let app = ctx.router();
    let uri = format!("/api/v1/media/{}", file_id);

    let denied = app
        .clone()
        .oneshot(
            Request::get(&uri)
                .header(header::AUTHORIZATION, &bearer)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    enroll(&ctx, learner.user_id, course_id).await;
    let full = app
        .clone()
        .oneshot(
            Request::get(&uri)
                .header(header::AUTHORIZATION, &bearer)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(full.status(), StatusCode::OK);
    assert_eq!(full.headers()[header::CONTENT_TYPE], "text/plain");
    assert_eq!(
        full.headers()[header::CONTENT_DISPOSITION],
        "inline; filename=\"lesson-1.txt\""
    );
    let body = to_bytes(full.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"welcome to lesson one");

    let ranged = app
        .oneshot(
            Request::get(&uri)
                .header(header::AUTHORIZATION, &bearer)
                .header(header::RANGE, "bytes=0-6")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(ranged.status(), StatusCode::PARTIAL_CONTENT);
    let body = to_bytes(ranged.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"welcome");
}
