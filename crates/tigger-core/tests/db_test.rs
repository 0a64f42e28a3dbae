use chrono::Utc;
use tigger_core::db::Db;
use tigger_core::types::{Auth, AuthStatus, User};

#[tokio::test]
async fn db_persists_across_reopen_of_same_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("activetigger.db");

    {
        let db = Db::new(&path).await.unwrap();
        db.add_user(&User {
            user_name: "root".into(),
            password_hash: tigger_core::auth::hash_password("rootpassword").unwrap(),
            role: "manager".into(),
            created_by: None,
            mail: None,
            created_at: Utc::now(),
            deactivated_at: None,
        })
        .await
        .unwrap();
    }

    let db = Db::new(&path).await.unwrap();
    let user = db.get_user("root").await.unwrap().unwrap();
    assert_eq!(user.user_name, "root");
    assert!(tigger_core::auth::verify_password("rootpassword", &user.password_hash).unwrap());
}

#[tokio::test]
async fn auth_status_controls_project_access_role() {
    let db = Db::new_in_memory().await.unwrap();
    db.add_auth(&Auth {
        user: "alice".into(),
        project_slug: "demo".into(),
        status: AuthStatus::Annotator,
    })
    .await
    .unwrap();

    let auth = db.get_user_auth("alice", "demo").await.unwrap().unwrap();
    assert_eq!(auth.status, AuthStatus::Annotator);
    assert!(db.get_user_auth("bob", "demo").await.unwrap().is_none());
}
