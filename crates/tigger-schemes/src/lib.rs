//! Per-project coding schemes and annotation history.
//!
//! Grounded in `server.py`'s scheme/tag endpoints and `db.py`'s
//! `add_scheme`/`add_annotation`/`delete_scheme` methods. The current label
//! of an element is always derivable from annotation history alone — there
//! is no separate "current label" table (spec.md §4.3).

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tigger_core::db::{Db, DbError};
use tigger_core::types::{Annotation, DatasetPartition, Scheme, SchemeKind};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum SchemeError {
    #[error("scheme not found: {0}")]
    NotFound(String),
    #[error("scheme already exists: {0}")]
    AlreadyExists(String),
    #[error("label {0} not in scheme {1}")]
    InvalidLabel(String, String),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<&SchemeError> for tigger_core::error::ErrorKind {
    fn from(err: &SchemeError) -> Self {
        use tigger_core::error::ErrorKind;
        match err {
            SchemeError::NotFound(_) => ErrorKind::NotFound,
            SchemeError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            SchemeError::InvalidLabel(..) => ErrorKind::Invalid,
            SchemeError::Db(e) => e.into(),
        }
    }
}

/// Striped lock key enforcing at-most-one concurrent writer per
/// (project, element, scheme, user), per spec.md §5.
type WriteKey = (String, String, String, String);

pub struct Schemes {
    db: Arc<Db>,
    write_locks: DashMap<WriteKey, Arc<Mutex<()>>>,
}

impl Schemes {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            write_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, key: WriteKey) -> Arc<Mutex<()>> {
        self.write_locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub async fn add_scheme(&self, project_slug: &str, name: &str, kind: SchemeKind, labels: Vec<String>) -> Result<(), SchemeError> {
        if self.db.get_scheme(project_slug, name).await?.is_some() {
            return Err(SchemeError::AlreadyExists(name.to_string()));
        }
        self.db.add_scheme(&Scheme::new(project_slug.to_string(), name, kind, labels)).await?;
        Ok(())
    }

    /// Removes the scheme row; annotation history is retained and becomes
    /// orphaned but remains queryable for audit (open question (b) resolved
    /// this way — see DESIGN.md).
    pub async fn delete_scheme(&self, project_slug: &str, name: &str) -> Result<(), SchemeError> {
        self.db.delete_scheme(project_slug, name).await?;
        Ok(())
    }

    pub async fn add_label(&self, project_slug: &str, scheme: &str, label: &str) -> Result<(), SchemeError> {
        let mut s = self.require_scheme(project_slug, scheme).await?;
        if s.has_label(label) {
            return Err(SchemeError::AlreadyExists(label.to_string()));
        }
        s.labels.push(label.to_string());
        self.db.update_scheme_labels(project_slug, scheme, &s.labels).await?;
        Ok(())
    }

    /// Label deletion additionally writes a clearing annotation for every
    /// current holder of that label, attributed to the acting user, and
    /// preserves the ordering of the remaining labels.
    pub async fn delete_label(&self, project_slug: &str, scheme: &str, label: &str, acting_user: &str) -> Result<usize, SchemeError> {
        let mut s = self.require_scheme(project_slug, scheme).await?;
        s.labels.retain(|l| l != label);
        self.db.update_scheme_labels(project_slug, scheme, &s.labels).await?;

        let latest = self
            .db
            .latest_per_element(project_slug, scheme, &[DatasetPartition::Train, DatasetPartition::Valid, DatasetPartition::Test])
            .await?;
        let mut cleared = 0;
        for a in latest.into_iter().filter(|a| a.annotation.as_deref() == Some(label)) {
            self.push_annotation(project_slug, &a.element_id, scheme, None, acting_user, a.dataset, "label deleted").await?;
            cleared += 1;
        }
        Ok(cleared)
    }

    /// Validates `label` is `None` or a member of the scheme, then appends
    /// one record under the per-(project, element, scheme, user) lock.
    pub async fn push_annotation(
        &self,
        project_slug: &str,
        element_id: &str,
        scheme: &str,
        label: Option<&str>,
        user: &str,
        dataset: DatasetPartition,
        comment: &str,
    ) -> Result<(), SchemeError> {
        let s = self.require_scheme(project_slug, scheme).await?;
        if let Some(l) = label {
            if !s.has_label(l) {
                return Err(SchemeError::InvalidLabel(l.to_string(), scheme.to_string()));
            }
        }

        let key = (project_slug.to_string(), element_id.to_string(), scheme.to_string(), user.to_string());
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let ann = Annotation::new(
            project_slug.to_string(),
            element_id,
            scheme,
            label.map(|l| l.to_string()),
            user,
            dataset,
            comment,
        );
        self.db.append_annotation(&ann).await?;
        Ok(())
    }

    /// Latest annotation per element, across `datasets`.
    pub async fn get_scheme_data(&self, project_slug: &str, scheme: &str, datasets: &[DatasetPartition]) -> Result<Vec<Annotation>, SchemeError> {
        self.require_scheme(project_slug, scheme).await?;
        Ok(self.db.latest_per_element(project_slug, scheme, datasets).await?)
    }

    /// For each element currently labeled `old`, append an annotation to
    /// `new`. Idempotent: a second pass sees no element still at `old`.
    pub async fn convert_label(&self, project_slug: &str, scheme: &str, old: &str, new: &str, acting_user: &str) -> Result<usize, SchemeError> {
        let s = self.require_scheme(project_slug, scheme).await?;
        if !s.has_label(new) {
            return Err(SchemeError::InvalidLabel(new.to_string(), scheme.to_string()));
        }
        let latest = self
            .db
            .latest_per_element(project_slug, scheme, &[DatasetPartition::Train, DatasetPartition::Valid, DatasetPartition::Test])
            .await?;
        let mut converted = 0;
        for a in latest.into_iter().filter(|a| a.annotation.as_deref() == Some(old)) {
            self.push_annotation(project_slug, &a.element_id, scheme, Some(new), acting_user, a.dataset, "converted").await?;
            converted += 1;
        }
        Ok(converted)
    }

    /// Elements labeled by >=2 users with >=2 distinct non-null labels.
    pub async fn reconciliation(&self, project_slug: &str, scheme: &str) -> Result<Vec<(String, HashMap<String, String>)>, SchemeError> {
        self.require_scheme(project_slug, scheme).await?;
        let table = self.db.reconciliation_table(project_slug, scheme).await?;
        Ok(table.into_iter().map(|(elem, labels)| (elem, labels.into_iter().collect())).collect())
    }

    async fn require_scheme(&self, project_slug: &str, name: &str) -> Result<Scheme, SchemeError> {
        self.db
            .get_scheme(project_slug, name)
            .await?
            .ok_or_else(|| SchemeError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tigger_core::types::{Project, ProjectParams};

    async fn setup() -> (Schemes, Arc<Db>) {
        let db = Arc::new(Db::new_in_memory().await.unwrap());
        db.add_project(&Project {
            slug: "demo".into(),
            created_by: "root".into(),
            created_at: chrono::Utc::now(),
            params: ProjectParams {
                col_text: "text".into(),
                cols_context: vec![],
                n_train: 10,
                n_test: 2,
                col_label: None,
            },
        })
        .await
        .unwrap();
        let schemes = Schemes::new(db.clone());
        schemes.add_scheme("demo", "default", SchemeKind::Multiclass, vec!["a".into(), "b".into()]).await.unwrap();
        (schemes, db)
    }

    #[tokio::test]
    async fn push_annotation_rejects_unknown_label() {
        let (schemes, _db) = setup().await;
        let err = schemes
            .push_annotation("demo", "e1", "default", Some("z"), "u1", DatasetPartition::Train, "")
            .await
            .unwrap_err();
        assert!(matches!(err, SchemeError::InvalidLabel(_, _)));
    }

    #[tokio::test]
    async fn get_scheme_data_reflects_latest_label() {
        let (schemes, _db) = setup().await;
        schemes.push_annotation("demo", "e1", "default", Some("a"), "u1", DatasetPartition::Train, "").await.unwrap();
        schemes.push_annotation("demo", "e1", "default", Some("b"), "u1", DatasetPartition::Train, "").await.unwrap();

        let data = schemes.get_scheme_data("demo", "default", &[DatasetPartition::Train]).await.unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].annotation.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn delete_label_clears_current_holders() {
        let (schemes, _db) = setup().await;
        schemes.push_annotation("demo", "e1", "default", Some("a"), "u1", DatasetPartition::Train, "").await.unwrap();
        let cleared = schemes.delete_label("demo", "default", "a", "root").await.unwrap();
        assert_eq!(cleared, 1);

        let data = schemes.get_scheme_data("demo", "default", &[DatasetPartition::Train]).await.unwrap();
        assert_eq!(data[0].annotation, None);
    }

    #[tokio::test]
    async fn convert_label_is_idempotent() {
        let (schemes, _db) = setup().await;
        schemes.push_annotation("demo", "e1", "default", Some("a"), "u1", DatasetPartition::Train, "").await.unwrap();

        schemes.convert_label("demo", "default", "a", "b", "root").await.unwrap();
        let first = schemes.get_scheme_data("demo", "default", &[DatasetPartition::Train]).await.unwrap();

        schemes.convert_label("demo", "default", "a", "b", "root").await.unwrap();
        let second = schemes.get_scheme_data("demo", "default", &[DatasetPartition::Train]).await.unwrap();

        assert_eq!(first[0].annotation, second[0].annotation);
        assert_eq!(second[0].annotation.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn reconciliation_requires_distinct_labels_from_two_users() {
        let (schemes, _db) = setup().await;
        schemes.push_annotation("demo", "e1", "default", Some("a"), "u1", DatasetPartition::Train, "").await.unwrap();
        schemes.push_annotation("demo", "e1", "default", Some("b"), "u2", DatasetPartition::Train, "").await.unwrap();

        let table = schemes.reconciliation("demo", "default").await.unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].0, "e1");
    }
}
