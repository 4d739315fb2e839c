use std::path::{Component, Path, PathBuf};

use sea_orm::{DatabaseConnection, EntityTrait};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::{
    auth::Actor,
    entities::{enrollment::Entity as Enrollment, media_file::Entity as MediaFile},
    errors::ServiceError,
};

/// Resolved file ready to be streamed
#[derive(Debug, Clone)]
pub struct MediaContent {
    pub file_name: String,
    pub mime_type: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Serves private course media to enrolled users
#[derive(Clone)]
pub struct MediaService {
    db: DatabaseConnection,
    root: PathBuf,
}

fn is_contained(relative: &Path) -> bool {
    relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
}

impl MediaService {
    pub fn new(db: DatabaseConnection, root: impl Into<PathBuf>) -> Self {
        Self {
            db,
            root: root.into(),
        }
    }

    /// Private files need an admin or an enrollment for the owning course or program
    pub async fn can_access(&self, actor: &Actor, owner_id: Uuid) -> Result<bool, ServiceError> {
        if actor.is_admin() {
            return Ok(true);
        }
        Ok(Enrollment::find_by_id((actor.user_id, owner_id))
            .one(&self.db)
            .await?
            .is_some())
    }

    #[instrument(skip(self, actor), fields(user_id = %actor.user_id))]
    pub async fn open_media(&self, file_id: Uuid, actor: &Actor) -> Result<MediaContent, ServiceError> {
        let file = MediaFile::find_by_id(file_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("media file {}", file_id)))?;

        if file.is_private && !self.can_access(actor, file.owner_id).await? {
            return Err(ServiceError::Forbidden(
                "enrollment required to access this file".to_string(),
            ));
        }

        let relative = Path::new(&file.stored_path);
        if !is_contained(relative) {
            warn!(%file_id, "stored path escapes the media directory");
            return Err(ServiceError::InternalError("invalid media path".to_string()));
        }

        let path = self.root.join(relative);
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ServiceError::NotFound(format!("media content for {}", file_id))
            }
            _ => ServiceError::InternalError(format!("failed to read media: {}", e)),
        })?;
        if !metadata.is_file() {
            return Err(ServiceError::NotFound(format!("media content for {}", file_id)));
        }

        Ok(MediaContent {
            file_name: file.file_name,
            mime_type: file.mime_type,
            path,
            size: metadata.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_plain_relative_paths_are_contained() {
        assert!(is_contained(Path::new("courses/intro.mp4")));
        assert!(!is_contained(Path::new("../secrets.txt")));
        assert!(!is_contained(Path::new("/etc/passwd")));
        assert!(!is_contained(Path::new("a/../../b")));
    }
}
