use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::auth::Actor;
use crate::db::DbPool;
use crate::entities::notification::{
    self, ActiveModel as NotificationActiveModel, Entity as NotificationEntity, NotificationKind,
};
use crate::errors::ServiceError;

/// An in-app notification about to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub reference_id: Option<Uuid>,
}

/// Writes `new` on `conn`, which may be an open transaction.
pub async fn insert_notification<C: ConnectionTrait>(
    conn: &C,
    new: NewNotification,
) -> Result<notification::Model, ServiceError> {
    let model = NotificationActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(new.user_id),
        kind: Set(new.kind),
        title: Set(new.title),
        message: Set(new.message),
        reference_id: Set(new.reference_id),
        read: Set(false),
        created_at: Set(Utc::now()),
    };
    let saved = model.insert(conn).await?;
    debug!(notification_id = %saved.id, kind = %saved.kind, "notification stored");
    Ok(saved)
}

#[derive(Clone)]
pub struct NotificationService {
    db: Arc<DbPool>,
}

impl NotificationService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    pub async fn notify(&self, new: NewNotification) -> Result<notification::Model, ServiceError> {
        insert_notification(&*self.db, new).await
    }

    /// The actor's own notifications, newest first.
    #[instrument(skip(self))]
    pub async fn list(
        &self,
        actor: &Actor,
        unread_only: bool,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<notification::Model>, u64), ServiceError> {
        let mut query = NotificationEntity::find()
            .filter(notification::Column::UserId.eq(actor.user_id))
            .order_by_desc(notification::Column::CreatedAt);
        if unread_only {
            query = query.filter(notification::Column::Read.eq(false));
        }

        let paginator = query.paginate(&*self.db, per_page.max(1));
        let total = paginator.num_items().await?;
        let items = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((items, total))
    }

    #[instrument(skip(self))]
    pub async fn mark_read(
        &self,
        actor: &Actor,
        id: Uuid,
    ) -> Result<notification::Model, ServiceError> {
        let found = NotificationEntity::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Notification {} not found", id)))?;

        if found.user_id != actor.user_id {
            return Err(ServiceError::Forbidden(
                "not allowed to access this notification".to_string(),
            ));
        }
        if found.read {
            return Ok(found);
        }

        let mut active: NotificationActiveModel = found.into();
        active.read = Set(true);
        Ok(active.update(&*self.db).await?)
    }
}
