//! SeaORM-backed [`CodeStore`] for SQLite and PostgreSQL.
//!
//! Every state change is a single conditional statement whose `WHERE` clause
//! carries the precondition (status and deadline); `rows_affected` decides the
//! winner, so no row locks or transactions are needed.

use super::{AuthorizationRequest, CodeStore, Lookup, RequestStatus, Resolution, TokenBundle};
use crate::clock::Clock;
use crate::codes;
use crate::entities;
use crate::errors::{DeviceLinkError, StoreError};
use crate::settings::Database as DbCfg;
use async_trait::async_trait;
use migration::MigratorTrait;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, Database, DatabaseConnection, EntityTrait,
    QueryFilter, Set, SqlErr,
};
use std::sync::Arc;

const STATUS_PENDING: &str = "pending";
const STATUS_AUTHORIZED: &str = "authorized";
const STATUS_DENIED: &str = "denied";

/// Connect and bring the schema up to date.
pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, DeviceLinkError> {
    let db = Database::connect(&cfg.url).await?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

#[derive(Clone)]
pub struct SqlCodeStore {
    db: DatabaseConnection,
    clock: Arc<dyn Clock>,
}

impl SqlCodeStore {
    pub fn new(db: DatabaseConnection, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn find(
        &self,
        column: entities::device_code::Column,
        value: String,
    ) -> Result<Lookup, StoreError> {
        use entities::device_code::Entity;

        let now = self.clock.now();
        match Entity::find().filter(column.eq(value)).one(&self.db).await? {
            Some(dc) if dc.expires_at < now => Ok(Lookup::Expired {
                device_code: dc.device_code,
                client_id: dc.client_id,
            }),
            Some(dc) => Ok(Lookup::Live(dc.try_into()?)),
            None => Ok(Lookup::Absent),
        }
    }
}

impl TryFrom<entities::device_code::Model> for AuthorizationRequest {
    type Error = StoreError;

    fn try_from(dc: entities::device_code::Model) -> Result<Self, Self::Error> {
        let status = match dc.status.as_str() {
            STATUS_PENDING => RequestStatus::Pending,
            STATUS_DENIED => RequestStatus::Denied,
            STATUS_AUTHORIZED => match (dc.subject, dc.access_token, dc.id_token, dc.refresh_token)
            {
                (Some(subject), Some(access_token), Some(id_token), Some(refresh_token)) => {
                    RequestStatus::Authorized {
                        subject,
                        tokens: TokenBundle {
                            access_token,
                            id_token,
                            refresh_token,
                        },
                    }
                }
                _ => {
                    return Err(StoreError::Corrupt(format!(
                        "authorized device code {} is missing subject or tokens",
                        dc.device_code
                    )))
                }
            },
            other => {
                return Err(StoreError::Corrupt(format!(
                    "unknown status {:?} on device code {}",
                    other, dc.device_code
                )))
            }
        };

        Ok(AuthorizationRequest {
            device_code: dc.device_code,
            user_code: dc.user_code,
            client_id: dc.client_id,
            scope: dc.scope,
            status,
            interval: dc.interval,
            created_at: dc.created_at,
            expires_at: dc.expires_at,
        })
    }
}

#[async_trait]
impl CodeStore for SqlCodeStore {
    async fn create(&self, request: &AuthorizationRequest) -> Result<(), StoreError> {
        use entities::device_code::{Column, Entity};

        let now = self.clock.now();
        let user_code = codes::normalize(&request.user_code);

        // Expired rows the sweep has not reached yet still hold their codes in the indexes
        Entity::delete_many()
            .filter(Column::ExpiresAt.lt(now))
            .filter(
                Condition::any()
                    .add(Column::DeviceCode.eq(request.device_code.as_str()))
                    .add(Column::UserCode.eq(user_code.as_str())),
            )
            .exec(&self.db)
            .await?;

        let device_code_model = entities::device_code::ActiveModel {
            device_code: Set(request.device_code.clone()),
            user_code: Set(user_code),
            client_id: Set(request.client_id.clone()),
            scope: Set(request.scope.clone()),
            status: Set(STATUS_PENDING.to_string()),
            subject: Set(None),
            access_token: Set(None),
            id_token: Set(None),
            refresh_token: Set(None),
            interval: Set(request.interval),
            created_at: Set(request.created_at),
            expires_at: Set(request.expires_at),
        };

        match device_code_model.insert(&self.db).await {
            Ok(_) => Ok(()),
            Err(e) => match e.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(_)) => Err(StoreError::AlreadyExists),
                _ => Err(e.into()),
            },
        }
    }

    async fn get_by_device_code(&self, device_code: &str) -> Result<Lookup, StoreError> {
        self.find(
            entities::device_code::Column::DeviceCode,
            device_code.to_string(),
        )
        .await
    }

    async fn get_by_user_code(&self, user_code: &str) -> Result<Lookup, StoreError> {
        self.find(
            entities::device_code::Column::UserCode,
            codes::normalize(user_code),
        )
        .await
    }

    async fn transition(
        &self,
        device_code: &str,
        resolution: Resolution,
    ) -> Result<(), StoreError> {
        use entities::device_code::{Column, Entity};

        let now = self.clock.now();
        let update = Entity::update_many();
        let update = match resolution {
            Resolution::Authorized { subject, tokens } => update
                .col_expr(Column::Status, Expr::value(STATUS_AUTHORIZED))
                .col_expr(Column::Subject, Expr::value(Some(subject)))
                .col_expr(Column::AccessToken, Expr::value(Some(tokens.access_token)))
                .col_expr(Column::IdToken, Expr::value(Some(tokens.id_token)))
                .col_expr(
                    Column::RefreshToken,
                    Expr::value(Some(tokens.refresh_token)),
                ),
            Resolution::Denied => update.col_expr(Column::Status, Expr::value(STATUS_DENIED)),
        };

        let result = update
            .filter(Column::DeviceCode.eq(device_code))
            .filter(Column::Status.eq(STATUS_PENDING))
            .filter(Column::ExpiresAt.gte(now))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 1 {
            Ok(())
        } else {
            Err(StoreError::InvalidState)
        }
    }

    async fn fetch_and_delete(
        &self,
        device_code: &str,
    ) -> Result<Option<AuthorizationRequest>, StoreError> {
        use entities::device_code::{Column, Entity};

        let now = self.clock.now();
        let live_authorized = Condition::all()
            .add(Column::DeviceCode.eq(device_code))
            .add(Column::Status.eq(STATUS_AUTHORIZED))
            .add(Column::ExpiresAt.gte(now));

        // Authorized rows are immutable, so reading first is safe; the delete decides who wins.
        let Some(dc) = Entity::find()
            .filter(live_authorized.clone())
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };

        let result = Entity::delete_many()
            .filter(live_authorized)
            .exec(&self.db)
            .await?;

        if result.rows_affected == 1 {
            Ok(Some(dc.try_into()?))
        } else {
            Ok(None)
        }
    }

    async fn delete(&self, device_code: &str) -> Result<(), StoreError> {
        use entities::device_code::{Column, Entity};

        Entity::delete_many()
            .filter(Column::DeviceCode.eq(device_code))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        use entities::device_code::{Column, Entity};

        let now = self.clock.now();

        let result = Entity::delete_many()
            .filter(Column::ExpiresAt.lt(now))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected)
    }
}
