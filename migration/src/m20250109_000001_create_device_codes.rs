use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // In-flight device authorization requests (RFC 8628)
        manager
            .create_table(
                Table::create()
                    .table(DeviceCode::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeviceCode::DeviceCode)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DeviceCode::UserCode).string().not_null())
                    .col(ColumnDef::new(DeviceCode::ClientId).string().not_null())
                    .col(ColumnDef::new(DeviceCode::Scope).string().not_null())
                    .col(
                        ColumnDef::new(DeviceCode::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(DeviceCode::Subject).string())
                    .col(ColumnDef::new(DeviceCode::AccessToken).text())
                    .col(ColumnDef::new(DeviceCode::IdToken).text())
                    .col(ColumnDef::new(DeviceCode::RefreshToken).text())
                    .col(
                        ColumnDef::new(DeviceCode::Interval)
                            .big_integer()
                            .not_null()
                            .default(5),
                    )
                    .col(
                        ColumnDef::new(DeviceCode::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DeviceCode::ExpiresAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Secondary index: user codes must be unique so verification lookups are unambiguous
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_codes_user_code")
                    .table(DeviceCode::Table)
                    .col(DeviceCode::UserCode)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Create index on expires_at for efficient cleanup job
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_codes_expires_at")
                    .table(DeviceCode::Table)
                    .col(DeviceCode::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DeviceCode::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DeviceCode {
    #[sea_orm(iden = "device_codes")]
    Table,
    DeviceCode,
    UserCode,
    ClientId,
    Scope,
    Status,
    Subject,
    AccessToken,
    IdToken,
    RefreshToken,
    Interval,
    CreatedAt,
    ExpiresAt,
}
