use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // One row per outstanding device authorization request
        manager
            .create_table(
                Table::create()
                    .table(DeviceAuth::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeviceAuth::DeviceCode)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(DeviceAuth::UserCode))
                    .col(string_null(DeviceAuth::UserId))
                    .col(
                        ColumnDef::new(DeviceAuth::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(string(DeviceAuth::ClientIp))
                    .col(string(DeviceAuth::UserAgent))
                    .col(big_integer(DeviceAuth::CreatedAt))
                    .col(big_integer(DeviceAuth::ExpiresAt))
                    .col(big_integer_null(DeviceAuth::GrantedAt))
                    .to_owned(),
            )
            .await?;

        // Approver lookups by user_code
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_auth_user_code")
                    .table(DeviceAuth::Table)
                    .col(DeviceAuth::UserCode)
                    .to_owned(),
            )
            .await?;

        // Bulk cleanup by expiry
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_auth_expires_at")
                    .table(DeviceAuth::Table)
                    .col(DeviceAuth::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        // A user_code may only belong to one pending request at a time.
        // Partial indexes are understood by both SQLite and PostgreSQL.
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_device_auth_pending_user_code \
                 ON device_auth (user_code) WHERE status = 'pending'",
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DeviceAuth::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DeviceAuth {
    Table,
    DeviceCode,
    UserCode,
    UserId,
    Status,
    ClientIp,
    UserAgent,
    CreatedAt,
    ExpiresAt,
    GrantedAt,
}
