//! Create captured_requests and unknown_requests tables

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CapturedRequest::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CapturedRequest::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(CapturedRequest::Subdomain)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CapturedRequest::ClientIp)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(CapturedRequest::Method).string().not_null())
                    .col(ColumnDef::new(CapturedRequest::Path).string().not_null())
                    .col(ColumnDef::new(CapturedRequest::Host).string())
                    .col(ColumnDef::new(CapturedRequest::Headers).text().not_null())
                    .col(ColumnDef::new(CapturedRequest::Body).text())
                    .col(ColumnDef::new(CapturedRequest::Status).integer())
                    .col(ColumnDef::new(CapturedRequest::ResponseHeaders).text())
                    .col(ColumnDef::new(CapturedRequest::ResponseBody).text())
                    .col(
                        ColumnDef::new(CapturedRequest::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(CapturedRequest::RespondedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(CapturedRequest::LatencyMs).integer())
                    .col(ColumnDef::new(CapturedRequest::Outcome).string())
                    .col(ColumnDef::new(CapturedRequest::Country).string())
                    .col(ColumnDef::new(CapturedRequest::Region).string())
                    .col(ColumnDef::new(CapturedRequest::City).string())
                    .col(ColumnDef::new(CapturedRequest::Latitude).double())
                    .col(ColumnDef::new(CapturedRequest::Longitude).double())
                    .col(ColumnDef::new(CapturedRequest::Isp).string())
                    .col(ColumnDef::new(CapturedRequest::EnrichedAt).timestamp_with_time_zone())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_captured_requests_subdomain")
                    .table(CapturedRequest::Table)
                    .col(CapturedRequest::Subdomain)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_captured_requests_created_at")
                    .table(CapturedRequest::Table)
                    .col(CapturedRequest::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(UnknownRequest::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UnknownRequest::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(UnknownRequest::Subdomain)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UnknownRequest::ClientIp)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(UnknownRequest::Method).string().not_null())
                    .col(ColumnDef::new(UnknownRequest::Path).string().not_null())
                    .col(ColumnDef::new(UnknownRequest::Host).string())
                    .col(ColumnDef::new(UnknownRequest::Headers).text().not_null())
                    .col(
                        ColumnDef::new(UnknownRequest::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(UnknownRequest::Country).string())
                    .col(ColumnDef::new(UnknownRequest::Region).string())
                    .col(ColumnDef::new(UnknownRequest::City).string())
                    .col(ColumnDef::new(UnknownRequest::Latitude).double())
                    .col(ColumnDef::new(UnknownRequest::Longitude).double())
                    .col(ColumnDef::new(UnknownRequest::Isp).string())
                    .col(ColumnDef::new(UnknownRequest::EnrichedAt).timestamp_with_time_zone())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_unknown_requests_subdomain")
                    .table(UnknownRequest::Table)
                    .col(UnknownRequest::Subdomain)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UnknownRequest::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(CapturedRequest::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CapturedRequest {
    #[sea_orm(iden = "captured_requests")]
    Table,
    Id,
    Subdomain,
    ClientIp,
    Method,
    Path,
    Host,
    Headers,
    Body,
    Status,
    ResponseHeaders,
    ResponseBody,
    CreatedAt,
    RespondedAt,
    LatencyMs,
    Outcome,
    Country,
    Region,
    City,
    Latitude,
    Longitude,
    Isp,
    EnrichedAt,
}

#[derive(DeriveIden)]
enum UnknownRequest {
    #[sea_orm(iden = "unknown_requests")]
    Table,
    Id,
    Subdomain,
    ClientIp,
    Method,
    Path,
    Host,
    Headers,
    CreatedAt,
    Country,
    Region,
    City,
    Latitude,
    Longitude,
    Isp,
    EnrichedAt,
}
