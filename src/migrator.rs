use anyhow::Result;
use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::prelude::*;
use std::time::Duration;
use tracing::{error, info};

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_quotes_table::Migration),
            Box::new(m20240601_000002_create_payments_table::Migration),
            Box::new(m20240601_000003_create_meetings_table::Migration),
            Box::new(m20240601_000004_create_notifications_table::Migration),
        ]
    }
}

mod m20240601_000001_create_quotes_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_quotes_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Quotes::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Quotes::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Quotes::QuoteNumber).string_len(16).not_null())
                        .col(ColumnDef::new(Quotes::UserId).uuid().not_null())
                        .col(ColumnDef::new(Quotes::OwnerEmail).string().null())
                        .col(ColumnDef::new(Quotes::Client).json().not_null())
                        .col(ColumnDef::new(Quotes::Project).json().not_null())
                        .col(ColumnDef::new(Quotes::Items).json().not_null())
                        .col(
                            ColumnDef::new(Quotes::Subtotal)
                                .decimal_len(14, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Quotes::TaxRate)
                                .decimal_len(7, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Quotes::Tax)
                                .decimal_len(14, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Quotes::Discount)
                                .decimal_len(14, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Quotes::Total)
                                .decimal_len(14, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Quotes::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Quotes::EstimateMin).decimal_len(14, 2).null())
                        .col(ColumnDef::new(Quotes::EstimateMax).decimal_len(14, 2).null())
                        .col(ColumnDef::new(Quotes::Notes).text().null())
                        .col(ColumnDef::new(Quotes::Terms).text().null())
                        .col(ColumnDef::new(Quotes::PdfUrl).string().null())
                        .col(ColumnDef::new(Quotes::MeetingIds).json().not_null())
                        .col(ColumnDef::new(Quotes::Status).string_len(16).not_null())
                        .col(
                            ColumnDef::new(Quotes::IssueDate)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Quotes::ValidUntil)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Quotes::SentAt).timestamp_with_time_zone().null())
                        .col(ColumnDef::new(Quotes::ViewedAt).timestamp_with_time_zone().null())
                        .col(
                            ColumnDef::new(Quotes::AcceptedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Quotes::DeclinedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Quotes::DeclineReason).text().null())
                        .col(
                            ColumnDef::new(Quotes::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Quotes::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_quotes_quote_number")
                        .table(Quotes::Table)
                        .col(Quotes::QuoteNumber)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_quotes_user_id")
                        .table(Quotes::Table)
                        .col(Quotes::UserId)
                        .to_owned(),
                )
                .await?;

            // expiry sweep scans by status and deadline
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_quotes_status_valid_until")
                        .table(Quotes::Table)
                        .col(Quotes::Status)
                        .col(Quotes::ValidUntil)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_quotes_created_at")
                        .table(Quotes::Table)
                        .col(Quotes::CreatedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Quotes::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Quotes {
        Table,
        Id,
        QuoteNumber,
        UserId,
        OwnerEmail,
        Client,
        Project,
        Items,
        Subtotal,
        TaxRate,
        Tax,
        Discount,
        Total,
        Currency,
        EstimateMin,
        EstimateMax,
        Notes,
        Terms,
        PdfUrl,
        MeetingIds,
        Status,
        IssueDate,
        ValidUntil,
        SentAt,
        ViewedAt,
        AcceptedAt,
        DeclinedAt,
        DeclineReason,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000002_create_payments_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_payments_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Payments::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Payments::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Payments::UserId).uuid().not_null())
                        .col(ColumnDef::new(Payments::Amount).decimal_len(14, 2).not_null())
                        .col(ColumnDef::new(Payments::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Payments::Status).string_len(16).not_null())
                        .col(
                            ColumnDef::new(Payments::PaymentMethod)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Payments::PaymentIntentId).string().null())
                        .col(ColumnDef::new(Payments::SquarePaymentId).string().null())
                        .col(ColumnDef::new(Payments::Description).text().null())
                        .col(ColumnDef::new(Payments::Metadata).json().null())
                        .col(ColumnDef::new(Payments::LineItems).json().not_null())
                        .col(ColumnDef::new(Payments::BillingDetails).json().null())
                        .col(ColumnDef::new(Payments::ReceiptUrl).string().null())
                        .col(
                            ColumnDef::new(Payments::RefundedAmount)
                                .decimal_len(14, 2)
                                .null(),
                        )
                        .col(ColumnDef::new(Payments::RefundReason).text().null())
                        .col(
                            ColumnDef::new(Payments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // NULLs do not collide, so each provider id is unique only when present
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_payment_intent_id")
                        .table(Payments::Table)
                        .col(Payments::PaymentIntentId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_square_payment_id")
                        .table(Payments::Table)
                        .col(Payments::SquarePaymentId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_user_id")
                        .table(Payments::Table)
                        .col(Payments::UserId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Payments::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Payments {
        Table,
        Id,
        UserId,
        Amount,
        Currency,
        Status,
        PaymentMethod,
        PaymentIntentId,
        SquarePaymentId,
        Description,
        Metadata,
        LineItems,
        BillingDetails,
        ReceiptUrl,
        RefundedAmount,
        RefundReason,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000003_create_meetings_table {
    use super::m20240601_000001_create_quotes_table::Quotes;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_meetings_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Meetings::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Meetings::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Meetings::QuoteId).uuid().not_null())
                        .col(ColumnDef::new(Meetings::OrganizerId).uuid().not_null())
                        .col(ColumnDef::new(Meetings::Title).string().not_null())
                        .col(ColumnDef::new(Meetings::Description).text().null())
                        .col(
                            ColumnDef::new(Meetings::StartsAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Meetings::DurationMinutes)
                                .integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Meetings::Location).string().null())
                        .col(ColumnDef::new(Meetings::MeetingUrl).string().null())
                        .col(ColumnDef::new(Meetings::Attendees).json().not_null())
                        .col(ColumnDef::new(Meetings::Status).string_len(16).not_null())
                        .col(
                            ColumnDef::new(Meetings::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_meetings_quote_id")
                                .from(Meetings::Table, Meetings::QuoteId)
                                .to(Quotes::Table, Quotes::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_meetings_quote_id")
                        .table(Meetings::Table)
                        .col(Meetings::QuoteId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Meetings::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Meetings {
        Table,
        Id,
        QuoteId,
        OrganizerId,
        Title,
        Description,
        StartsAt,
        DurationMinutes,
        Location,
        MeetingUrl,
        Attendees,
        Status,
        CreatedAt,
    }
}

mod m20240601_000004_create_notifications_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000004_create_notifications_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Notifications::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Notifications::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Notifications::UserId).uuid().not_null())
                        .col(ColumnDef::new(Notifications::Kind).string_len(32).not_null())
                        .col(ColumnDef::new(Notifications::Title).string().not_null())
                        .col(ColumnDef::new(Notifications::Message).text().not_null())
                        .col(ColumnDef::new(Notifications::ReferenceId).uuid().null())
                        .col(
                            ColumnDef::new(Notifications::Read)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Notifications::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_notifications_user_id")
                        .table(Notifications::Table)
                        .col(Notifications::UserId)
                        .col(Notifications::Read)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Notifications::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Notifications {
        Table,
        Id,
        UserId,
        Kind,
        Title,
        Message,
        ReferenceId,
        Read,
        CreatedAt,
    }
}

/// Database migration CLI runner
pub async fn run_migration(db_url: &str) -> Result<()> {
    info!("Setting up database connection for migrations");

    let mut opt = ConnectOptions::new(db_url);
    opt.max_connections(2)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;

    info!("Running database migrations");

    match Migrator::up(&db, None).await {
        Ok(_) => {
            info!("Migrations completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Migration failed: {}", e);
            Err(e.into())
        }
    }
}
