use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter};

use crate::entities::quote::{Column, Entity as QuoteEntity};
use crate::errors::ServiceError;

/// How many sequence numbers an insert tries before giving up.
pub const MAX_NUMBER_ATTEMPTS: u64 = 5;

/// `Q-{YY}-{MM}-{NNNN}`, sequence zero-padded to at least four digits.
pub fn format_quote_number(at: DateTime<Utc>, sequence: u64) -> String {
    format!(
        "Q-{:02}-{:02}-{:04}",
        at.year().rem_euclid(100),
        at.month(),
        sequence
    )
}

/// First instant of the month containing `at` and of the month after it.
pub fn month_bounds(at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc
        .with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(at);
    let end = start.checked_add_months(Months::new(1)).unwrap_or(start);
    (start, end)
}

/// Sequence number the next quote created at `at` should carry:
/// quotes already created in that calendar month, plus one.
pub async fn next_sequence<C: ConnectionTrait>(
    db: &C,
    at: DateTime<Utc>,
) -> Result<u64, ServiceError> {
    let (start, end) = month_bounds(at);
    let existing = QuoteEntity::find()
        .filter(Column::CreatedAt.gte(start))
        .filter(Column::CreatedAt.lt(end))
        .count(db)
        .await?;
    Ok(existing + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig, DbPool};
    use crate::entities::quote::{self, ClientInfo, MeetingIds, ProjectDetails, QuoteItems, QuoteStatus};
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use sea_orm::{ActiveModelTrait, Set};
    use uuid::Uuid;

    async fn store_quote_created_at(db: &DbPool, number: &str, created_at: DateTime<Utc>) {
        quote::ActiveModel {
            id: Set(Uuid::new_v4()),
            quote_number: Set(number.to_string()),
            user_id: Set(Uuid::new_v4()),
            owner_email: Set(None),
            client: Set(ClientInfo {
                name: "Dana".into(),
                email: "dana@example.com".into(),
                ..Default::default()
            }),
            project: Set(ProjectDetails {
                title: "Site".into(),
                description: "Marketing site".into(),
                ..Default::default()
            }),
            items: Set(QuoteItems::default()),
            subtotal: Set(Decimal::ZERO),
            tax_rate: Set(Decimal::ZERO),
            tax: Set(Decimal::ZERO),
            discount: Set(Decimal::ZERO),
            total: Set(Decimal::ZERO),
            currency: Set("USD".into()),
            estimate_min: Set(None),
            estimate_max: Set(None),
            notes: Set(None),
            terms: Set(None),
            pdf_url: Set(None),
            meeting_ids: Set(MeetingIds::default()),
            status: Set(QuoteStatus::Draft),
            issue_date: Set(created_at),
            valid_until: Set(created_at),
            sent_at: Set(None),
            viewed_at: Set(None),
            accepted_at: Set(None),
            declined_at: Set(None),
            decline_reason: Set(None),
            created_at: Set(created_at),
            updated_at: Set(created_at),
        }
        .insert(db)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn sequence_counts_only_the_current_month() {
        let db = establish_connection_with_config(&DbConfig::sqlite_memory())
            .await
            .unwrap();
        run_migrations(&db).await.unwrap();
        let utc = |y, m, d, h| Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap();

        store_quote_created_at(&db, "Q-24-05-0001", utc(2024, 5, 31, 23)).await;
        store_quote_created_at(&db, "Q-24-06-0001", utc(2024, 6, 1, 0)).await;
        store_quote_created_at(&db, "Q-24-06-0002", utc(2024, 6, 10, 9)).await;
        store_quote_created_at(&db, "Q-24-07-0001", utc(2024, 7, 1, 0)).await;

        let at = utc(2024, 6, 15, 10);
        let next = next_sequence(&db, at).await.unwrap();
        assert_eq!(next, 3);
        assert_eq!(format_quote_number(at, next), "Q-24-06-0003");
        assert_eq!(next_sequence(&db, utc(2024, 8, 1, 0)).await.unwrap(), 1);
    }

    #[test]
    fn third_quote_of_june_2024() {
        let at = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        assert_eq!(format_quote_number(at, 3), "Q-24-06-0003");
    }

    #[test]
    fn sequence_beyond_four_digits_widens() {
        let at = Utc.with_ymd_and_hms(2031, 12, 1, 0, 0, 0).unwrap();
        assert_eq!(format_quote_number(at, 12345), "Q-31-12-12345");
    }

    #[test]
    fn december_bounds_roll_into_next_year() {
        let at = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        let (start, end) = month_bounds(at);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }

    proptest! {
        #[test]
        fn number_shape_holds(year in 2000i32..2100, month in 1u32..=12, seq in 1u64..10_000) {
            let at = Utc.with_ymd_and_hms(year, month, 1, 12, 0, 0).unwrap();
            let number = format_quote_number(at, seq);
            let parts: Vec<&str> = number.split('-').collect();
            prop_assert_eq!(parts.len(), 4);
            prop_assert_eq!(parts[0], "Q");
            prop_assert_eq!(parts[1].len(), 2);
            prop_assert_eq!(parts[2].parse::<u32>().unwrap(), month);
            prop_assert_eq!(parts[3].len(), 4);
            prop_assert_eq!(parts[3].parse::<u64>().unwrap(), seq);
        }
    }
}
