use anyhow::Result;
use chrono_tz::Tz;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Fallback when a customer carries no usable timezone. Matches the
/// registry's own column default.
pub const FALLBACK_TIMEZONE: Tz = chrono_tz::Asia::Kolkata;

#[derive(Debug, Clone, FromRow)]
pub struct MachineRow {
    pub id: Uuid,
    pub device_id: Option<String>,
    pub customer_id: Uuid,
}

#[derive(Debug, Clone, FromRow)]
struct CustomerTimezoneRow {
    timezone: Option<String>,
}

pub async fn list_active_machines(pool: &PgPool) -> Result<Vec<MachineRow>> {
    let rows: Vec<MachineRow> = sqlx::query_as(
        r#"
        SELECT id, device_id, customer_id
        FROM machines
        WHERE is_active = TRUE
        ORDER BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Timezone used for all local-day computations for a customer's machines.
/// An unknown customer is a lookup error; an absent or unparseable timezone
/// name falls back to `default`.
pub async fn customer_timezone(pool: &PgPool, customer_id: Uuid, default: Tz) -> Result<Tz> {
    let row: Option<CustomerTimezoneRow> = sqlx::query_as(
        r#"
        SELECT timezone
        FROM customers
        WHERE id = $1
        "#,
    )
    .bind(customer_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        anyhow::bail!("customer {customer_id} not found");
    };

    Ok(parse_timezone(row.timezone.as_deref(), default))
}

pub fn parse_timezone(name: Option<&str>, default: Tz) -> Tz {
    let Some(trimmed) = name.map(str::trim).filter(|value| !value.is_empty()) else {
        return default;
    };
    match trimmed.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::warn!(timezone = trimmed, "unparseable customer timezone, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_timezone_accepts_iana_names() {
        assert_eq!(
            parse_timezone(Some("Europe/Berlin"), FALLBACK_TIMEZONE),
            chrono_tz::Europe::Berlin
        );
        assert_eq!(
            parse_timezone(Some(" Asia/Kolkata "), chrono_tz::UTC),
            chrono_tz::Asia::Kolkata
        );
    }

    #[test]
    fn parse_timezone_falls_back_on_missing_or_invalid() {
        assert_eq!(parse_timezone(None, FALLBACK_TIMEZONE), FALLBACK_TIMEZONE);
        assert_eq!(parse_timezone(Some(""), FALLBACK_TIMEZONE), FALLBACK_TIMEZONE);
        assert_eq!(
            parse_timezone(Some("Mars/Olympus"), FALLBACK_TIMEZONE),
            FALLBACK_TIMEZONE
        );
    }
}
